//! In-memory scripted transport
//!
//! Devices live in a slot map and react to commands the way real hardware
//! would at the mode level: `EnterDfu` moves the device to DFU, `Restore`
//! reboots it into Normal, and so on. Individual commands can be scripted to
//! fail, stall, leave the device untouched, or drop it off the bus.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{
    CommandAck, CommandKind, CommandTarget, DeviceCommand, DeviceTransport, TransportError,
};
use crate::device::{DeviceIdentity, DeviceKey, DeviceSnapshot, FirmwareVersion, Mode, SlotId};

/// A simulated attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
    pub identity: DeviceIdentity,
    pub product_type: Option<String>,
    pub firmware: Option<FirmwareVersion>,
    pub mode: Mode,
}

impl SimulatedDevice {
    /// Device identified by ECID with a parsed firmware version
    ///
    /// An unparsable firmware string leaves the version unknown.
    pub fn new(ecid: &str, firmware: &str, mode: Mode) -> Self {
        Self {
            identity: DeviceIdentity {
                ecid: Some(ecid.to_string()),
                udid: None,
                serial: None,
                imei: None,
            },
            product_type: None,
            firmware: firmware.parse().ok(),
            mode,
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.identity.serial = Some(serial.to_string());
        self
    }

    pub fn with_product_type(mut self, product_type: &str) -> Self {
        self.product_type = Some(product_type.to_string());
        self
    }

    pub fn key(&self) -> Option<DeviceKey> {
        self.identity.key()
    }
}

/// Scripted driver behavior for the next command of a given kind
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Acknowledge and apply the command's effect
    Ack,
    /// Acknowledge but leave the device unchanged
    AckWithoutEffect,
    /// Fail with the given error, device unchanged
    Fail(TransportError),
    /// Acknowledge, then remove the device from the bus
    Detach,
    /// Wait, then behave like the inner reply; `cancel_outstanding` interrupts the wait
    Delayed(Duration, Box<ScriptedReply>),
}

/// One command as the driver received it
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub key: DeviceKey,
    pub command: DeviceCommand,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct SimState {
    devices: BTreeMap<SlotId, SimulatedDevice>,
    scripts: HashMap<(DeviceKey, CommandKind), VecDeque<ScriptedReply>>,
    default_delay: Option<Duration>,
    enumerate_failures: u32,
    log: Vec<CommandRecord>,
    in_flight: HashMap<DeviceKey, usize>,
    max_in_flight: HashMap<DeviceKey, usize>,
    cancel_requests: HashMap<DeviceKey, usize>,
    cancel_signals: HashMap<DeviceKey, Arc<Notify>>,
}

/// Scripted transport for tests and `--simulate` runs
#[derive(Default)]
pub struct SimulatedTransport {
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attach
    pub fn with_device(self, slot: &str, device: SimulatedDevice) -> Self {
        self.attach(slot, device);
        self
    }

    pub fn attach(&self, slot: &str, device: SimulatedDevice) {
        self.state.lock().devices.insert(SlotId::new(slot), device);
    }

    pub fn detach(&self, slot: &str) -> Option<SimulatedDevice> {
        self.state.lock().devices.remove(&SlotId::new(slot))
    }

    /// Change a device's mode out-of-band (user pressed buttons, device rebooted)
    pub fn set_mode(&self, slot: &str, mode: Mode) {
        if let Some(device) = self.state.lock().devices.get_mut(&SlotId::new(slot)) {
            device.mode = mode;
        }
    }

    pub fn device(&self, slot: &str) -> Option<SimulatedDevice> {
        self.state.lock().devices.get(&SlotId::new(slot)).cloned()
    }

    /// Queue a reply for the next command of `kind` sent to `key`
    pub fn script(&self, key: &DeviceKey, kind: CommandKind, reply: ScriptedReply) {
        self.state
            .lock()
            .scripts
            .entry((key.clone(), kind))
            .or_default()
            .push_back(reply);
    }

    /// Delay applied to every unscripted command
    pub fn set_default_delay(&self, delay: Option<Duration>) {
        self.state.lock().default_delay = delay;
    }

    /// Make the next `count` enumerations fail
    pub fn fail_enumerations(&self, count: u32) {
        self.state.lock().enumerate_failures = count;
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.state.lock().log.clone()
    }

    pub fn commands_for(&self, key: &DeviceKey) -> Vec<DeviceCommand> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| &r.key == key)
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Highest number of simultaneously executing commands seen for a device
    pub fn max_in_flight(&self, key: &DeviceKey) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn cancel_requests(&self, key: &DeviceKey) -> usize {
        self.state
            .lock()
            .cancel_requests
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn begin_command(
        &self,
        target: &CommandTarget,
        command: &DeviceCommand,
    ) -> (ScriptedReply, Arc<Notify>) {
        let mut state = self.state.lock();

        state.log.push(CommandRecord {
            key: target.key.clone(),
            command: command.clone(),
            at: Utc::now(),
        });

        let count = state.in_flight.entry(target.key.clone()).or_insert(0);
        *count += 1;
        let current = *count;
        let max = state.max_in_flight.entry(target.key.clone()).or_insert(0);
        *max = (*max).max(current);

        let scripted = state
            .scripts
            .get_mut(&(target.key.clone(), command.kind()))
            .and_then(VecDeque::pop_front);
        let reply = match (scripted, state.default_delay) {
            (Some(reply), _) => reply,
            (None, Some(delay)) => ScriptedReply::Delayed(delay, Box::new(ScriptedReply::Ack)),
            (None, None) => ScriptedReply::Ack,
        };

        let notify = Arc::clone(
            state
                .cancel_signals
                .entry(target.key.clone())
                .or_insert_with(|| Arc::new(Notify::new())),
        );

        (reply, notify)
    }

    fn end_command(&self, key: &DeviceKey) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }

    fn apply(
        &self,
        target: &CommandTarget,
        command: &DeviceCommand,
        reply: ScriptedReply,
    ) -> Result<CommandAck, TransportError> {
        let mut state = self.state.lock();

        match reply {
            ScriptedReply::Fail(err) => Err(err),
            ScriptedReply::AckWithoutEffect => Ok(CommandAck::default()),
            ScriptedReply::Detach => {
                state.devices.remove(&target.slot);
                Ok(CommandAck::with_message("device left the bus"))
            }
            ScriptedReply::Ack | ScriptedReply::Delayed(..) => {
                let device = state
                    .devices
                    .get_mut(&target.slot)
                    .ok_or_else(|| TransportError::Disconnected(target.slot.to_string()))?;

                if let Some(mode) = resulting_mode(command) {
                    device.mode = mode;
                }

                match command {
                    DeviceCommand::BackupTokens => Ok(CommandAck::with_artifact(
                        format!("tokens:{}", target.key).into_bytes(),
                    )),
                    _ => Ok(CommandAck::default()),
                }
            }
        }
    }
}

/// Mode a device ends up in after a command succeeds
fn resulting_mode(command: &DeviceCommand) -> Option<Mode> {
    match command {
        DeviceCommand::EnterRecovery => Some(Mode::Recovery),
        DeviceCommand::EnterDfu => Some(Mode::Dfu),
        DeviceCommand::ExitToNormal | DeviceCommand::Restore | DeviceCommand::Jailbreak { .. } => {
            Some(Mode::Normal)
        }
        DeviceCommand::EnterPurple => Some(Mode::Purple),
        DeviceCommand::LoadBootFiles { .. } | DeviceCommand::BootRamdisk { .. } => {
            Some(Mode::BootFiles)
        }
        DeviceCommand::BackupTokens | DeviceCommand::Activate { .. } | DeviceCommand::DisableFmi => {
            None
        }
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn enumerate(&self) -> Result<Vec<SlotId>, TransportError> {
        let mut state = self.state.lock();
        if state.enumerate_failures > 0 {
            state.enumerate_failures -= 1;
            return Err(TransportError::Io("simulated enumeration failure".into()));
        }
        Ok(state.devices.keys().cloned().collect())
    }

    async fn describe(&self, slot: &SlotId) -> Result<DeviceSnapshot, TransportError> {
        let state = self.state.lock();
        let device = state
            .devices
            .get(slot)
            .ok_or_else(|| TransportError::NotFound(slot.to_string()))?;

        let mut snapshot = DeviceSnapshot::new(
            slot.clone(),
            device.identity.clone(),
            device.firmware,
            device.mode,
        );
        snapshot.product_type.clone_from(&device.product_type);
        Ok(snapshot)
    }

    async fn send_command(
        &self,
        target: &CommandTarget,
        command: &DeviceCommand,
    ) -> Result<CommandAck, TransportError> {
        debug!("Simulated command {command} for {}", target.key);

        let (mut reply, cancel) = self.begin_command(target, command);

        while let ScriptedReply::Delayed(delay, inner) = reply {
            reply = tokio::select! {
                _ = tokio::time::sleep(delay) => *inner,
                _ = cancel.notified() => ScriptedReply::Fail(TransportError::Cancelled),
            };
        }

        let result = self.apply(target, command, reply);
        self.end_command(&target.key);
        result
    }

    async fn cancel_outstanding(&self, key: &DeviceKey) -> Result<(), TransportError> {
        let notify = {
            let mut state = self.state.lock();
            *state.cancel_requests.entry(key.clone()).or_insert(0) += 1;
            state.cancel_signals.get(key).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        Ok(())
    }
}
