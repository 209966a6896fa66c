//! Engine façade
//!
//! Wires every component from one [`Config`], one transport and one event
//! sink, and owns the lifecycle of the monitor task.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    access::{AccessPolicy, StaticPolicy},
    capabilities::{CompatibilityProbe, CompatibilityTable},
    config::Config,
    device::DeviceSnapshot,
    events::EventSink,
    monitor::DeviceMonitor,
    registry::DeviceRegistry,
    toolbox::ToolboxDispatcher,
    transition::ModeTransitionEngine,
    transport::DeviceTransport,
    workflow::BypassWorkflow,
};

/// Fully wired orchestration engine
pub struct Engine {
    monitor: Arc<DeviceMonitor>,
    probe: Arc<CompatibilityProbe>,
    transitions: Arc<ModeTransitionEngine>,
    workflows: BypassWorkflow,
    toolbox: ToolboxDispatcher,
    shutdown: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build from config with the access policy in `config.access`
    pub fn new(
        config: &Config,
        transport: Arc<dyn DeviceTransport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let access = StaticPolicy::new(config.access.allowed_operations.iter().cloned());
        Self::with_access(config, transport, events, Arc::new(access))
    }

    pub fn with_access(
        config: &Config,
        transport: Arc<dyn DeviceTransport>,
        events: Arc<dyn EventSink>,
        access: Arc<dyn AccessPolicy>,
    ) -> Result<Self> {
        let table = CompatibilityTable::load_or_default(config.compatibility.table_path.as_deref())
            .context("Failed to load compatibility table")?;
        let probe = Arc::new(CompatibilityProbe::new(table));

        let monitor = Arc::new(DeviceMonitor::new(
            Arc::clone(&transport),
            Arc::new(DeviceRegistry::new()),
            Arc::clone(&events),
            config.monitor.poll_interval(),
            config.monitor.buffer,
        ));

        let transitions = Arc::new(ModeTransitionEngine::new(
            transport,
            Arc::clone(&monitor),
            Arc::clone(&probe),
            Arc::clone(&events),
            config.transition.confirm_timeout(),
            config.transition.cancel_settle(),
        ));

        let workflows = BypassWorkflow::new(
            Arc::clone(&transitions),
            Arc::clone(&probe),
            Arc::clone(&events),
            config.workflow.max_step_attempts,
        );
        let toolbox = ToolboxDispatcher::new(Arc::clone(&transitions), access, events)
            .with_ramdisk(config.toolbox.ramdisk_path.clone());

        Ok(Self {
            monitor,
            probe,
            transitions,
            workflows,
            toolbox,
            shutdown: CancellationToken::new(),
            monitor_task: Mutex::new(None),
        })
    }

    /// Run one poll, then keep polling in the background
    pub async fn start(&self) {
        self.monitor.poll_once().await;

        let mut task = self.monitor_task.lock();
        if task.is_none() {
            *task = Some(self.monitor.spawn(self.shutdown.child_token()));
            info!("Engine started");
        }
    }

    /// Stop the monitor task and wait for it to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.monitor_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {e}");
            }
        }
        info!("Engine stopped");
    }

    pub fn monitor(&self) -> &Arc<DeviceMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.monitor.registry()
    }

    pub fn probe(&self) -> &CompatibilityProbe {
        &self.probe
    }

    pub fn transitions(&self) -> &ModeTransitionEngine {
        &self.transitions
    }

    pub fn workflows(&self) -> &BypassWorkflow {
        &self.workflows
    }

    pub fn toolbox(&self) -> &ToolboxDispatcher {
        &self.toolbox
    }

    /// Present devices, ordered by key
    pub fn devices(&self) -> Vec<Arc<DeviceSnapshot>> {
        self.registry().devices()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceKey, Mode},
        events::NullSink,
        toolbox::ToolboxOperation,
        transport::{SimulatedDevice, SimulatedTransport},
        workflow::StepOutcome,
    };

    fn fast_config() -> Config {
        let mut config = Config::default_config().unwrap();
        config.monitor.poll_interval_ms = 10;
        config.transition.confirm_timeout_ms = 2000;
        config
    }

    #[tokio::test]
    async fn test_engine_lists_devices_after_start() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_device("usb-1", SimulatedDevice::new("ecid-1", "15.7", Mode::Normal))
                .with_device("usb-2", SimulatedDevice::new("ecid-2", "16.1", Mode::Dfu)),
        );
        let engine = Engine::new(&fast_config(), transport, Arc::new(NullSink)).unwrap();

        engine.start().await;
        let devices = engine.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].mode, Mode::Dfu);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_applies_access_config() {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_device("usb-1", SimulatedDevice::new("ecid-1", "15.7", Mode::Normal)),
        );
        let mut config = fast_config();
        config.access.allowed_operations = vec!["exit-to-normal".into()];
        let engine = Engine::new(&config, transport, Arc::new(NullSink)).unwrap();
        engine.start().await;

        let report = engine
            .toolbox()
            .run(
                &DeviceKey::new("ecid-1"),
                ToolboxOperation::ExitToDfu,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.outcome, StepOutcome::FatalFailure);
        assert_eq!(report.detail, "not permitted");

        engine.shutdown().await;
    }

    #[test]
    fn test_missing_compat_table_fails() {
        let mut config = fast_config();
        config.compatibility.table_path = Some("/nonexistent/compat.toml".into());
        let result = Engine::new(
            &config,
            Arc::new(SimulatedTransport::new()),
            Arc::new(NullSink),
        );
        assert!(result.is_err());
    }
}
