//! End-to-end scenarios through the engine façade and a simulated transport

use std::{sync::Arc, time::Duration};

use devflow::{
    config::Config,
    device::{DeviceKey, Mode},
    events::{ChannelSink, EngineEvent, EventKind},
    toolbox::ToolboxOperation,
    transition::{TransitionOrigin, TransitionOutcome},
    transport::{
        ActivationFlags, CommandKind, ScriptedReply, SimulatedDevice, SimulatedTransport,
        TransportError,
    },
    workflow::{RunStatus, StepName, StepOutcome, WorkflowKind, WorkflowStart},
    Engine,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

struct Rig {
    engine: Engine,
    transport: Arc<SimulatedTransport>,
    events: UnboundedReceiver<EngineEvent>,
    key: DeviceKey,
}

impl Rig {
    async fn new(firmware: &str, mode: Mode) -> Self {
        Self::with_config(firmware, mode, |_| {}).await
    }

    async fn with_config(firmware: &str, mode: Mode, adjust: impl FnOnce(&mut Config)) -> Self {
        let transport = Arc::new(
            SimulatedTransport::new()
                .with_device("usb-1", SimulatedDevice::new("ecid-1", firmware, mode)),
        );
        let mut config = Config::default_config().unwrap();
        config.monitor.poll_interval_ms = 10;
        config.transition.confirm_timeout_ms = 2000;
        config.transition.cancel_settle_ms = 200;
        adjust(&mut config);

        let (sink, events) = ChannelSink::new();
        let engine = Engine::new(&config, transport.clone(), Arc::new(sink)).unwrap();
        engine.start().await;

        Self {
            engine,
            transport,
            events,
            key: DeviceKey::new("ecid-1"),
        }
    }

    fn command_kinds(&self) -> Vec<CommandKind> {
        self.transport
            .commands_for(&self.key)
            .iter()
            .map(|c| c.kind())
            .collect()
    }

    fn drain_kinds(&mut self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }
}

#[tokio::test]
async fn passcode_screen_from_normal_runs_every_step_once() {
    let mut rig = Rig::new("15.7", Mode::Normal).await;
    let cancel = CancellationToken::new();

    let start = rig
        .engine
        .workflows()
        .start(
            &rig.key,
            WorkflowKind::PasscodeScreen,
            ActivationFlags::default(),
            &cancel,
        )
        .await
        .unwrap();
    let WorkflowStart::Running(run) = start else {
        panic!("expected the run to start, got {start:?}");
    };

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.results().len(), 3);
    assert!(run.artifact(StepName::ProbeAndBackupTokens).is_some());
    assert_eq!(
        rig.command_kinds(),
        vec![
            CommandKind::EnterRecovery,
            CommandKind::LoadBootFiles,
            CommandKind::BackupTokens,
            CommandKind::Activate,
        ]
    );
    assert!(!rig.engine.workflows().has_active_run(&rig.key));

    let kinds = rig.drain_kinds();
    assert!(kinds.contains(&EventKind::RunStarted));
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::StepSucceeded).count(),
        3
    );
    assert_eq!(kinds.last(), Some(&EventKind::RunSucceeded));

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn resume_after_busy_backup_skips_completed_steps() {
    let rig = Rig::new("15.7", Mode::Recovery).await;
    rig.transport.script(
        &rig.key,
        CommandKind::BackupTokens,
        ScriptedReply::Fail(TransportError::Busy("lockdown busy".into())),
    );
    let cancel = CancellationToken::new();
    let workflows = rig.engine.workflows();

    let start = workflows
        .start(
            &rig.key,
            WorkflowKind::PasscodeScreen,
            ActivationFlags::default(),
            &cancel,
        )
        .await
        .unwrap();
    let WorkflowStart::Running(run) = start else {
        panic!("expected the run to start, got {start:?}");
    };
    assert_eq!(run.status(), RunStatus::InProgress);
    assert_eq!(run.checkpoint(), 1);
    assert_eq!(
        run.last_result().map(|r| r.outcome),
        Some(StepOutcome::RetryableFailure)
    );

    let run = workflows.resume(run, &cancel).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);

    let kinds = rig.command_kinds();
    let count = |kind: CommandKind| kinds.iter().filter(|k| **k == kind).count();
    assert_eq!(count(CommandKind::LoadBootFiles), 1);
    assert_eq!(count(CommandKind::BackupTokens), 2);
    assert_eq!(count(CommandKind::Activate), 1);

    // Terminal run: resume touches nothing
    let before = rig.transport.command_count();
    let run = workflows.resume(run, &cancel).await.unwrap();
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(rig.transport.command_count(), before);

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn unsupported_firmware_is_gated_before_any_command() {
    let mut rig = Rig::new("17.1", Mode::Normal).await;

    let start = rig
        .engine
        .workflows()
        .start(
            &rig.key,
            WorkflowKind::HelloScreen,
            ActivationFlags::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let WorkflowStart::Gated(gate) = start else {
        panic!("expected a capability gate, got {start:?}");
    };
    assert!(gate.to_string().contains("hello-screen"));
    assert_eq!(rig.transport.command_count(), 0);
    assert!(rig.drain_kinds().contains(&EventKind::CapabilityGate));

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn toolbox_round_trip_through_dfu() {
    let mut rig = Rig::new("16.1", Mode::Normal).await;
    let cancel = CancellationToken::new();
    let toolbox = rig.engine.toolbox();

    let report = toolbox
        .run(&rig.key, ToolboxOperation::ExitToDfu, &cancel)
        .await;
    assert!(report.is_success(), "{report}");
    assert_eq!(report.mode_after, Some(Mode::Dfu));

    // Already in DFU: succeeds without a second command
    let report = toolbox
        .run(&rig.key, ToolboxOperation::ExitToDfu, &cancel)
        .await;
    assert!(report.is_success());
    assert_eq!(rig.transport.command_count(), 1);

    let report = toolbox
        .run(&rig.key, ToolboxOperation::ExitToNormal, &cancel)
        .await;
    assert!(report.is_success());
    assert_eq!(
        rig.engine.registry().latest(&rig.key).map(|s| s.mode),
        Some(Mode::Normal)
    );

    let kinds = rig.drain_kinds();
    assert_eq!(
        kinds
            .iter()
            .filter(|k| matches!(k, EventKind::ToolboxSucceeded | EventKind::ToolboxFailed))
            .count(),
        3
    );

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn bootfiles_from_normal_is_rejected_without_commands() {
    let rig = Rig::new("15.7", Mode::Normal).await;

    let outcome = rig
        .engine
        .transitions()
        .request_transition(
            &rig.key,
            Mode::BootFiles,
            TransitionOrigin::Workflow,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(
        outcome,
        TransitionOutcome::Rejected("BootFiles reachable only from Recovery/DFU".to_string())
    );
    assert_eq!(rig.transport.command_count(), 0);

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn detach_mid_transition_reports_device_gone() {
    let rig = Rig::new("15.7", Mode::Normal).await;
    rig.transport
        .script(&rig.key, CommandKind::EnterDfu, ScriptedReply::Detach);

    let outcome = rig
        .engine
        .transitions()
        .request_transition(
            &rig.key,
            Mode::Dfu,
            TransitionOrigin::Workflow,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome, TransitionOutcome::DeviceGone);
    rig.engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_workflow_is_aborted_not_failed() {
    let rig = Rig::new("15.7", Mode::Recovery).await;
    rig.transport.script(
        &rig.key,
        CommandKind::LoadBootFiles,
        ScriptedReply::Delayed(Duration::from_secs(5), Box::new(ScriptedReply::Ack)),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let start = rig
        .engine
        .workflows()
        .start(
            &rig.key,
            WorkflowKind::PasscodeScreen,
            ActivationFlags::default(),
            &cancel,
        )
        .await
        .unwrap();
    let WorkflowStart::Running(run) = start else {
        panic!("expected the run to start, got {start:?}");
    };

    assert_eq!(run.status(), RunStatus::Aborted);
    assert!(rig.transport.cancel_requests(&rig.key) >= 1);
    assert!(!rig
        .command_kinds()
        .contains(&CommandKind::BackupTokens));

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn monitor_reports_each_state_once() {
    let rig = Rig::new("15.7", Mode::Normal).await;
    let monitor = rig.engine.monitor();
    let mut subscriber = monitor.subscribe();

    monitor.poll_once().await;
    monitor.poll_once().await;
    rig.transport.set_mode("usb-1", Mode::Recovery);
    monitor.poll_once().await;
    monitor.poll_once().await;
    rig.transport.detach("usb-1");
    monitor.poll_once().await;

    let mut seen = Vec::new();
    while let Some(snapshot) = subscriber.try_next() {
        seen.push(snapshot);
    }
    let modes: Vec<Mode> = seen.iter().map(|s| s.mode).collect();
    for pair in seen.windows(2) {
        assert!(!pair[0].same_state(&pair[1]), "duplicate snapshot {modes:?}");
    }
    assert_eq!(modes.last(), Some(&Mode::Unknown));
    assert!(seen.last().is_some_and(|s| s.is_detached()));
    assert!(rig.engine.registry().latest(&rig.key).is_none());

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn restricted_access_blocks_mode_requests() {
    let mut rig = Rig::with_config("16.1", Mode::Normal, |config| {
        config.access.allowed_operations = vec!["exit-to-recovery".into()];
    })
    .await;
    let cancel = CancellationToken::new();
    let toolbox = rig.engine.toolbox();

    for mode in [Mode::Dfu, Mode::Purple, Mode::Recovery] {
        let operation = ToolboxOperation::for_mode(mode).unwrap();
        let report = toolbox.run(&rig.key, operation, &cancel).await;
        assert_eq!(report.is_success(), mode == Mode::Recovery, "{report}");
    }
    assert_eq!(rig.command_kinds(), vec![CommandKind::EnterRecovery]);

    let kinds = rig.drain_kinds();
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::ToolboxFailed).count(),
        2
    );

    rig.engine.shutdown().await;
}

#[tokio::test]
async fn configured_ramdisk_boots_from_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("ramdisk.img4");
    std::fs::write(&image, b"img4").unwrap();

    let rig = Rig::with_config("15.7", Mode::Recovery, |config| {
        config.toolbox.ramdisk_path = Some(image.clone());
    })
    .await;

    let report = rig
        .engine
        .toolbox()
        .run(&rig.key, ToolboxOperation::BootRamdisk, &CancellationToken::new())
        .await;
    assert!(report.is_success(), "{report}");
    assert_eq!(rig.command_kinds(), vec![CommandKind::BootRamdisk]);

    rig.engine.shutdown().await;
}
