//! Permitted mode transitions

use serde::{Deserialize, Serialize};

use crate::{
    device::{FirmwareVersion, Mode},
    transport::DeviceCommand,
};

/// Who is asking for a transition
///
/// Some pairs are only allowed when a user explicitly asked for them from the
/// toolbox; workflows may not drive a device there on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionOrigin {
    Workflow,
    Toolbox,
}

/// Result of checking a (current, target) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Device is already in the target mode; nothing to issue
    AlreadyThere,
    /// Issue the mapped command
    Allowed,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Yes,
    No,
    Explicit,
}

fn rule(from: Mode, to: Mode) -> Rule {
    use Mode::*;
    use Rule::*;

    match (from, to) {
        (_, Normal) => Yes,
        (Normal | Recovery | Dfu, Recovery | Dfu) => Yes,
        (Recovery | Dfu, BootFiles) => Yes,
        (Normal | Recovery | Dfu, Purple) => Explicit,
        (BootFiles, BootFiles) => Explicit,
        _ => No,
    }
}

fn rejection(from: Mode, to: Mode) -> String {
    match (from, to) {
        (_, Mode::Unknown) => "Unknown is not a valid target mode".to_string(),
        (Mode::Unknown, _) => format!("device mode unknown; only Normal can be requested, not {to}"),
        (_, Mode::BootFiles) => "BootFiles reachable only from Recovery/DFU".to_string(),
        (Mode::BootFiles | Mode::Purple, _) => format!("{from} can only exit to Normal"),
        _ => format!("{from} → {to} is not a permitted transition"),
    }
}

/// Check a transition against the table
pub fn check(from: Mode, to: Mode, origin: TransitionOrigin) -> Verdict {
    if to == Mode::Unknown {
        return Verdict::Rejected(rejection(from, to));
    }
    // Re-entering BootFiles reloads the boot files, so it is not a no-op
    if from == to && to != Mode::BootFiles {
        return Verdict::AlreadyThere;
    }

    match rule(from, to) {
        Rule::Yes => Verdict::Allowed,
        Rule::Explicit if origin == TransitionOrigin::Toolbox => Verdict::Allowed,
        Rule::Explicit => Verdict::Rejected(format!(
            "{from} → {to} requires an explicit toolbox request"
        )),
        Rule::No => Verdict::Rejected(rejection(from, to)),
    }
}

/// Driver command that moves a device into `target`
///
/// `None` for targets no command can reach.
pub fn command_for(target: Mode, firmware: Option<FirmwareVersion>) -> Option<DeviceCommand> {
    match target {
        Mode::Normal => Some(DeviceCommand::ExitToNormal),
        Mode::Recovery => Some(DeviceCommand::EnterRecovery),
        Mode::Dfu => Some(DeviceCommand::EnterDfu),
        Mode::Purple => Some(DeviceCommand::EnterPurple),
        Mode::BootFiles => Some(DeviceCommand::LoadBootFiles { firmware }),
        Mode::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use TransitionOrigin::*;

    #[test]
    fn test_table_matches_permitted_pairs() {
        use Mode::*;
        let allowed = |from, to| check(from, to, Workflow) == Verdict::Allowed;

        assert!(allowed(Normal, Recovery));
        assert!(allowed(Normal, Dfu));
        assert!(allowed(Recovery, BootFiles));
        assert!(allowed(Dfu, BootFiles));
        assert!(allowed(BootFiles, Normal));
        assert!(allowed(Purple, Normal));
        assert!(allowed(Unknown, Normal));

        assert!(!allowed(Normal, BootFiles));
        assert!(!allowed(BootFiles, Recovery));
        assert!(!allowed(BootFiles, Dfu));
        assert!(!allowed(Purple, Dfu));
        assert!(!allowed(Unknown, Recovery));
    }

    #[test]
    fn test_bootfiles_rejection_reason() {
        assert_eq!(
            check(Mode::Normal, Mode::BootFiles, Workflow),
            Verdict::Rejected("BootFiles reachable only from Recovery/DFU".into())
        );
        assert_eq!(
            check(Mode::Purple, Mode::BootFiles, Toolbox),
            Verdict::Rejected("BootFiles reachable only from Recovery/DFU".into())
        );
    }

    #[test]
    fn test_explicit_pairs_need_toolbox_origin() {
        assert!(matches!(
            check(Mode::Normal, Mode::Purple, Workflow),
            Verdict::Rejected(_)
        ));
        assert_eq!(check(Mode::Normal, Mode::Purple, Toolbox), Verdict::Allowed);
        assert!(matches!(
            check(Mode::BootFiles, Mode::BootFiles, Workflow),
            Verdict::Rejected(_)
        ));
        assert_eq!(
            check(Mode::BootFiles, Mode::BootFiles, Toolbox),
            Verdict::Allowed
        );
    }

    #[test]
    fn test_same_mode_is_noop() {
        for mode in [Mode::Normal, Mode::Recovery, Mode::Dfu, Mode::Purple] {
            assert_eq!(check(mode, mode, Workflow), Verdict::AlreadyThere);
        }
        assert!(matches!(
            check(Mode::Unknown, Mode::Unknown, Toolbox),
            Verdict::Rejected(_)
        ));
    }

    #[test]
    fn test_command_mapping() {
        let fw = Some(FirmwareVersion::new(15, 7, 0));
        assert_eq!(
            command_for(Mode::BootFiles, fw),
            Some(DeviceCommand::LoadBootFiles { firmware: fw })
        );
        assert_eq!(command_for(Mode::Dfu, None), Some(DeviceCommand::EnterDfu));
        assert_eq!(command_for(Mode::Unknown, None), None);
    }
}
