//! Error presentation for the command line

use tracing::{info, warn};

use crate::{
    config::Config,
    transport::{LibimobiledeviceTransport, TransportError, REQUIRED_TOOLS},
    workflow::WorkflowError,
};

/// Render an error chain with a hint for the failures users can fix
pub fn format_user_error(err: &anyhow::Error) -> String {
    let mut out = format!("Error: {err}\n");

    for cause in err.chain().skip(1) {
        out.push_str(&format!("  caused by: {cause}\n"));
    }

    if let Some(hint) = hint_for(err) {
        out.push_str(&format!("\nHint: {hint}\n"));
    }
    out
}

fn hint_for(err: &anyhow::Error) -> Option<String> {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            return match e {
                TransportError::NotFound(_) | TransportError::Disconnected(_) => Some(
                    "Check the USB cable and that the device trusts this computer, then run `devflow list`."
                        .to_string(),
                ),
                TransportError::Tool { tool, .. } => Some(format!(
                    "`{tool}` failed. Make sure libimobiledevice tools are installed ({}).",
                    REQUIRED_TOOLS.join(", ")
                )),
                TransportError::Unsupported(_) => Some(
                    "The libimobiledevice backend cannot perform this step. Try --simulate to rehearse the workflow."
                        .to_string(),
                ),
                _ => None,
            };
        }
        match cause.downcast_ref::<WorkflowError>() {
            Some(WorkflowError::RunInProgress(key)) => {
                return Some(format!("Wait for the current run on {key} to finish or discard it."));
            }
            Some(WorkflowError::StaleRun(_)) => {
                return Some("Start a new run; this one was already advanced or discarded.".to_string());
            }
            _ => {}
        }
        if cause.to_string().contains("Failed to parse config file") {
            return Some("Run `devflow --show-config` to print a valid default configuration.".to_string());
        }
    }
    None
}

/// Log configuration and backend readiness at startup
pub async fn log_startup_diagnostics(config: &Config) {
    info!(
        "Transport: {} | poll every {} ms | confirm timeout {} ms | max step attempts {}",
        config.transport.backend,
        config.monitor.poll_interval_ms,
        config.transition.confirm_timeout_ms,
        config.workflow.max_step_attempts
    );
    match &config.compatibility.table_path {
        Some(path) => info!("Compatibility table: {}", path.display()),
        None => info!("Compatibility table: built-in"),
    }

    if !config.is_simulated() {
        let missing = LibimobiledeviceTransport::check_dependencies().await;
        if missing.is_empty() {
            info!("All libimobiledevice tools found");
        } else {
            warn!("Missing tools: {}", missing.join(", "));
        }
    }
}
