//! System control after a program install
//!
//! Applies the configured restart policy:
//! - `exit`: hand control back to `main`, the service manager starts the new program
//! - `reboot`: run the configured reboot command
//! - `none`: keep running, the new program is picked up on next start

use crate::config::RestartPolicy;
use crate::error::{AgentError, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{error, info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// What the supervisor does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterInstall {
    Continue,
    Exit,
    Rebooting,
}

pub async fn apply_restart_policy(policy: RestartPolicy, reboot_command: &[String]) -> AfterInstall {
    match policy {
        RestartPolicy::None => {
            info!("New program installed, it takes effect on next start");
            AfterInstall::Continue
        }
        RestartPolicy::Exit => {
            info!("New program installed, exiting for restart");
            AfterInstall::Exit
        }
        RestartPolicy::Reboot => match run_command(reboot_command, COMMAND_TIMEOUT).await {
            Ok(output) => {
                info!("Reboot initiated {}", output.trim());
                AfterInstall::Rebooting
            }
            Err(e) => {
                // exiting still lets the service manager start the new program
                error!("Reboot failed: {}", e);
                warn!("Falling back to exit");
                AfterInstall::Exit
            }
        },
    }
}

async fn run_command(argv: &[String], timeout: Duration) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| AgentError::Parse("empty command".to_string()))?;

    let output = tokio::time::timeout(
        timeout,
        AsyncCommand::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| AgentError::Timeout(timeout, program.clone()))??;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(AgentError::Protocol {
            command: argv.join(" "),
            response: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}
