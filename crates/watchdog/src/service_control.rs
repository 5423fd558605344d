use crate::sources::{SourceError, run_command};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("corrective action timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not run corrective action: {0}")]
    Spawn(String),
    #[error("corrective action exited unsuccessfully: {0}")]
    ExitStatus(String),
}

impl From<SourceError> for ActionError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::Timeout(limit) => Self::Timeout(limit),
            other => Self::Spawn(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
pub trait CorrectiveAction: Send + Sync {
    async fn perform(&self, target: &str) -> Result<(), ActionError>;
}

/// Restarts a systemd unit through `sudo systemctl restart`.
#[derive(Debug, Clone)]
pub struct SystemdRestart {
    timeout: Duration,
    use_sudo: bool,
}

impl SystemdRestart {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            use_sudo: true,
        }
    }

    pub fn without_sudo(mut self) -> Self {
        self.use_sudo = false;
        self
    }
}

#[async_trait::async_trait]
impl CorrectiveAction for SystemdRestart {
    async fn perform(&self, target: &str) -> Result<(), ActionError> {
        let output = if self.use_sudo {
            run_command("sudo", &["systemctl", "restart", target], self.timeout).await?
        } else {
            run_command("systemctl", &["restart", target], self.timeout).await?
        };

        if !output.success {
            return Err(ActionError::ExitStatus(output.stderr.trim().to_owned()));
        }

        info!(unit = target, "systemd restart issued");
        Ok(())
    }
}
