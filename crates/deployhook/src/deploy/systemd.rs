use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use regex::Regex;

use super::command;
use super::record::StepLog;
use super::ServiceSupervisor;
use crate::system::{PrivilegeWrapper, SYSTEMCTL_BIN};

const MAX_UNIT_NAME_LEN: usize = 256;

/// Drives the long-running service through `systemctl`. systemd keeps at most one
/// instance of the unit alive, so stop/start never leaves two processes on the port.
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    unit: String,
    privilege_wrapper: PrivilegeWrapper,
    command_timeout: Duration,
}

impl SystemdSupervisor {
    /// # Errors
    /// Returns an error if `unit` is not a plain systemd unit name.
    pub fn new(
        unit: &str,
        privilege_wrapper: PrivilegeWrapper,
        command_timeout: Duration,
    ) -> Result<Self> {
        Self::validate_unit_name(unit)?;

        Ok(Self {
            unit: unit.to_string(),
            privilege_wrapper,
            command_timeout,
        })
    }

    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// # Errors
    /// Returns an error if `unit` contains anything beyond unit-name characters or could
    /// be mistaken for a flag.
    pub fn validate_unit_name(unit: &str) -> Result<()> {
        let regex = Regex::new(r"^[A-Za-z0-9@._:-]+$")
            .map_err(|error| anyhow!("invalid unit name validator: {error}"))?;

        if unit.starts_with('-') || unit.len() > MAX_UNIT_NAME_LEN || !regex.is_match(unit) {
            bail!("service name must be a plain systemd unit name: {unit:?}");
        }

        Ok(())
    }

    async fn systemctl(&self, verb: &str, log: &mut StepLog) -> Result<command::CommandOutput> {
        let args = [verb, self.unit.as_str()];
        let command = self.privilege_wrapper.command(SYSTEMCTL_BIN, &args)?;
        let display = self.privilege_wrapper.display(SYSTEMCTL_BIN, &args);
        command::run(command, &display, self.command_timeout, log).await
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    async fn stop(&self, log: &mut StepLog) -> Result<()> {
        self.systemctl("stop", log)
            .await?
            .into_checked(&format!("systemctl stop {}", self.unit))?;
        Ok(())
    }

    async fn start(&self, log: &mut StepLog) -> Result<()> {
        self.systemctl("start", log)
            .await?
            .into_checked(&format!("systemctl start {}", self.unit))?;
        Ok(())
    }

    async fn is_active(&self, log: &mut StepLog) -> Result<bool> {
        // `is-active` exits non-zero for inactive and failed units; only spawn errors count.
        let output = self.systemctl("is-active", log).await?;
        Ok(output.success && output.stdout.trim() == "active")
    }
}
