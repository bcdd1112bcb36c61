use std::collections::HashSet;

use anyhow::{anyhow, Result};
use tokio::process::Command;

pub const SYSTEMCTL_BIN: &str = "/usr/bin/systemctl";
const SUDO_BIN: &str = "/usr/bin/sudo";

mod validators;

/// Builds commands for the few privileged binaries the deployer may touch, optionally
/// through `sudo -n`.
#[derive(Debug, Clone)]
pub struct PrivilegeWrapper {
    allowed_binaries: HashSet<&'static str>,
    use_sudo: bool,
}

impl PrivilegeWrapper {
    #[must_use]
    pub fn new(use_sudo: bool) -> Self {
        let allowed_binaries = HashSet::from([SYSTEMCTL_BIN]);

        Self {
            allowed_binaries,
            use_sudo,
        }
    }

    /// Returns a ready-to-spawn command for an allowlisted binary.
    ///
    /// # Errors
    /// Returns an error if `binary_path` is not allowlisted or the arguments fail
    /// validation.
    pub fn command(&self, binary_path: &str, args: &[&str]) -> Result<Command> {
        if !self.allowed_binaries.contains(binary_path) {
            return Err(anyhow!("binary path is not allowed: {binary_path}"));
        }

        validators::validate_command_args(binary_path, args)?;

        let command = if self.use_sudo {
            let mut command = Command::new(SUDO_BIN);
            command.arg("-n").arg(binary_path).args(args);
            command
        } else {
            let mut command = Command::new(binary_path);
            command.args(args);
            command
        };

        Ok(command)
    }

    /// Human-readable form of the command `command` would build.
    #[must_use]
    pub fn display(&self, binary_path: &str, args: &[&str]) -> String {
        let prefix = if self.use_sudo { "sudo -n " } else { "" };
        format!("{prefix}{binary_path} {}", args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_rejects_disallowed_binary_paths() {
        let wrapper = PrivilegeWrapper::new(true);
        let error = wrapper
            .command("/bin/echo", &["hello"])
            .expect_err("should reject");
        assert!(format!("{error:#}").contains("binary path is not allowed"));
    }

    #[test]
    fn command_rejects_invalid_args_before_building() {
        let wrapper = PrivilegeWrapper::new(false);
        let error = wrapper
            .command(SYSTEMCTL_BIN, &["daemon-reload"])
            .expect_err("should reject invalid args");
        assert!(format!("{error:#}").contains("systemctl arguments are not allowed"));
    }

    #[test]
    fn command_prefixes_sudo_when_enabled() {
        let wrapper = PrivilegeWrapper::new(true);
        let command = wrapper
            .command(SYSTEMCTL_BIN, &["start", "chatbot.service"])
            .expect("allowed");
        assert_eq!(command.as_std().get_program(), SUDO_BIN);
        assert_eq!(
            wrapper.display(SYSTEMCTL_BIN, &["stop", "chatbot"]),
            "sudo -n /usr/bin/systemctl stop chatbot"
        );

        let plain = PrivilegeWrapper::new(false)
            .command(SYSTEMCTL_BIN, &["is-active", "chatbot"])
            .expect("allowed");
        assert_eq!(plain.as_std().get_program(), SYSTEMCTL_BIN);
    }
}
