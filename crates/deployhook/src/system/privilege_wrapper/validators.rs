use anyhow::{anyhow, Result};

use super::SYSTEMCTL_BIN;
use crate::deploy::systemd::SystemdSupervisor;

pub(super) fn validate_command_args(binary_path: &str, args: &[&str]) -> Result<()> {
    match binary_path {
        SYSTEMCTL_BIN => validate_systemctl_args(args),
        _ => Err(anyhow!("unsupported binary path: {binary_path}")),
    }
}

fn validate_systemctl_args(args: &[&str]) -> Result<()> {
    if args.len() == 2
        && matches!(args[0], "start" | "stop" | "is-active")
        && SystemdSupervisor::validate_unit_name(args[1]).is_ok()
    {
        return Ok(());
    }

    Err(anyhow!("systemctl arguments are not allowed: {args:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemctl_accepts_lifecycle_verbs_for_a_single_unit() {
        for verb in ["start", "stop", "is-active"] {
            validate_command_args(SYSTEMCTL_BIN, &[verb, "chatbot.service"]).expect("allowed");
        }
    }

    #[test]
    fn systemctl_rejects_other_shapes() {
        assert!(validate_command_args(SYSTEMCTL_BIN, &["stop"]).is_err());
        assert!(validate_command_args(SYSTEMCTL_BIN, &["disable", "chatbot"]).is_err());
        assert!(validate_command_args(SYSTEMCTL_BIN, &["restart", "chatbot"]).is_err());
        assert!(validate_command_args(SYSTEMCTL_BIN, &["stop", "--all"]).is_err());
        assert!(validate_command_args(SYSTEMCTL_BIN, &["stop", "a", "b"]).is_err());
        assert!(validate_command_args("/usr/bin/rm", &["-rf", "/"]).is_err());
    }
}
