use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::command;
use super::record::StepLog;
use super::DependencySync;

/// Splits a configured command line into program and arguments. Shell syntax is
/// rejected because the command is executed directly, never through a shell.
///
/// # Errors
/// Returns an error if the command is empty or contains shell control characters.
pub(crate) fn parse_command(raw_command: &str) -> Result<(String, Vec<String>)> {
    let trimmed_command = raw_command.trim();
    if trimmed_command.is_empty() {
        bail!("command cannot be empty");
    }

    let forbidden_characters = [';', '|', '&', '>', '<', '`', '$', '\n', '\r'];
    if trimmed_command
        .chars()
        .any(|character| forbidden_characters.contains(&character))
    {
        bail!("command contains unsupported shell control characters");
    }

    let mut parts = trimmed_command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow!("command program is missing"))?
        .to_string();
    let arguments = parts.map(ToString::to_string).collect::<Vec<String>>();

    Ok((program, arguments))
}

/// Runs the configured install command (for example `venv/bin/pip install -r
/// requirements.txt`) inside the working tree.
#[derive(Debug, Clone)]
pub struct CommandDependencySync {
    program: PathBuf,
    arguments: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandDependencySync {
    /// # Errors
    /// Returns an error if `command_line` is not a plain command.
    pub fn from_command_line(
        command_line: &str,
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        let (program, arguments) = parse_command(command_line)?;

        // Relative paths with a separator are resolved against the working tree so
        // `venv/bin/pip` means the project's virtualenv.
        let program_path = PathBuf::from(&program);
        let program = if program.contains('/') && program_path.is_relative() {
            working_dir.join(program_path)
        } else {
            program_path
        };

        Ok(Self {
            program,
            arguments,
            working_dir: working_dir.to_path_buf(),
            timeout,
        })
    }

    fn display(&self) -> String {
        let mut display = self.program.display().to_string();
        for argument in &self.arguments {
            display.push(' ');
            display.push_str(argument);
        }
        display
    }
}

#[async_trait]
impl DependencySync for CommandDependencySync {
    async fn sync(&self, log: &mut StepLog) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(&self.arguments).current_dir(&self.working_dir);

        command::run_checked(command, &self.display(), self.timeout, log).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_splits_program_and_arguments() {
        let (program, arguments) =
            parse_command("  pip install -r requirements.txt ").expect("parse");
        assert_eq!(program, "pip");
        assert_eq!(arguments, vec!["install", "-r", "requirements.txt"]);
    }

    #[test]
    fn parse_command_rejects_shell_syntax() {
        assert!(parse_command("").is_err());
        assert!(parse_command("pip install && reboot").is_err());
        assert!(parse_command("pip install $(whoami)").is_err());
        assert!(parse_command("pip install > /dev/null").is_err());
    }

    #[test]
    fn relative_program_paths_resolve_inside_the_tree() {
        let sync = CommandDependencySync::from_command_line(
            "venv/bin/pip install -r requirements.txt",
            Path::new("/srv/chatbot"),
            Duration::from_secs(60),
        )
        .expect("valid");
        assert_eq!(
            sync.display(),
            "/srv/chatbot/venv/bin/pip install -r requirements.txt"
        );

        let bare = CommandDependencySync::from_command_line(
            "npm ci",
            Path::new("/srv/web"),
            Duration::from_secs(60),
        )
        .expect("valid");
        assert_eq!(bare.display(), "npm ci");
    }

    #[tokio::test]
    async fn sync_reports_failing_install_commands() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let sync = CommandDependencySync::from_command_line(
            "false",
            tempdir.path(),
            Duration::from_secs(5),
        )
        .expect("valid");
        let mut log = StepLog::new();

        assert!(sync.sync(&mut log).await.is_err());
        assert_eq!(log.lines()[0], "$ false");
    }
}
