use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::command::{self, CommandOutput};
use super::record::StepLog;
use super::{SourceControl, SyncedTree};

/// Name checks applied before any value reaches a git command line.
#[derive(Debug)]
pub struct Git;

impl Git {
    /// # Errors
    /// Returns an error if `branch` could be parsed by git as an option or a revision
    /// expression.
    pub fn validate_branch(branch: &str) -> Result<()> {
        let regex = Regex::new(r"^[A-Za-z0-9._/-]+$")
            .map_err(|error| anyhow!("invalid branch validator: {error}"))?;

        if !regex.is_match(branch)
            || branch.starts_with('-')
            || branch.starts_with('/')
            || branch.ends_with('/')
            || branch.ends_with(".lock")
            || branch.contains("..")
            || branch.contains("//")
        {
            bail!("branch must match ^[A-Za-z0-9._/-]+$ and be a valid ref name: {branch:?}");
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error unless `sha` is 4 to 40 hex characters, the abbreviation range git
    /// itself accepts.
    pub fn validate_commit(sha: &str) -> Result<()> {
        let regex = Regex::new(r"^[0-9a-fA-F]{4,40}$")
            .map_err(|error| anyhow!("invalid commit validator: {error}"))?;

        if !regex.is_match(sha) {
            bail!("commit id must be 4-40 hex characters: {sha:?}");
        }

        Ok(())
    }
}

/// Working tree that is moved to exactly match a remote commit.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    repo_dir: PathBuf,
    remote: String,
    command_timeout: Duration,
}

impl GitWorkspace {
    /// # Errors
    /// Returns an error if the remote name is not usable on a git command line.
    pub fn new(repo_dir: &Path, remote: &str, command_timeout: Duration) -> Result<Self> {
        Git::validate_branch(remote).context("invalid remote name")?;

        Ok(Self {
            repo_dir: repo_dir.to_path_buf(),
            remote: remote.to_string(),
            command_timeout,
        })
    }

    fn git(&self, args: &[&str]) -> (Command, String) {
        let mut command = Command::new("git");
        command
            .arg("-C")
            .arg(&self.repo_dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0");
        (command, format!("git {}", args.join(" ")))
    }

    async fn run(&self, args: &[&str], log: &mut StepLog) -> Result<CommandOutput> {
        let (command, display) = self.git(args);
        command::run(command, &display, self.command_timeout, log).await
    }

    async fn run_checked(&self, args: &[&str], log: &mut StepLog) -> Result<CommandOutput> {
        let (command, display) = self.git(args);
        command::run_checked(command, &display, self.command_timeout, log).await
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{branch}", self.remote)
    }
}

#[async_trait]
impl SourceControl for GitWorkspace {
    async fn current_commit(&self, log: &mut StepLog) -> Result<Option<String>> {
        let output = self.run(&["rev-parse", "--verify", "HEAD"], log).await?;
        if !output.success {
            return Ok(None);
        }

        Ok(Some(output.stdout.trim().to_string()).filter(|sha| !sha.is_empty()))
    }

    async fn sync_to(
        &self,
        branch: &str,
        commit_sha: Option<&str>,
        log: &mut StepLog,
    ) -> Result<SyncedTree> {
        Git::validate_branch(branch)?;
        if let Some(sha) = commit_sha {
            Git::validate_commit(sha)?;
        }

        if !self.repo_dir.join(".git").exists() {
            bail!("working tree is not a git checkout: {}", self.repo_dir.display());
        }

        let remote_ref = self.remote_ref(branch);
        let refspec = format!("+refs/heads/{branch}:{remote_ref}");
        self.run_checked(&["fetch", "--prune", &self.remote, &refspec], log)
            .await?;

        // Everything up to here leaves the working tree untouched.
        let target = match commit_sha {
            Some(sha) => {
                let expression = format!("{sha}^{{commit}}");
                let resolved = self
                    .run_checked(&["rev-parse", "--verify", &expression], log)
                    .await
                    .with_context(|| format!("commit {sha} is not available after fetch"))?;
                let target = resolved.stdout.trim().to_string();

                let ancestry = self
                    .run(&["merge-base", "--is-ancestor", &target, &remote_ref], log)
                    .await?;
                if !ancestry.success {
                    bail!("commit {sha} is not part of {}/{branch}", self.remote);
                }
                target
            }
            None => self
                .run_checked(&["rev-parse", "--verify", &remote_ref], log)
                .await?
                .stdout
                .trim()
                .to_string(),
        };

        // Untracked files are runtime data and are not counted or removed.
        let discarded_changes = !self
            .run_checked(&["status", "--porcelain", "--untracked-files=no"], log)
            .await?
            .stdout
            .trim()
            .is_empty();
        if discarded_changes {
            log.note("discarding local edits to tracked files");
        }

        self.run_checked(&["checkout", "--force", "-B", branch, &target], log)
            .await?;
        self.run_checked(&["reset", "--hard", &target], log).await?;

        Ok(SyncedTree {
            commit: target,
            discarded_changes,
        })
    }

    async fn changed_files(&self, from: &str, to: &str, log: &mut StepLog) -> Result<Vec<String>> {
        let output = self
            .run_checked(&["diff", "--name-only", from, to], log)
            .await?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_branch_accepts_real_branch_names() {
        for branch in [
            "main",
            "master",
            "release/1.2",
            "claude/fix-image-analysis-error-TN7ai",
        ] {
            Git::validate_branch(branch).expect("valid branch");
        }
    }

    #[test]
    fn validate_branch_rejects_options_and_revision_syntax() {
        for branch in [
            "",
            "-f",
            "--upload-pack=x",
            "main..evil",
            "main~1",
            "main^",
            "a b",
            "main.lock",
            "/main",
            "main/",
        ] {
            assert!(Git::validate_branch(branch).is_err(), "{branch:?} should fail");
        }
    }

    #[test]
    fn validate_commit_requires_hex() {
        Git::validate_commit("abc123").expect("short sha");
        Git::validate_commit("0123456789abcdef0123456789abcdef01234567").expect("full sha");
        assert!(Git::validate_commit("abc").is_err());
        assert!(Git::validate_commit("0123456789abcdef0123456789abcdef012345678").is_err());
        assert!(Git::validate_commit("HEAD~1").is_err());
        assert!(Git::validate_commit("--all").is_err());
    }

    #[tokio::test]
    async fn sync_to_refuses_a_directory_without_a_checkout() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let workspace =
            GitWorkspace::new(tempdir.path(), "origin", Duration::from_secs(5)).expect("valid");
        let mut log = StepLog::new();

        let error = workspace
            .sync_to("main", None, &mut log)
            .await
            .expect_err("not a checkout");
        assert!(format!("{error:#}").contains("not a git checkout"));
        assert!(log.lines().is_empty());
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn git_in(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(["-c", "user.name=deploy-test", "-c", "user.email=deploy@test.invalid"])
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn commit_file(dir: &Path, name: &str, contents: &str) -> String {
        std::fs::write(dir.join(name), contents).expect("write file");
        git_in(dir, &["add", name]);
        git_in(dir, &["commit", "-q", "-m", name]);
        git_in(dir, &["rev-parse", "HEAD"])
    }

    #[tokio::test]
    async fn sync_to_hard_resets_to_the_remote_branch() {
        if !git_available() {
            return;
        }

        let tempdir = tempfile::tempdir().expect("tempdir");
        let upstream = tempdir.path().join("upstream");
        let work = tempdir.path().join("work");
        std::fs::create_dir_all(&upstream).expect("mkdir");
        git_in(&upstream, &["init", "-q"]);
        git_in(&upstream, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        let first = commit_file(&upstream, "app.py", "print('v1')\n");
        git_in(
            tempdir.path(),
            &["clone", "-q", &upstream.to_string_lossy(), &work.to_string_lossy()],
        );
        let second = commit_file(&upstream, "requirements.txt", "flask\n");

        std::fs::write(work.join("app.py"), "local drift\n").expect("drift");
        std::fs::write(work.join("chat.db"), "runtime data\n").expect("untracked");

        let workspace = GitWorkspace::new(&work, "origin", Duration::from_secs(30)).expect("valid");
        let mut log = StepLog::new();

        assert_eq!(
            workspace.current_commit(&mut log).await.expect("head"),
            Some(first.clone())
        );
        let synced = workspace.sync_to("main", None, &mut log).await.expect("sync");
        assert_eq!(synced.commit, second);
        assert!(synced.discarded_changes);
        assert_eq!(
            std::fs::read_to_string(work.join("app.py")).expect("read"),
            "print('v1')\n"
        );
        assert!(work.join("chat.db").exists());
        assert_eq!(
            workspace
                .changed_files(&first, &second, &mut log)
                .await
                .expect("diff"),
            vec!["requirements.txt".to_string()]
        );

        let pinned = workspace
            .sync_to("main", Some(&first[..10]), &mut log)
            .await
            .expect("pinned sync");
        assert_eq!(pinned.commit, first);
        assert!(!pinned.discarded_changes);
        assert!(!work.join("requirements.txt").exists());

        let missing = workspace
            .sync_to("main", Some("deadbeefdeadbeef"), &mut log)
            .await
            .expect_err("unknown commit");
        assert!(format!("{missing:#}").contains("not available"));
        assert_eq!(
            workspace.current_commit(&mut log).await.expect("head"),
            Some(first)
        );
    }

    #[tokio::test]
    async fn sync_to_reports_edits_discarded_at_an_unchanged_head() {
        if !git_available() {
            return;
        }

        let tempdir = tempfile::tempdir().expect("tempdir");
        let upstream = tempdir.path().join("upstream");
        let work = tempdir.path().join("work");
        std::fs::create_dir_all(&upstream).expect("mkdir");
        git_in(&upstream, &["init", "-q"]);
        git_in(&upstream, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        let head = commit_file(&upstream, "app.py", "print('v1')\n");
        git_in(
            tempdir.path(),
            &["clone", "-q", &upstream.to_string_lossy(), &work.to_string_lossy()],
        );

        std::fs::write(work.join("app.py"), "print('hotfix')\n").expect("hotfix");
        std::fs::write(work.join("chat.db"), "runtime data\n").expect("untracked");

        let workspace = GitWorkspace::new(&work, "origin", Duration::from_secs(30)).expect("valid");
        let mut log = StepLog::new();

        let first = workspace
            .sync_to("main", Some(&head), &mut log)
            .await
            .expect("sync");
        assert_eq!(first.commit, head);
        assert!(first.discarded_changes);
        assert_eq!(
            std::fs::read_to_string(work.join("app.py")).expect("read"),
            "print('v1')\n"
        );

        let again = workspace
            .sync_to("main", Some(&head), &mut log)
            .await
            .expect("sync");
        assert!(!again.discarded_changes, "untracked files are not drift");
    }
}
