use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::deploy::git::Git;
use crate::deploy::systemd::SystemdSupervisor;

const DEFAULT_CONFIG_PATH: &str = "/etc/deployhook/config.json";

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:9000";
const DEFAULT_ALLOWED_BRANCH: &str = "main";
const DEFAULT_REMOTE: &str = "origin";
const DEFAULT_HEALTH_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_RESTART_PAUSE_MILLIS: u64 = 2_000;
const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 120;
const DEFAULT_DEPLOY_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_DEPENDENCY_MANIFEST: &str = "requirements.txt";
const DEFAULT_DEPLOY_LOG_PATH: &str = "/var/log/deployhook/deploys.jsonl";
const DEFAULT_LEASE_PATH: &str = "/run/deployhook/deploy.lease";
const DEFAULT_LOG_LEVEL: &str = "info";

const NUMERIC_SETTINGS: [&str; 4] = [
    "DEPLOYHOOK_HEALTH_TIMEOUT_SECONDS",
    "DEPLOYHOOK_RESTART_PAUSE_MILLIS",
    "DEPLOYHOOK_COMMAND_TIMEOUT_SECONDS",
    "DEPLOYHOOK_DEPLOY_TIMEOUT_SECONDS",
];

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeployHookConfig {
    pub bind_address: Option<String>,
    pub webhook_secret: Option<String>,
    pub allowed_branches: Option<Vec<String>>,
    pub working_tree: Option<String>,
    pub remote: Option<String>,
    pub service_name: Option<String>,
    pub use_sudo: Option<bool>,
    pub health_check_url: Option<String>,
    pub health_timeout_seconds: Option<u64>,
    pub restart_pause_millis: Option<u64>,
    pub command_timeout_seconds: Option<u64>,
    pub deploy_timeout_seconds: Option<u64>,
    pub dependency_manifests: Option<Vec<String>>,
    pub dependency_command: Option<String>,
    pub deploy_log_path: Option<String>,
    pub lease_path: Option<String>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
    pub log_dir: Option<String>,
}

impl fmt::Debug for DeployHookConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DeployHookConfig")
            .field("bind_address", &self.bind_address())
            .field(
                "webhook_secret",
                &self.webhook_secret().as_ref().map(|_| "***"),
            )
            .field("allowed_branches", &self.allowed_branches())
            .field("working_tree", &self.working_tree())
            .field("remote", &self.remote())
            .field("service_name", &self.service_name())
            .field("use_sudo", &self.use_sudo())
            .field("health_check_url", &self.health_check_url())
            .field("health_timeout", &self.health_timeout())
            .field("restart_pause", &self.restart_pause())
            .field("command_timeout", &self.command_timeout())
            .field("deploy_timeout", &self.deploy_timeout())
            .field("dependency_manifests", &self.dependency_manifests())
            .field("dependency_command", &self.dependency_command())
            .field("deploy_log_path", &self.deploy_log_path())
            .field("lease_path", &self.lease_path())
            .field("log_level", &self.log_level())
            .field("log_json", &self.log_json())
            .field("log_dir", &self.log_dir())
            .finish()
    }
}

impl DeployHookConfig {
    /// Loads the config file named by `explicit_path`, `DEPLOYHOOK_CONFIG_PATH`, or the
    /// default location. A missing file yields an empty config so env vars can supply
    /// every value.
    ///
    /// # Errors
    ///
    /// This function will return an error if the config file exists but cannot be read or
    /// its JSON contents cannot be parsed.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let config_path = explicit_path.map_or_else(
            || {
                env_value("DEPLOYHOOK_CONFIG_PATH")
                    .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
            },
            Path::to_path_buf,
        );

        if !config_path.exists() {
            if explicit_path.is_some() {
                bail!("config file not found: {}", config_path.display());
            }
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("Failed to parse config JSON: {}", config_path.display()))
    }

    /// Checks that everything a deploy needs is present and safe to hand to git and
    /// systemctl.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing or invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.webhook_secret().is_none() {
            bail!("webhook_secret is required (DEPLOYHOOK_WEBHOOK_SECRET)");
        }

        if self.working_tree().is_none() {
            bail!("working_tree is required (DEPLOYHOOK_WORKING_TREE)");
        }

        let service_name = self
            .service_name()
            .context("service_name is required (DEPLOYHOOK_SERVICE_NAME)")?;
        SystemdSupervisor::validate_unit_name(&service_name)?;

        let allowed_branches = self.allowed_branches();
        if allowed_branches.is_empty() {
            bail!("allowed_branches must name at least one branch");
        }
        for branch in &allowed_branches {
            Git::validate_branch(branch)
                .with_context(|| format!("allowed branch is not usable: {branch}"))?;
        }

        Git::validate_branch(&self.remote()).context("remote name is not usable")?;

        if let Some(command) = self.dependency_command() {
            crate::deploy::dependencies::parse_command(&command)
                .context("dependency_command is not usable")?;
        }

        for name in NUMERIC_SETTINGS {
            if let Some(raw) = env_value(name) {
                raw.parse::<u64>()
                    .with_context(|| format!("{name} must be a whole number, got {raw:?}"))?;
            }
        }

        if self.deploy_timeout() <= self.health_timeout() {
            bail!("deploy_timeout_seconds must be larger than health_timeout_seconds");
        }

        Ok(())
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        string_setting(self.bind_address.as_deref(), "DEPLOYHOOK_BIND_ADDRESS")
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    #[must_use]
    pub fn webhook_secret(&self) -> Option<String> {
        string_setting(self.webhook_secret.as_deref(), "DEPLOYHOOK_WEBHOOK_SECRET")
            .or_else(|| env_value("GITHUB_WEBHOOK_SECRET"))
    }

    #[must_use]
    pub fn allowed_branches(&self) -> Vec<String> {
        list_setting(
            self.allowed_branches.as_deref(),
            "DEPLOYHOOK_ALLOWED_BRANCHES",
        )
        .unwrap_or_else(|| vec![DEFAULT_ALLOWED_BRANCH.to_string()])
    }

    #[must_use]
    pub fn working_tree(&self) -> Option<PathBuf> {
        string_setting(self.working_tree.as_deref(), "DEPLOYHOOK_WORKING_TREE").map(PathBuf::from)
    }

    #[must_use]
    pub fn remote(&self) -> String {
        string_setting(self.remote.as_deref(), "DEPLOYHOOK_REMOTE")
            .unwrap_or_else(|| DEFAULT_REMOTE.to_string())
    }

    #[must_use]
    pub fn service_name(&self) -> Option<String> {
        string_setting(self.service_name.as_deref(), "DEPLOYHOOK_SERVICE_NAME")
    }

    #[must_use]
    pub fn use_sudo(&self) -> bool {
        bool_setting(self.use_sudo, "DEPLOYHOOK_USE_SUDO")
    }

    #[must_use]
    pub fn health_check_url(&self) -> Option<String> {
        string_setting(
            self.health_check_url.as_deref(),
            "DEPLOYHOOK_HEALTH_CHECK_URL",
        )
    }

    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(u64_setting(
            self.health_timeout_seconds,
            "DEPLOYHOOK_HEALTH_TIMEOUT_SECONDS",
            DEFAULT_HEALTH_TIMEOUT_SECONDS,
        ))
    }

    #[must_use]
    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(u64_setting(
            self.restart_pause_millis,
            "DEPLOYHOOK_RESTART_PAUSE_MILLIS",
            DEFAULT_RESTART_PAUSE_MILLIS,
        ))
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(u64_setting(
            self.command_timeout_seconds,
            "DEPLOYHOOK_COMMAND_TIMEOUT_SECONDS",
            DEFAULT_COMMAND_TIMEOUT_SECONDS,
        ))
    }

    #[must_use]
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(u64_setting(
            self.deploy_timeout_seconds,
            "DEPLOYHOOK_DEPLOY_TIMEOUT_SECONDS",
            DEFAULT_DEPLOY_TIMEOUT_SECONDS,
        ))
    }

    #[must_use]
    pub fn dependency_manifests(&self) -> Vec<String> {
        list_setting(
            self.dependency_manifests.as_deref(),
            "DEPLOYHOOK_DEPENDENCY_MANIFESTS",
        )
        .unwrap_or_else(|| vec![DEFAULT_DEPENDENCY_MANIFEST.to_string()])
    }

    #[must_use]
    pub fn dependency_command(&self) -> Option<String> {
        string_setting(
            self.dependency_command.as_deref(),
            "DEPLOYHOOK_DEPENDENCY_COMMAND",
        )
    }

    #[must_use]
    pub fn deploy_log_path(&self) -> PathBuf {
        string_setting(self.deploy_log_path.as_deref(), "DEPLOYHOOK_DEPLOY_LOG_PATH")
            .map_or_else(|| PathBuf::from(DEFAULT_DEPLOY_LOG_PATH), PathBuf::from)
    }

    #[must_use]
    pub fn lease_path(&self) -> PathBuf {
        string_setting(self.lease_path.as_deref(), "DEPLOYHOOK_LEASE_PATH")
            .map_or_else(|| PathBuf::from(DEFAULT_LEASE_PATH), PathBuf::from)
    }

    #[must_use]
    pub fn log_level(&self) -> String {
        string_setting(self.log_level.as_deref(), "DEPLOYHOOK_LOG_LEVEL")
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    #[must_use]
    pub fn log_json(&self) -> bool {
        bool_setting(self.log_json, "DEPLOYHOOK_LOG_JSON")
    }

    #[must_use]
    pub fn log_dir(&self) -> Option<PathBuf> {
        string_setting(self.log_dir.as_deref(), "DEPLOYHOOK_LOG_DIR").map(PathBuf::from)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn string_setting(file_value: Option<&str>, env_name: &str) -> Option<String> {
    file_value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| env_value(env_name))
}

fn list_setting(file_value: Option<&[String]>, env_name: &str) -> Option<Vec<String>> {
    let from_file = file_value.map(|values| {
        values
            .iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>()
    });

    from_file.or_else(|| {
        env_value(env_name).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    })
}

fn bool_setting(file_value: Option<bool>, env_name: &str) -> bool {
    file_value.unwrap_or_else(|| {
        env_value(env_name)
            .is_some_and(|value| value.eq_ignore_ascii_case("true") || value == "1")
    })
}

fn u64_setting(file_value: Option<u64>, env_name: &str, default: u64) -> u64 {
    file_value
        .or_else(|| env_value(env_name).and_then(|value| value.parse::<u64>().ok()))
        .unwrap_or(default)
}
