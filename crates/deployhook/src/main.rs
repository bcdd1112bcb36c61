use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use deployhook::config::DeployHookConfig;
use deployhook::deploy::git::Git;
use deployhook::deploy::{self, DeployLog, DeployRequest};
use deployhook::logging::{self, LogOptions};
use deployhook::webhook;

#[derive(Debug, Parser)]
#[command(name = "deployhook")]
#[command(about = "Webhook-triggered redeploys of a supervised service")]
struct Cli {
    /// JSON config file (default: $DEPLOYHOOK_CONFIG_PATH or /etc/deployhook/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the webhook listener (the default).
    Serve,
    /// Deploy a branch in the foreground. Takes the same lease as the listener.
    Deploy {
        #[arg(long)]
        branch: String,
        /// Full or abbreviated commit id; defaults to the remote head of the branch.
        #[arg(long)]
        commit: Option<String>,
    },
    /// Print the most recent deploy records.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Validate the configuration and print it with the secret redacted.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("deployhook: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = DeployHookConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            config.validate()?;
            let _log_guard = logging::init_logging(&LogOptions::from_config(&config))?;
            webhook::run(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Deploy { branch, commit } => {
            config.validate()?;
            Git::validate_branch(&branch)?;
            if let Some(sha) = commit.as_deref() {
                Git::validate_commit(sha)?;
            }
            let _log_guard = logging::init_logging(&LogOptions::from_config(&config))?;

            let runner = deploy::build_runner(&config)?;
            let record = runner.run_deploy(&DeployRequest::new(branch, commit)).await;
            println!("{}", record.render());

            Ok(if record.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::History { limit } => {
            let log = DeployLog::new(config.deploy_log_path());
            let records = log.read_recent(limit)?;
            if records.is_empty() {
                println!("no deploys recorded in {}", log.path().display());
            }
            for record in records {
                println!("{}\n", record.render());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig => {
            config.validate()?;
            println!("{config:#?}");
            println!("configuration OK");
            Ok(ExitCode::SUCCESS)
        }
    }
}
