use std::path::PathBuf;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;

use scriptd_host::CronSchedule;
use scriptd_runner::{ConfigLoadError, ScriptdConfig, init_logging_with_default};

#[derive(Parser)]
#[command(name = "scriptd", version, about, long_about = None)]
pub struct Cli {
    /// Enables debug logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Config file to use instead of the per-user one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or create the config file
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Check cron specs and preview their fire times (UTC)
    #[command(subcommand)]
    Cron(CronCommand),

    /// List the module files the service would load
    Scripts,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective config
    Show,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file location
    Path,
}

#[derive(Subcommand)]
enum CronCommand {
    /// Print the next fire times of a cron spec
    Next {
        spec: String,
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
        /// Start from this RFC 3339 time instead of now
        #[arg(long)]
        after: Option<DateTime<Utc>>,
    },
    /// Validate a cron spec
    Check { spec: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug > 0 { "debug" } else { "warn" };
    let file_logging = load_config(cli.config.as_ref())
        .map(|c| c.logging.file)
        .unwrap_or(false);
    let _guard = init_logging_with_default("cli", file_logging, level).context("initializing logging")?;

    let output = match cli.command {
        Command::Config(command) => run_config(command, cli.config)?,
        Command::Cron(CronCommand::Next { spec, count, after }) => {
            cron_next(&spec, count, after.unwrap_or_else(Utc::now))?
        }
        Command::Cron(CronCommand::Check { spec }) => cron_check(&spec)?,
        Command::Scripts => list_scripts(&load_config(cli.config.as_ref())?)?,
    };
    print!("{}", output);
    Ok(())
}

fn config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(ScriptdConfig::config_path()?),
    }
}

fn load_config(explicit: Option<&PathBuf>) -> Result<ScriptdConfig, ConfigLoadError> {
    let result = match explicit {
        Some(path) => ScriptdConfig::load_from(path),
        None => ScriptdConfig::load(),
    };
    match result {
        Err(ConfigLoadError::NotFound) => Ok(ScriptdConfig::default()),
        other => other,
    }
}

fn run_config(command: ConfigCommand, explicit: Option<PathBuf>) -> anyhow::Result<String> {
    match command {
        ConfigCommand::Show => {
            let config = load_config(explicit.as_ref())?;
            config.to_toml()
        }
        ConfigCommand::Init { force } => {
            let path = config_path(explicit)?;
            if path.exists() && !force {
                bail!(
                    "Config file already exists at {}. Edit it or pass --force to replace it.",
                    path.display()
                );
            }
            ScriptdConfig::default().save_to(&path)?;
            Ok(format!("Config file created at: {}\n", path.display()))
        }
        ConfigCommand::Path => Ok(format!("{}\n", config_path(explicit)?.display())),
    }
}

fn list_scripts(config: &ScriptdConfig) -> anyhow::Result<String> {
    let files = config.module_files().context("loading module files")?;
    let entry = &config.scripts.entry;
    if !files.iter().any(|f| &f.name == entry) {
        bail!("entry module '{}' not found among {} module file(s)", entry, files.len());
    }

    Ok(files
        .iter()
        .map(|f| {
            let marker = if &f.name == entry { " (entry)" } else { "" };
            format!("{}{}\n", f.name, marker)
        })
        .collect())
}

fn cron_next(spec: &str, count: usize, after: DateTime<Utc>) -> anyhow::Result<String> {
    let schedule = CronSchedule::parse(spec).with_context(|| format!("invalid cron spec '{}'", spec))?;
    let times = schedule.upcoming(after, count);
    debug!("{} fire time(s) for '{}' after {}", times.len(), schedule, after);

    if times.is_empty() {
        return Ok(format!("'{}' never fires\n", spec));
    }
    Ok(times.iter().map(|t| format!("{}\n", t.to_rfc3339())).collect())
}

fn cron_check(spec: &str) -> anyhow::Result<String> {
    match CronSchedule::parse(spec) {
        Ok(schedule) => Ok(format!("ok: {}\n", schedule)),
        Err(e) => bail!("invalid cron spec '{}': {}", spec, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["scriptd", "cron", "next", "0 * * * *", "-n", "2"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Cron(CronCommand::Next { count: 2, .. })
        ));

        assert!(Cli::try_parse_from(["scriptd", "cron"]).is_err());
    }

    #[test]
    fn test_cron_next_lists_times() {
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let output = cron_next("hourly", 2, after).unwrap();
        assert_eq!(
            output,
            "2024-01-01T11:00:00+00:00\n2024-01-01T12:00:00+00:00\n"
        );
    }

    #[test]
    fn test_cron_check() {
        assert!(cron_check("*/15 9-17 * * mon-fri").is_ok());
        assert!(cron_check("61 * * * *").is_err());
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        run_config(ConfigCommand::Init { force: false }, Some(path.clone())).unwrap();
        assert!(run_config(ConfigCommand::Init { force: false }, Some(path.clone())).is_err());
        run_config(ConfigCommand::Init { force: true }, Some(path.clone())).unwrap();

        let shown = run_config(ConfigCommand::Show, Some(path)).unwrap();
        assert!(shown.contains("project_id = \"default\""));
    }

    #[test]
    fn test_list_scripts_marks_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.js"), "").unwrap();
        std::fs::write(dir.path().join("jobs.js"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let mut config = ScriptdConfig::default();
        config.scripts.dir = Some(dir.path().to_path_buf());
        assert_eq!(list_scripts(&config).unwrap(), "jobs\nmain (entry)\n");

        config.scripts.entry = "app".to_string();
        assert!(list_scripts(&config).is_err());
    }

    #[test]
    fn test_show_without_file_prints_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let shown = run_config(ConfigCommand::Show, Some(dir.path().join("missing.toml"))).unwrap();
        assert!(shown.contains("[runtime]"));
        assert!(shown.contains("overlap = \"skip\""));
    }
}
