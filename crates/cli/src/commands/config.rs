//! config command - Inspect and initialize the configuration file

use clap::Subcommand;
use serde::Serialize;
use sx_core::{Config, ConfigManager};

use super::load_config;
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

const REDACTED: &str = "********";

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration (secrets redacted)
    Show,

    /// Print the configuration file location
    Path,

    /// Write a configuration file populated with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Serialize)]
struct PathOutput {
    path: String,
    exists: bool,
}

/// Execute a config subcommand
pub async fn execute(cmd: ConfigCommands, output_config: OutputConfig) -> ExitCode {
    let formatter = Formatter::new(output_config);

    match cmd {
        ConfigCommands::Show => show(&formatter),
        ConfigCommands::Path => path(&formatter),
        ConfigCommands::Init { force } => init(&formatter, force),
    }
}

fn show(formatter: &Formatter) -> ExitCode {
    let config = match load_config(formatter) {
        Ok(config) => redact(config),
        Err(code) => return code,
    };

    if formatter.is_json() {
        formatter.json(&config);
        return ExitCode::Success;
    }

    match toml::to_string_pretty(&config) {
        Ok(text) => {
            formatter.println(text.trim_end());
            ExitCode::Success
        }
        Err(e) => {
            formatter.error(&format!("Failed to render configuration: {e}"));
            ExitCode::GeneralError
        }
    }
}

fn path(formatter: &Formatter) -> ExitCode {
    let manager = match ConfigManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            formatter.error(&format!("Failed to locate configuration: {e}"));
            return ExitCode::GeneralError;
        }
    };

    let output = PathOutput {
        path: manager.config_path().display().to_string(),
        exists: manager.config_path().exists(),
    };

    if formatter.is_json() {
        formatter.json(&output);
    } else if output.exists {
        formatter.println(&output.path);
    } else {
        formatter.println(&format!("{} (not created)", output.path));
    }
    ExitCode::Success
}

fn init(formatter: &Formatter, force: bool) -> ExitCode {
    let manager = match ConfigManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            formatter.error(&format!("Failed to locate configuration: {e}"));
            return ExitCode::GeneralError;
        }
    };

    if manager.config_path().exists() && !force {
        formatter.error(&format!(
            "{} already exists (use --force to overwrite)",
            manager.config_path().display()
        ));
        return ExitCode::Conflict;
    }

    if let Err(e) = manager.save(&Config::default()) {
        formatter.error(&format!("Failed to write configuration: {e}"));
        return ExitCode::GeneralError;
    }

    if formatter.is_json() {
        formatter.json(&PathOutput {
            path: manager.config_path().display().to_string(),
            exists: true,
        });
    } else {
        formatter.success(&format!("Wrote {}", manager.config_path().display()));
    }
    ExitCode::Success
}

fn redact(mut config: Config) -> Config {
    if config.backend.secret_key.is_some() {
        config.backend.secret_key = Some(REDACTED.to_string());
    }
    config
}
