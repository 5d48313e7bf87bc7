//! sx - transfer client for S3-compatible object storage
//!
//! Every command is a thin layer over the sx-core worker manager: it builds a
//! request, renders progress while the operation runs, and maps the settled
//! result to an exit code.

mod commands;
mod exit_code;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::completions::CompletionsArgs;
use crate::commands::config::ConfigCommands;
use crate::commands::cp::CpArgs;
use crate::commands::get::GetArgs;
use crate::commands::ls::LsArgs;
use crate::commands::put::PutArgs;
use crate::commands::rm::RmArgs;
use crate::commands::share::ShareArgs;
use crate::output::OutputConfig;

/// Transfer files to and from S3-compatible object storage
#[derive(Parser, Debug)]
#[command(name = "sx", version, about, propagate_version = true)]
struct Cli {
    /// Emit machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Suppress progress and success messages
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging on stderr (overrides RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List buckets, or objects and prefixes
    Ls(LsArgs),

    /// Download objects or prefixes
    Get(GetArgs),

    /// Upload files or directories
    Put(PutArgs),

    /// Remove objects or prefixes
    Rm(RmArgs),

    /// Copy an object server-side
    Cp(CpArgs),

    /// Generate a presigned download URL
    Share(ShareArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.debug) {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    let output_config = OutputConfig {
        json: cli.json,
        no_color: cli.no_color,
        quiet: cli.quiet,
    };

    let code = match cli.command {
        Commands::Ls(args) => commands::ls::execute(args, output_config).await,
        Commands::Get(args) => commands::get::execute(args, output_config).await,
        Commands::Put(args) => commands::put::execute(args, output_config).await,
        Commands::Rm(args) => commands::rm::execute(args, output_config).await,
        Commands::Cp(args) => commands::cp::execute(args, output_config).await,
        Commands::Share(args) => commands::share::execute(args, output_config).await,
        Commands::Config(cmd) => commands::config::execute(cmd, output_config).await,
        Commands::Completions(args) => commands::completions::execute(args),
    };

    tracing::debug!(exit_code = code.as_i32(), "Command finished");
    code.into()
}

/// Log to stderr so JSON on stdout stays parseable
fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let filter = if debug {
        EnvFilter::try_new("debug")?
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sx", "ls", "photos", "--json", "-q"]).unwrap();
        assert!(cli.json);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Ls(_)));
    }

    #[test]
    fn test_ls_without_path_lists_buckets() {
        let cli = Cli::try_parse_from(["sx", "ls"]).unwrap();
        match cli.command {
            Commands::Ls(args) => assert!(args.path.is_none()),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_put_needs_source_and_destination() {
        assert!(Cli::try_parse_from(["sx", "put", "only-one"]).is_err());
        let cli = Cli::try_parse_from(["sx", "put", "a.txt", "b.txt", "bucket/dir/"]).unwrap();
        let Commands::Put(args) = cli.command else {
            panic!("expected put");
        };
        assert_eq!(args.paths.len(), 3);
    }

    #[test]
    fn test_config_init_force_flag() {
        let cli = Cli::try_parse_from(["sx", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }
}
