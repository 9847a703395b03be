//! CLI definition and dispatch.

pub mod run;

use std::process::ExitCode;

use clap::{Parser, ValueEnum};

/// Run a command in an isolated, rootless Linux container.
#[derive(Parser, Debug)]
#[command(name = "runf", version, about, long_about = None)]
pub struct Cli {
    /// Options for the container and its process.
    #[command(flatten)]
    pub run: run::RunArgs,

    /// Log output format on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Format of log records written to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per record.
    Json,
}

/// Runs the parsed command line and returns the process exit code.
///
/// # Errors
///
/// Returns an error if the container cannot be created, started, waited
/// for, or cleaned up.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    run::execute(cli.run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_arguments_form_the_command() {
        let args = ["runf", "--rootfs", "/srv/alpine", "/bin/ls", "-la", "/"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.run.command, vec!["/bin/ls", "-la", "/"]);
        assert_eq!(cli.run.rootfs.as_deref(), Some(std::path::Path::new("/srv/alpine")));
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["runf", "--rootfs", "/srv/alpine"]).is_err());
    }

    #[test]
    fn flags_after_the_command_belong_to_it() {
        let cli = Cli::try_parse_from(["runf", "/bin/grep", "--user", "x"]).unwrap();
        assert_eq!(cli.run.user, "root");
        assert_eq!(cli.run.command, vec!["/bin/grep", "--user", "x"]);
    }

    #[test]
    fn defaults_match_the_runtime() {
        let cli = Cli::try_parse_from(["runf", "true"]).unwrap();
        assert_eq!(cli.run.cwd, std::path::PathBuf::from("/"));
        assert!(cli.run.env.is_empty());
        assert!(!cli.run.no_rootless);
        assert!(!cli.run.writable_root);
        assert_eq!(cli.run.timeout, None);
    }

    #[test]
    fn json_log_format_is_accepted() {
        let cli = Cli::try_parse_from(["runf", "--log-format", "json", "true"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
