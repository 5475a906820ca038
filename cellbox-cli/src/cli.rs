use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::run::RunArgs;

/// Run commands in throwaway sandboxes.
#[derive(Parser, Debug)]
#[command(name = "cellbox", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a box, run one command in it, and remove it
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Runtime home directory
    #[arg(long, global = true, env = "CELLBOX_HOME")]
    pub home: Option<PathBuf>,

    /// Registry used to qualify unqualified image references (repeatable)
    #[arg(long = "registry", global = true)]
    pub registries: Vec<String>,

    /// Log debug output to stderr
    #[arg(long, global = true)]
    pub debug: bool,
}

impl GlobalFlags {
    pub fn runtime_options(&self) -> cellbox::CellboxOptions {
        let mut options = match &self.home {
            Some(home) => cellbox::CellboxOptions::with_home(home),
            None => cellbox::CellboxOptions::default(),
        };
        options.image_registries = self.registries.clone();
        options
    }

    pub fn create_runtime(&self) -> anyhow::Result<cellbox::CellboxRuntime> {
        Ok(cellbox::CellboxRuntime::new(self.runtime_options())?)
    }

    /// Install the stderr subscriber. Must run before the runtime is created
    /// so the library keeps logs out of its own file.
    pub fn init_logging(&self) {
        let filter = if self.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "cellbox", "--home", "/tmp/cb", "--registry", "ghcr.io", "run", "--cpus", "2",
            "--name", "web", "alpine:latest", "--", "sh", "-c", "echo hi",
        ])
        .unwrap();

        assert_eq!(cli.global.home, Some(PathBuf::from("/tmp/cb")));
        assert_eq!(cli.global.registries, ["ghcr.io"]);
        let Commands::Run(run) = cli.command;
        assert_eq!(run.cpus, Some(2));
        assert_eq!(run.name.as_deref(), Some("web"));
        assert_eq!(run.image, "alpine:latest");
        assert_eq!(run.command, ["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["cellbox", "run", "alpine"]).is_err());
    }

    #[test]
    fn test_env_pairs_are_validated() {
        let cli = Cli::try_parse_from(["cellbox", "run", "-e", "A=1", "alpine", "--", "env"]).unwrap();
        let Commands::Run(run) = cli.command;
        assert_eq!(run.env, [("A".to_string(), "1".to_string())]);

        assert!(Cli::try_parse_from(["cellbox", "run", "-e", "A", "alpine", "--", "env"]).is_err());
    }

    #[test]
    fn test_runtime_options_from_flags() {
        let flags = GlobalFlags {
            home: Some(PathBuf::from("/srv/cellbox")),
            registries: vec!["quay.io".into()],
            debug: false,
        };
        let options = flags.runtime_options();
        assert_eq!(options.home_dir, PathBuf::from("/srv/cellbox"));
        assert_eq!(options.image_registries, ["quay.io"]);
    }
}
