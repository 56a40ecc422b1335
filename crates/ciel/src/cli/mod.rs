//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio_util::sync::CancellationToken;

use crate::runtime::{CielConfig, Container};

/// Ciel - layered build containers
#[derive(Parser)]
#[command(name = "ciel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (default: the user config directory)
    #[arg(long, global = true, env = "CIEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Container arguments shared by every subcommand.
#[derive(clap::Args)]
pub struct ContainerArgs {
    /// Directory holding the container's layers
    #[arg(long)]
    pub base_dir: PathBuf,

    /// Container name
    #[arg(long, default_value = "ciel")]
    pub name: String,

    /// Never boot, always use chroot sessions
    #[arg(long)]
    pub no_boot: bool,

    /// Resource-control property for booted containers (repeatable)
    #[arg(long = "property", value_name = "PROPERTY")]
    pub properties: Vec<String>,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a program in a container, then shut it down
    Run {
        #[command(flatten)]
        container: ContainerArgs,

        /// Program and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Run a shell line through the container's login shell
    Sh {
        #[command(flatten)]
        container: ContainerArgs,

        /// Shell command line
        line: String,
    },

    /// Show the layer stack of a base directory
    Layers {
        /// Directory holding the container's layers
        #[arg(long)]
        base_dir: PathBuf,
    },
}

impl Cli {
    /// Load the configuration named on the command line, or the default one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn load_config(&self) -> Result<CielConfig> {
        let config = match &self.config {
            Some(path) => CielConfig::load(path),
            None => CielConfig::discover(),
        };
        config.wrap_err("Failed to load configuration")
    }

    /// Execute the CLI command and return the process exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be set up, started or shut
    /// down. A command that runs and fails is reported through the status.
    pub async fn execute(self) -> Result<i32> {
        let config = self.load_config()?;

        match self.command {
            Commands::Run { container, command } => {
                let Some((program, args)) = command.split_first() else {
                    return Err(eyre!("No command given"));
                };
                let c = open(&container, &config)?;
                let ctx = cancel_on_interrupt();
                let result = c.run(&ctx, program, args).await;
                finish(&c, result).await
            }

            Commands::Sh { container, line } => {
                let c = open(&container, &config)?;
                let ctx = cancel_on_interrupt();
                let result = c.run_command(&ctx, &line).await;
                finish(&c, result).await
            }

            Commands::Layers { base_dir } => {
                print_layers(&base_dir);
                Ok(0)
            }
        }
    }
}

fn open(args: &ContainerArgs, config: &CielConfig) -> Result<Container> {
    let container = Container::new(args.name.as_str(), &args.base_dir, config)
        .map_err(|e| eyre!("Failed to create container: {}", e))?;

    if args.no_boot {
        container.set_preference(false);
    }
    for property in &args.properties {
        container.add_property(property);
    }
    Ok(container)
}

/// A token that is cancelled on the first Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let ctx = CancellationToken::new();
    let token = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling command");
            token.cancel();
        }
    });
    ctx
}

/// Shut the container down whatever the command's outcome was.
async fn finish(container: &Container, result: ciel_common::CielResult<i32>) -> Result<i32> {
    let shutdown = container.shutdown().await;
    let status = result.map_err(|e| eyre!("Failed to run command: {}", e))?;
    shutdown.map_err(|e| eyre!("Failed to shut down container: {}", e))?;
    Ok(status)
}

fn print_layers(base_dir: &Path) {
    let layers = crate::filesystem::LayerSet::standard().resolve(base_dir);

    println!("{:<8} {:<16} PATH", "ROLE", "KEY");
    for layer in layers.stacking_order() {
        println!(
            "{:<8} {:<16} {}",
            layer.role.to_string(),
            layer.key,
            layer.path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_keeps_trailing_arguments() {
        let cli = Cli::parse_from([
            "ciel",
            "run",
            "--base-dir",
            "/var/lib/ciel/buildkit",
            "--property",
            "CPUQuota=80%",
            "--",
            "make",
            "-j",
            "8",
        ]);
        let Commands::Run { container, command } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(container.name, "ciel");
        assert_eq!(container.properties, ["CPUQuota=80%"]);
        assert!(!container.no_boot);
        assert_eq!(command, ["make", "-j", "8"]);
    }

    #[test]
    fn sh_takes_a_single_line() {
        let cli = Cli::parse_from([
            "ciel",
            "--debug",
            "sh",
            "--base-dir",
            "/srv/b",
            "--no-boot",
            "echo hi",
        ]);
        assert!(cli.debug);
        let Commands::Sh { container, line } = cli.command else {
            panic!("expected sh");
        };
        assert!(container.no_boot);
        assert_eq!(line, "echo hi");
    }
}
