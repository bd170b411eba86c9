use anyhow::Result;
use clap::Parser;
use devservices::cli::{self, Command};
use devservices::infra::config::default_config_dir;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "devservices",
    version,
    about = "Runs the containers a local development environment depends on"
)]
struct Cli {
    /// Config directory (default: ~/.config/devservices)
    #[arg(long, env = "DEVSERVICES_CONFIG_DIR", default_value_os_t = default_config_dir())]
    config_dir: std::path::PathBuf,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .without_time()
        .with_target(false)
        .init();

    let cli = Cli::parse();
    cli::run(cli.command, &cli.config_dir)
}
