pub mod devservices;
pub mod setup;

use anyhow::Result;
use clap::Subcommand;
use std::path::Path;

pub use devservices::{AttachArgs, Devservices, DownArgs, RmArgs, UpArgs};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring up services in the background
    Up(UpArgs),
    /// Stop running services
    Down(DownArgs),
    /// Remove services' containers, volumes and network
    Rm(RmArgs),
    /// Run an on-demand service in the foreground until Ctrl+C
    Attach(AttachArgs),
    /// Install the default devservices.toml in the config directory
    Setup,
}

pub fn run(command: Command, config_dir: &Path) -> Result<()> {
    if let Command::Setup = command {
        return setup::install(config_dir);
    }

    let app = Devservices::new(config_dir)?;
    match command {
        Command::Up(args) => app.up(&args),
        Command::Down(args) => app.down(&args),
        Command::Rm(args) => app.rm(&args, devservices::confirm_removal),
        Command::Attach(args) => devservices::run_attached(app.attach(&args)?),
        Command::Setup => Ok(()),
    }
}
