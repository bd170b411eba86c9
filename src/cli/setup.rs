use crate::infra::config::{DEFAULT_CONFIG_NAME, install_default_config};
use anyhow::Result;
use std::path::Path;
use tracing::info;

pub fn install(config_dir: &Path) -> Result<()> {
    info!("Preparing config in {:?}", config_dir);

    if install_default_config(config_dir)? {
        info!(
            "Config ready. Adjust {:?} to your needs.",
            config_dir.join(DEFAULT_CONFIG_NAME)
        );
    } else {
        info!(
            "{:?} already exists, leaving it untouched",
            config_dir.join(DEFAULT_CONFIG_NAME)
        );
    }

    Ok(())
}
