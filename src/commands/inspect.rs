//! Inspect command
//!
//! Loads and verifies a bundle archive without touching a cluster, then
//! prints its descriptor. Useful for reviewing what a deploy would do.

use anyhow::Result;

use crate::config::DeployOptions;
use crate::infrastructure::archive;
use crate::ui;

pub async fn execute(opts: DeployOptions) -> Result<()> {
    let staging = tempfile::TempDir::with_prefix("airlift-inspect-")?;
    let loaded = archive::load(&opts, staging.path()).await?;

    ui::print_header(&format!("Bundle: {}", loaded.bundle.metadata.name));
    println!("{}", serde_yaml::to_string(&loaded.bundle)?);
    ui::print_component_table(&loaded.bundle.components);
    Ok(())
}
