//! `chorus config`: show the effective configuration

use anyhow::Result;
use chorus_core::ChorusConfig;

/// Print the merged configuration as TOML; API keys are never printed
pub fn handle(config: &ChorusConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    let key_status = if config.generation.api_key.is_some() {
        "set"
    } else {
        "not set"
    };
    println!();
    println!("# generation API key: {}", key_status);
    Ok(())
}
