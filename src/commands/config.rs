use anyhow::{Result, bail};
use bloomcal_core::SyncConfig;
use owo_colors::OwoColorize;

pub fn run(init: bool) -> Result<()> {
    let config_path = SyncConfig::config_path()?;

    if init {
        if config_path.exists() {
            bail!("Config already exists at {}", config_path.display());
        }
        SyncConfig::create_default_config(&config_path)?;
        println!("Created {}", config_path.display().green());
        return Ok(());
    }

    let config = SyncConfig::load()?;
    let state = if config_path.exists() {
        "".to_string()
    } else {
        " (not created, using defaults)".dimmed().to_string()
    };

    println!("{}", "Paths".bold());
    println!("  Config:  {}{}", config_path.display(), state);
    println!();
    println!("{}", "Settings".bold());
    for line in config.to_toml()?.lines().filter(|l| !l.is_empty()) {
        println!("  {line}");
    }

    Ok(())
}
