use anyhow::Result;
use std::path::Path;

use cirrus_core::config::CirrusConfig;

pub fn run(base_dir: &Path) -> Result<()> {
    println!("Initializing Cirrus in {}", base_dir.display());

    std::fs::create_dir_all(base_dir)?;

    let config_path = CirrusConfig::default_path(base_dir);
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        let config = CirrusConfig::default_config();
        config.save(&config_path)?;
        println!("Created config: {}", config_path.display());
    }

    println!("\nCirrus initialized. Next steps:");
    println!("  1. Add a provider table to {}, e.g.", config_path.display());
    println!("     [qiniu_kodo]");
    println!("     access_key = \"...\"");
    println!("     secret_key = \"...\"");
    println!("     bucket = \"my-backups\"");
    println!("     domain = \"https://cdn.example.com\"");
    println!("  2. Run `cirrus use qiniu_kodo` to select it");
    println!("  3. Run `cirrus backup <file>` to create your first backup");

    Ok(())
}
