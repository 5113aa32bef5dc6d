use anyhow::Result;
use std::path::Path;

use cirrus_core::config::CirrusConfig;
use cirrus_core::types::BackupProviderId;

/// Accepts a provider name or its numeric service code.
fn parse_provider(value: &str) -> Result<BackupProviderId> {
    if let Ok(code) = value.parse::<u32>() {
        return Ok(BackupProviderId::from_code(code)?);
    }
    Ok(value.parse()?)
}

pub fn run(provider: &str, base_dir: &Path) -> Result<()> {
    let config_path = CirrusConfig::default_path(base_dir);
    let mut config = CirrusConfig::load(&config_path)?;

    let id = parse_provider(provider)?;
    if !id.is_none() && !config.configured_providers().contains(&id) {
        anyhow::bail!(
            "Provider '{id}' has no [{id}] table in {}",
            config_path.display()
        );
    }

    config.backup.provider = id;
    config.save(&config_path)?;

    if id.is_none() {
        println!("Backup disabled.");
    } else {
        println!("Active provider: {id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_codes() {
        assert_eq!(parse_provider("kodo").unwrap(), BackupProviderId::QiniuKodo);
        assert_eq!(
            parse_provider(&BackupProviderId::OneDrive.code().to_string()).unwrap(),
            BackupProviderId::OneDrive
        );
        assert!(parse_provider("dropbox").is_err());
    }
}
