use anyhow::Result;
use std::path::Path;

use cirrus_core::config::CirrusConfig;

pub fn run(base_dir: &Path) -> Result<()> {
    let config_path = CirrusConfig::default_path(base_dir);
    let config = CirrusConfig::load(&config_path)?;
    let backup = &config.backup;

    println!("Config: {}", config_path.display());
    println!();
    println!(
        "  Provider:       {} (code {})",
        backup.provider,
        backup.provider.code()
    );
    println!("  Namespace:      {}", backup.namespace);
    println!("  Auto backup:    {}", backup.auto_backup);
    println!("  Max auto size:  {} MB", backup.auto_backup_max_file_mb);
    println!("  Delete local:   {}", backup.auto_delete_local);
    println!("  Poll interval:  {} ms", backup.poll_interval_ms);
    if backup.targets.is_empty() {
        println!("  Targets:        (none enabled)");
    } else {
        let targets: Vec<&str> = backup.targets.iter().map(String::as_str).collect();
        println!("  Targets:        {}", targets.join(", "));
    }
    println!();

    let configured = config.configured_providers();
    if configured.is_empty() {
        println!("  No providers configured.");
        return Ok(());
    }

    println!("  Providers ({}):", configured.len());
    if let Some(ref g) = config.google_drive {
        println!(
            "    - google_drive (token={})",
            if g.access_token.is_some() { "set" } else { "missing" }
        );
    }
    if let Some(ref o) = config.onedrive {
        println!(
            "    - onedrive (client_id={}, tenant={}, refresh_token={})",
            o.client_id,
            o.tenant,
            if o.refresh_token.is_some() { "set" } else { "missing" }
        );
    }
    if let Some(ref c) = config.tencent_cos {
        println!(
            "    - tencent_cos (bucket={}, region={}, endpoint={})",
            c.bucket,
            c.region,
            c.endpoint()
        );
    }
    if let Some(ref k) = config.qiniu_kodo {
        println!("    - qiniu_kodo (bucket={}, domain={})", k.bucket, k.domain);
    }

    Ok(())
}
