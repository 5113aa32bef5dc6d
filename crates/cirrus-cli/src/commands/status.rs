use anyhow::Result;
use indicatif::HumanBytes;
use std::path::Path;

use cirrus_core::types::QuotaStatus;
use cirrus_storage::coordinator::StorageStatus;

use super::providers::open_coordinator;

fn optional_bytes(value: Option<u64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |v| HumanBytes(v).to_string())
}

fn print_quota(quota: &QuotaStatus) {
    println!("  Total:          {}", optional_bytes(quota.total_space()));
    println!("  Used:           {}", optional_bytes(quota.used_space()));
    println!("  Free:           {}", optional_bytes(quota.free_space()));
    println!("  Used by Cirrus: {}", HumanBytes(quota.app_used_space()));
}

pub async fn run(base_dir: &Path) -> Result<()> {
    let (_config, coordinator) = open_coordinator(base_dir).await?;

    match coordinator.status().await? {
        StorageStatus::Unconfigured => {
            println!("Backup disabled. Run `cirrus use <provider>` to select a provider.");
        }
        StorageStatus::NeedsReauth(id) => {
            println!("Provider: {id}");
            println!("  Session expired or missing; refresh the [{id}] credentials.");
        }
        StorageStatus::Ready { provider, quota } => {
            println!("Provider: {provider}");
            print_quota(&quota);
        }
    }

    let providers = coordinator.providers();
    if !providers.is_empty() {
        let mut ids: Vec<_> = providers.keys().copied().collect();
        ids.sort();
        println!("\n  Configured providers:");
        for id in ids {
            let signed_in = providers[&id].is_signed_in();
            println!(
                "    - {id} ({})",
                if signed_in { "signed in" } else { "signed out" }
            );
        }
    }

    Ok(())
}
