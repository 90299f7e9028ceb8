use super::config::CdsConfig;
use cds_sync::discovery::{DiscoveryStateStore, JsonFileStateStore};

/// Show the persisted discovery state
///
/// Prints how many identifiers the service has confirmed and a short
/// fingerprint of the continuation token. Identifiers themselves are never
/// printed.
pub async fn execute(config: &CdsConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonFileStateStore::new(&config.state.path);
    let confirmed = store.load().await?;

    println!("📊 Discovery State");
    println!();
    println!("  State file: {}", store.path().display());

    match &confirmed.token {
        Some(token) => {
            println!("  Confirmed identifiers: {}", confirmed.identifiers.len());
            println!("  Continuation token: {}…", token.fingerprint());
        }
        None => {
            println!("  No confirmed set (next refresh is a cold start)");
        }
    }

    println!(
        "  One-off threshold: {}",
        config.discovery.one_off_threshold
    );

    Ok(())
}
