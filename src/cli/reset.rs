use super::config::CdsConfig;
use cds_sync::discovery::{DiscoveryStateStore, JsonFileStateStore};
use std::io::{self, Write};

/// Word the operator must type to confirm a reset
const CONFIRM_WORD: &str = "RESET";

/// Clear the confirmed set and continuation token
///
/// The next full sync is a cold start and re-discloses every candidate
/// identifier, so this asks for confirmation unless `--yes` is given.
pub async fn execute(config: &CdsConfig, yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonFileStateStore::new(&config.state.path);

    if !yes {
        println!("⚠️  Resetting {}", store.path().display());
        println!("   The next refresh will re-disclose every identifier to the discovery service.");
        let prompt = format!("Type '{}' to confirm: ", CONFIRM_WORD);
        if !confirm_action(&prompt, CONFIRM_WORD)? {
            println!("Aborted.");
            return Ok(());
        }
    }

    store.clear().await?;
    tracing::info!("discovery state cleared");
    println!("✅ Discovery state cleared");

    Ok(())
}

/// Whether `input` matches `expected` after trimming
pub fn parse_confirmation(input: &str, expected: &str) -> bool {
    input.trim() == expected
}

fn confirm_action(prompt: &str, expected: &str) -> Result<bool, Box<dyn std::error::Error>> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(parse_confirmation(&input, expected))
}
