use super::config::CdsConfig;
use cds_sync::discovery::mock::{
    InMemoryContactDirectory, InMemoryIdentityStore, InMemoryRecipientStore, MockDiscoveryClient,
};
use cds_sync::discovery::{
    Collaborators, DiscoveryStateStore, Identifier, IdentityKey, JsonFileStateStore, RecipientId,
    RefreshOrchestrator, RefreshResult, Registration, ServiceId,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Dry-run input: local stores plus a simulated directory
#[derive(Debug, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub recipients: Vec<FixtureRecipient>,
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(default)]
    pub identities: Vec<FixtureIdentity>,
    #[serde(default)]
    pub directory: Vec<FixtureEntry>,
    #[serde(default)]
    pub rewrites: HashMap<Identifier, Identifier>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureRecipient {
    pub id: i64,
    pub number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FixtureIdentity {
    pub recipient: i64,
    pub service_id: Uuid,
    /// Hex-encoded 32-byte key
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct FixtureEntry {
    pub number: Identifier,
    pub primary: Uuid,
    pub secondary: Option<Uuid>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read fixture '{}': {}", path.display(), e))?;
        let fixture = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse fixture '{}': {}", path.display(), e))?;
        Ok(fixture)
    }
}

fn decode_key(hex_key: &str) -> Result<IdentityKey, Box<dyn std::error::Error>> {
    let bytes = hex::decode(hex_key).map_err(|e| format!("Invalid identity key: {}", e))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "Identity key must be 32 bytes".to_string())?;
    Ok(IdentityKey(key))
}

/// Build in-memory collaborators from a fixture, persisting state to `state`.
pub fn collaborators(
    fixture: Fixture,
    state: Arc<dyn DiscoveryStateStore>,
) -> Result<Collaborators, Box<dyn std::error::Error>> {
    let recipients = InMemoryRecipientStore::new();
    for recipient in &fixture.recipients {
        match &recipient.number {
            Some(number) => recipients.insert(RecipientId(recipient.id), number),
            None => recipients.insert_without_number(RecipientId(recipient.id)),
        }
    }

    let identities = InMemoryIdentityStore::new();
    for identity in &fixture.identities {
        identities.insert(
            RecipientId(identity.recipient),
            ServiceId(identity.service_id),
            decode_key(&identity.key)?,
        );
    }

    let client = MockDiscoveryClient::new();
    for entry in fixture.directory {
        client.register(
            entry.number,
            Registration {
                primary: ServiceId(entry.primary),
                secondary: entry.secondary.map(ServiceId),
            },
        );
    }
    for (old, new) in fixture.rewrites {
        client.add_rewrite(old, new);
    }

    Ok(Collaborators {
        recipients: Arc::new(recipients),
        contacts: Arc::new(InMemoryContactDirectory::new(fixture.contacts)),
        identities: Arc::new(identities),
        state,
        client: Arc::new(client),
    })
}

/// Dry-run state lives next to the real one, never in it.
///
/// `discovery-state.json` becomes `discovery-state.dry-run.json`.
pub fn dry_run_state_path(state_path: &Path) -> PathBuf {
    state_path.with_extension("dry-run.json")
}

/// Dry-run a refresh against a fixture
///
/// The local stores and the discovery service are simulated from the
/// fixture. The simulated service issues fabricated tokens, so the
/// confirmed set and token go to a separate dry-run state file (or
/// `state_override`); consecutive runs show the novel set shrinking.
pub async fn execute(
    config: &CdsConfig,
    fixture_path: String,
    targets: Vec<i64>,
    state_override: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let fixture = Fixture::load(Path::new(&fixture_path))?;
    let state_path = state_override
        .map(PathBuf::from)
        .unwrap_or_else(|| dry_run_state_path(&config.state.path));
    if state_path == config.state.path {
        return Err(format!(
            "Refusing to write simulated tokens to the configured state file '{}'",
            state_path.display()
        )
        .into());
    }
    let state = Arc::new(JsonFileStateStore::new(&state_path));
    let orchestrator =
        RefreshOrchestrator::new(collaborators(fixture, state.clone())?, &config.discovery)?;

    let result = if targets.is_empty() {
        println!("🔄 Refreshing all recipients and contacts...");
        orchestrator.refresh_all().await?
    } else {
        println!("🔄 Refreshing {} recipient(s)...", targets.len());
        let targets: Vec<RecipientId> = targets.into_iter().map(RecipientId).collect();
        orchestrator.refresh_subset(&targets).await?
    };

    print_summary(&result);

    let confirmed = state.load().await?;
    println!();
    println!("Dry-run state: {}", state_path.display());
    println!("  Confirmed identifiers: {}", confirmed.identifiers.len());

    Ok(())
}

fn print_summary(result: &RefreshResult) {
    let mut registered: Vec<_> = result.registered.iter().map(|id| id.0).collect();
    registered.sort_unstable();

    println!();
    println!("✅ Registered recipients: {}", registered.len());
    for id in registered {
        println!("   - {}", id);
    }
    println!("   Unregistered identifiers: {}", result.unregistered.len());
    if !result.rewrites.is_empty() {
        println!("   Rewritten identifiers: {}", result.rewrites.len());
    }
}
