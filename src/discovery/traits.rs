//! Discovery Collaborator Traits
//!
//! The engine owns no transport and no storage. Everything it touches is
//! reached through these traits so the whole refresh pipeline can run
//! against the in-memory collaborators in `mock.rs`.

use super::identifier::Identifier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Local recipient reference (row id in the recipient store)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipientId(pub i64);

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipientId({})", self.0)
    }
}

/// Long-lived service identifier of a registered account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub Uuid);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key material paired with a `ServiceId` for the discovery exchange.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKey(pub [u8; 32]);

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityKey(..)")
    }
}

/// Identity material for known registered accounts. Read-only to the engine.
pub type ServiceIdentityMap = HashMap<ServiceId, IdentityKey>;

/// Opaque server-side negative cache key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken(pub Vec<u8>);

impl ContinuationToken {
    /// Short hex prefix, safe to display.
    pub fn fingerprint(&self) -> String {
        let n = self.0.len().min(4);
        hex::encode(&self.0[..n])
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContinuationToken({}..)", self.fingerprint())
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Identifiers previously disclosed in a successful full synchronization,
/// with the token that lets the service recognise them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedSet {
    pub identifiers: BTreeSet<Identifier>,
    pub token: Option<ContinuationToken>,
}

impl ConfirmedSet {
    /// Cold start: nothing confirmed, no token.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty() && self.token.is_none()
    }

    /// Identifiers without a token cover nothing server-side; treat as cold start.
    pub fn into_effective(self) -> Self {
        match self.token {
            Some(_) => self,
            None => Self::empty(),
        }
    }
}

/// Registration returned for a single identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub primary: ServiceId,
    pub secondary: Option<ServiceId>,
}

/// Per-identifier discovery results for one round trip.
///
/// Unqueried or unregistered identifiers are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub registered: HashMap<Identifier, Registration>,
    /// Identifiers the service says should be re-keyed (old -> new)
    pub rewrites: HashMap<Identifier, Identifier>,
    /// New token; required on a full synchronization, ignored on one-off
    pub continuation_token: Option<ContinuationToken>,
}

/// Engine output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshResult {
    /// Recipients now known to be registered
    pub registered: HashSet<RecipientId>,
    /// Re-keyed identifiers (old -> new); may be empty
    pub rewrites: HashMap<Identifier, Identifier>,
    /// Queried identifiers the service did not report as registered
    pub unregistered: BTreeSet<Identifier>,
}

impl RefreshResult {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.rewrites.is_empty() && self.unregistered.is_empty()
    }
}

/// Which recipients' identity material a request carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientScope {
    All,
    Only(Vec<RecipientId>),
}

/// Request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Discloses only the novel set; previous identifiers ride on the token
    FullSync,
    /// Bypasses the negative cache; fixed rate-limit cost per call
    OneOff,
}

impl RequestMode {
    pub fn name(&self) -> &'static str {
        match self {
            RequestMode::FullSync => "full_sync",
            RequestMode::OneOff => "one_off",
        }
    }
}

/// A shaped request handed to the [`DiscoveryClient`].
///
/// Build through `strategy::full_sync_request` / `strategy::one_off_request`.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub mode: RequestMode,
    /// Identifiers covered by `token` (always empty for one-off)
    pub previous: BTreeSet<Identifier>,
    /// Identifiers disclosed as new
    pub novel: BTreeSet<Identifier>,
    pub identities: ServiceIdentityMap,
    /// Always `None` for one-off
    pub token: Option<ContinuationToken>,
}

impl DiscoveryRequest {
    /// Every identifier the service will report on.
    pub fn queried(&self) -> BTreeSet<Identifier> {
        self.previous.union(&self.novel).cloned().collect()
    }
}

/// Result type for discovery client calls
pub type DiscoveryClientResult<T> = Result<T, DiscoveryError>;

/// Result type for local store calls
pub type StoreResult<T> = Result<T, StoreError>;

/// Discovery client (transport) errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by discovery service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Continuation token rejected by discovery service")]
    InvalidToken,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Discovery request timed out after {0:?}")]
    Timeout(Duration),
}

/// Local store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store data: {0}")]
    Corrupt(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Engine errors surfaced by `refresh_all` / `refresh_subset`
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Discovery request failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to load discovery state: {0}")]
    StateLoad(#[source] StoreError),

    #[error("Failed to persist discovery state: {0}")]
    Persistence(#[source] StoreError),

    #[error("Local store error: {0}")]
    LocalStore(#[source] StoreError),
}

impl RefreshError {
    /// Whether a later attempt may succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            RefreshError::Discovery(e) => matches!(
                e,
                DiscoveryError::Network(_)
                    | DiscoveryError::RateLimited { .. }
                    | DiscoveryError::Timeout(_)
                    | DiscoveryError::InvalidToken
            ),
            RefreshError::Persistence(_) => true,
            RefreshError::StateLoad(_) | RefreshError::LocalStore(_) => false,
        }
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RefreshError::Discovery(DiscoveryError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

/// Local recipient store
#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Every phone number held by a local recipient (unsanitized)
    async fn all_known_identifiers(&self) -> StoreResult<HashSet<String>>;

    /// Phone number of a recipient, if it has one
    async fn identifier_for(&self, recipient: RecipientId) -> StoreResult<Option<String>>;

    /// Resolve or create the recipient(s) for `identifier` and mark them
    /// registered. Must be idempotent: replaying the same registration is a no-op.
    async fn apply_registration(
        &self,
        identifier: &Identifier,
        registration: &Registration,
    ) -> StoreResult<HashSet<RecipientId>>;

    /// Mark recipients with these identifiers as not registered
    async fn mark_unregistered(&self, identifiers: &BTreeSet<Identifier>) -> StoreResult<()>;

    /// Re-key recipients from old to new identifiers
    async fn apply_rewrites(&self, rewrites: &HashMap<Identifier, Identifier>) -> StoreResult<()>;
}

/// System contact directory
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Display numbers of all system contacts (formatted or formattable)
    async fn all_display_numbers(&self) -> StoreResult<HashSet<String>>;
}

/// Source of identity material for the discovery exchange
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn identity_material_for(&self, scope: &RecipientScope)
        -> StoreResult<ServiceIdentityMap>;
}

/// Persists the confirmed set and its token as one unit
#[async_trait]
pub trait DiscoveryStateStore: Send + Sync {
    /// Empty `ConfirmedSet` when nothing is stored
    async fn load(&self) -> StoreResult<ConfirmedSet>;

    /// Atomically replace the stored set and token
    async fn save(
        &self,
        identifiers: &BTreeSet<Identifier>,
        token: &ContinuationToken,
    ) -> StoreResult<()>;

    /// Forget the stored set and token
    async fn clear(&self) -> StoreResult<()>;
}

/// Remote discovery service client (black box PSI exchange)
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn query(&self, request: DiscoveryRequest) -> DiscoveryClientResult<DiscoveryResult>;
}
