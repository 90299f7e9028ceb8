//! Contact Discovery Synchronization Engine
//!
//! Determines which locally known phone numbers belong to registered users
//! while disclosing as little as possible to the discovery service:
//! - Full syncs disclose only identifiers not yet confirmed
//! - Previously confirmed identifiers ride on an opaque continuation token
//! - Small targeted lookups go out as one-off requests
//! - The confirmed set changes only after a successful full sync
//!
//! Data flow:
//!
//! ```text
//! recipients ∪ contacts → sanitize → diff vs confirmed → strategy
//!     → discovery client → reconcile (recipients + state store) → RefreshResult
//! ```

pub mod candidates;
pub mod config;
pub mod identifier;
pub mod mock;
pub mod orchestrator;
pub mod reconciler;
pub mod state_file;
pub mod strategy;
pub mod traits;

#[cfg(test)]
mod proptests;

pub use candidates::{build_candidate_set, novel_identifiers, NumberFormatter, SeparatorStripping};
pub use config::{ConfigError, DiscoveryConfig};
pub use identifier::Identifier;
pub use orchestrator::{Collaborators, RefreshOrchestrator, RefreshPhase};
pub use state_file::JsonFileStateStore;
pub use strategy::{select_strategy, RefreshScope, Strategy};
pub use traits::{
    ConfirmedSet, ContactDirectory, ContinuationToken, DiscoveryClient, DiscoveryError,
    DiscoveryRequest, DiscoveryResult, DiscoveryStateStore, IdentityKey, IdentityStore,
    RecipientId, RecipientScope, RecipientStore, RefreshError, RefreshResult, Registration,
    RequestMode, ServiceId, ServiceIdentityMap, StoreError,
};
