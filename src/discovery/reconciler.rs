//! Result Reconciler
//!
//! Applies a `DiscoveryResult` to the recipient store and, for a full
//! synchronization, advances the confirmed set and token.
//!
//! Full sync ordering:
//! 1. Require a new continuation token in the reply
//! 2. Persist `previous ∪ submitted` with the new token (one atomic save)
//! 3. Apply rewrites, registrations, then unregistered marks
//!
//! Persisting before step 3 is safe because registration application is
//! idempotent and every later full sync reports on the whole confirmed set
//! again. A failed save aborts before any registration side effect, so the
//! next cycle recomputes the same novel set.
//!
//! One-off requests never touch the state store.

use super::identifier::Identifier;
use super::traits::{
    DiscoveryError, DiscoveryResult, DiscoveryStateStore, RecipientId, RecipientStore,
    RefreshError, RefreshResult,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Output of a reconciliation, keyed so results can be filtered by identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub registered: HashMap<RecipientId, Identifier>,
    pub rewrites: HashMap<Identifier, Identifier>,
    pub unregistered: BTreeSet<Identifier>,
}

impl Reconciled {
    /// Keep only entries whose identifier is in `targets`.
    ///
    /// A registration reported under a rewritten identifier is kept when
    /// the identifier it replaced is a target.
    pub fn retain_targets(mut self, targets: &BTreeSet<Identifier>) -> Self {
        self.rewrites.retain(|old, _| targets.contains(old));
        let renumbered: BTreeSet<&Identifier> = self.rewrites.values().collect();
        self.registered.retain(|_, identifier| {
            targets.contains(identifier) || renumbered.contains(identifier)
        });
        self.unregistered.retain(|identifier| targets.contains(identifier));
        self
    }

    pub fn into_refresh_result(self) -> RefreshResult {
        RefreshResult {
            registered: self.registered.into_keys().collect(),
            rewrites: self.rewrites,
            unregistered: self.unregistered,
        }
    }
}

pub struct Reconciler<'a> {
    recipients: &'a dyn RecipientStore,
    state: &'a dyn DiscoveryStateStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(recipients: &'a dyn RecipientStore, state: &'a dyn DiscoveryStateStore) -> Self {
        Self { recipients, state }
    }

    /// Reconcile a full synchronization.
    ///
    /// * `queried` - everything the service reports on (previous ∪ novel)
    /// * `candidates` - this cycle's candidate set; absent ones are marked unregistered
    /// * `confirmed_after` - previous confirmed identifiers ∪ candidates
    pub async fn reconcile_full_sync(
        &self,
        queried: &BTreeSet<Identifier>,
        candidates: &BTreeSet<Identifier>,
        confirmed_after: &BTreeSet<Identifier>,
        result: DiscoveryResult,
    ) -> Result<Reconciled, RefreshError> {
        let token = result.continuation_token.clone().ok_or_else(|| {
            DiscoveryError::Protocol("full sync reply carried no continuation token".to_string())
        })?;

        self.state
            .save(confirmed_after, &token)
            .await
            .map_err(RefreshError::Persistence)?;

        debug!(
            confirmed = confirmed_after.len(),
            token = %token.fingerprint(),
            "confirmed set advanced"
        );

        self.apply(queried, candidates, result).await
    }

    /// Reconcile a one-off request. The confirmed set is not touched.
    pub async fn reconcile_one_off(
        &self,
        queried: &BTreeSet<Identifier>,
        result: DiscoveryResult,
    ) -> Result<Reconciled, RefreshError> {
        self.apply(queried, queried, result).await
    }

    async fn apply(
        &self,
        queried: &BTreeSet<Identifier>,
        candidates: &BTreeSet<Identifier>,
        result: DiscoveryResult,
    ) -> Result<Reconciled, RefreshError> {
        let DiscoveryResult {
            mut registered,
            mut rewrites,
            ..
        } = result;

        let before = registered.len() + rewrites.len();
        rewrites.retain(|old, _| queried.contains(old));
        // Renumbered identifiers come back registered under their new value
        let renumbered: BTreeSet<&Identifier> = rewrites.values().collect();
        registered.retain(|identifier, _| {
            queried.contains(identifier) || renumbered.contains(identifier)
        });
        let stray = before - registered.len() - rewrites.len();
        if stray > 0 {
            warn!(stray, "dropping results for identifiers that were not queried");
        }

        if !rewrites.is_empty() {
            debug!(count = rewrites.len(), "applying identifier rewrites");
            self.recipients
                .apply_rewrites(&rewrites)
                .await
                .map_err(RefreshError::LocalStore)?;
        }

        let mut reconciled = Reconciled::default();

        for (identifier, registration) in &registered {
            let ids = self
                .recipients
                .apply_registration(identifier, registration)
                .await
                .map_err(RefreshError::LocalStore)?;

            for id in ids {
                reconciled.registered.insert(id, identifier.clone());
            }
        }

        let unregistered: BTreeSet<Identifier> = candidates
            .iter()
            .filter(|identifier| {
                !registered.contains_key(*identifier) && !rewrites.contains_key(*identifier)
            })
            .cloned()
            .collect();

        if !unregistered.is_empty() {
            self.recipients
                .mark_unregistered(&unregistered)
                .await
                .map_err(RefreshError::LocalStore)?;
        }

        reconciled.rewrites = rewrites;
        reconciled.unregistered = unregistered;
        Ok(reconciled)
    }
}
