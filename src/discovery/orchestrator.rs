//! Refresh Orchestrator
//!
//! Public entry point: `refresh_all` and `refresh_subset`.
//!
//! Both operations are single-flight: one async mutex guards the entire
//! load → diff → query → reconcile sequence, so a second caller waits
//! instead of interleaving a stale novel set with another call's token
//! write. The engine never retries; the scheduler that invokes it does.
//!
//! Phases of one call:
//!
//! ```text
//! Idle → BuildingCandidates → AwaitingNetwork → Reconciling → Idle
//!                  └──────────────┴─────────────────┴→ Failed
//! ```
//!
//! `Failed` stays visible until the next call starts building candidates.

use super::candidates::{build_candidate_set, novel_identifiers, NumberFormatter, SeparatorStripping};
use super::config::{ConfigError, DiscoveryConfig};
use super::identifier::{sanitize_all, Identifier};
use super::reconciler::{Reconciled, Reconciler};
use super::strategy::{full_sync_request, one_off_request, select_strategy, RefreshScope, Strategy};
use super::traits::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Phase of the refresh currently holding the single-flight lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    BuildingCandidates,
    AwaitingNetwork,
    Reconciling,
    Failed,
}

impl RefreshPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RefreshPhase::BuildingCandidates,
            2 => RefreshPhase::AwaitingNetwork,
            3 => RefreshPhase::Reconciling,
            4 => RefreshPhase::Failed,
            _ => RefreshPhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RefreshPhase::Idle => 0,
            RefreshPhase::BuildingCandidates => 1,
            RefreshPhase::AwaitingNetwork => 2,
            RefreshPhase::Reconciling => 3,
            RefreshPhase::Failed => 4,
        }
    }
}

/// External collaborators the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub recipients: Arc<dyn RecipientStore>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub identities: Arc<dyn IdentityStore>,
    pub state: Arc<dyn DiscoveryStateStore>,
    pub client: Arc<dyn DiscoveryClient>,
}

pub struct RefreshOrchestrator {
    collaborators: Collaborators,
    formatter: Arc<dyn NumberFormatter>,
    one_off_threshold: usize,
    request_timeout: Option<Duration>,
    flight: Mutex<()>,
    phase: AtomicU8,
}

impl RefreshOrchestrator {
    /// Create an orchestrator; fails only on an unparseable `request_timeout`.
    pub fn new(collaborators: Collaborators, config: &DiscoveryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            collaborators,
            formatter: Arc::new(SeparatorStripping),
            one_off_threshold: config.one_off_threshold,
            request_timeout: config.request_timeout()?,
            flight: Mutex::new(()),
            phase: AtomicU8::new(RefreshPhase::Idle.as_u8()),
        })
    }

    /// Replace the formatter applied to system contact numbers.
    pub fn with_formatter(mut self, formatter: Arc<dyn NumberFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn one_off_threshold(&self) -> usize {
        self.one_off_threshold
    }

    pub fn phase(&self) -> RefreshPhase {
        RefreshPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn enter(&self, phase: RefreshPhase) {
        debug!(phase = ?phase, "refresh phase");
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Refresh every recipient and system contact with a full synchronization.
    pub async fn refresh_all(&self) -> Result<RefreshResult, RefreshError> {
        let _flight = self.flight.lock().await;
        let outcome = self.refresh_all_locked().await;
        self.finish(outcome.map(Reconciled::into_refresh_result))
    }

    /// Refresh specific recipients.
    ///
    /// Up to `one_off_threshold` sanitized identifiers go out as a one-off
    /// request; more than that run `refresh_all` and the result is filtered
    /// down to the targets.
    pub async fn refresh_subset(
        &self,
        targets: &[RecipientId],
    ) -> Result<RefreshResult, RefreshError> {
        let _flight = self.flight.lock().await;

        self.enter(RefreshPhase::BuildingCandidates);
        let identifiers = match self.resolve_targets(targets).await {
            Ok(identifiers) => identifiers,
            Err(e) => return self.finish(Err(e)),
        };

        let strategy = select_strategy(
            RefreshScope::Targeted {
                target_count: identifiers.len(),
            },
            self.one_off_threshold,
        );
        info!(
            targets = targets.len(),
            sanitized = identifiers.len(),
            strategy = strategy.name(),
            "refreshing subset"
        );

        let outcome = match strategy {
            Strategy::ShortCircuit => Ok(Reconciled::default()),
            Strategy::OneOff => self.one_off_locked(targets, &identifiers).await,
            Strategy::DowngradedFullSync | Strategy::FullSync => self
                .refresh_all_locked()
                .await
                .map(|reconciled| reconciled.retain_targets(&identifiers)),
        };

        self.finish(outcome.map(Reconciled::into_refresh_result))
    }

    fn finish(
        &self,
        outcome: Result<RefreshResult, RefreshError>,
    ) -> Result<RefreshResult, RefreshError> {
        match &outcome {
            Ok(_) => self.enter(RefreshPhase::Idle),
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "refresh failed");
                self.enter(RefreshPhase::Failed);
            }
        }
        outcome
    }

    async fn resolve_targets(
        &self,
        targets: &[RecipientId],
    ) -> Result<BTreeSet<Identifier>, RefreshError> {
        let mut numbers = Vec::with_capacity(targets.len());
        for target in targets {
            let number = self
                .collaborators
                .recipients
                .identifier_for(*target)
                .await
                .map_err(RefreshError::LocalStore)?;
            numbers.extend(number);
        }
        Ok(sanitize_all(numbers))
    }

    async fn refresh_all_locked(&self) -> Result<Reconciled, RefreshError> {
        let c = &self.collaborators;
        let started = Instant::now();

        self.enter(RefreshPhase::BuildingCandidates);
        let stored = c.state.load().await.map_err(RefreshError::StateLoad)?;
        if stored.token.is_none() && !stored.identifiers.is_empty() {
            warn!(
                stored = stored.identifiers.len(),
                "stored identifiers have no token, starting cold"
            );
        }
        let confirmed = stored.into_effective();

        let recipient_numbers = c
            .recipients
            .all_known_identifiers()
            .await
            .map_err(RefreshError::LocalStore)?;
        let contact_numbers = c
            .contacts
            .all_display_numbers()
            .await
            .map_err(RefreshError::LocalStore)?;
        let candidates =
            build_candidate_set(recipient_numbers, contact_numbers, self.formatter.as_ref());
        if candidates.is_empty() && confirmed.is_empty() {
            debug!("nothing to discover and nothing confirmed, skipping full sync");
            return Ok(Reconciled::default());
        }
        let novel = novel_identifiers(&candidates, &confirmed.identifiers);

        let identities = c
            .identities
            .identity_material_for(&RecipientScope::All)
            .await
            .map_err(RefreshError::LocalStore)?;

        let candidates_ms = started.elapsed().as_millis();
        info!(
            candidates = candidates.len(),
            confirmed = confirmed.identifiers.len(),
            novel = novel.len(),
            has_token = confirmed.token.is_some(),
            "starting full sync"
        );

        let confirmed_after: BTreeSet<Identifier> =
            confirmed.identifiers.union(&candidates).cloned().collect();
        let request = full_sync_request(&confirmed, novel, identities);
        let queried = request.queried();

        self.enter(RefreshPhase::AwaitingNetwork);
        let network_started = Instant::now();
        let result = match self.query(request).await {
            Ok(result) => result,
            Err(DiscoveryError::InvalidToken) => {
                warn!("continuation token rejected, clearing discovery state");
                c.state.clear().await.map_err(RefreshError::Persistence)?;
                return Err(RefreshError::Discovery(DiscoveryError::InvalidToken));
            }
            Err(e) => return Err(e.into()),
        };
        let network_ms = network_started.elapsed().as_millis();

        self.enter(RefreshPhase::Reconciling);
        let reconcile_started = Instant::now();
        let reconciled = Reconciler::new(c.recipients.as_ref(), c.state.as_ref())
            .reconcile_full_sync(&queried, &candidates, &confirmed_after, result)
            .await?;

        info!(
            registered = reconciled.registered.len(),
            unregistered = reconciled.unregistered.len(),
            rewrites = reconciled.rewrites.len(),
            candidates_ms,
            network_ms,
            reconcile_ms = reconcile_started.elapsed().as_millis(),
            "full sync complete"
        );

        Ok(reconciled)
    }

    async fn one_off_locked(
        &self,
        targets: &[RecipientId],
        identifiers: &BTreeSet<Identifier>,
    ) -> Result<Reconciled, RefreshError> {
        let c = &self.collaborators;

        let identities = c
            .identities
            .identity_material_for(&RecipientScope::Only(targets.to_vec()))
            .await
            .map_err(RefreshError::LocalStore)?;

        let request = one_off_request(identifiers.clone(), identities);

        self.enter(RefreshPhase::AwaitingNetwork);
        let network_started = Instant::now();
        let result = self.query(request).await?;
        let network_ms = network_started.elapsed().as_millis();

        self.enter(RefreshPhase::Reconciling);
        let reconciled = Reconciler::new(c.recipients.as_ref(), c.state.as_ref())
            .reconcile_one_off(identifiers, result)
            .await?;

        info!(
            registered = reconciled.registered.len(),
            unregistered = reconciled.unregistered.len(),
            network_ms,
            "one-off lookup complete"
        );

        Ok(reconciled)
    }

    async fn query(&self, request: DiscoveryRequest) -> DiscoveryClientResult<DiscoveryResult> {
        let mode = request.mode;
        debug!(
            mode = mode.name(),
            previous = request.previous.len(),
            novel = request.novel.len(),
            identities = request.identities.len(),
            "sending discovery request"
        );

        let query = self.collaborators.client.query(request);
        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, query)
                .await
                .map_err(|_| DiscoveryError::Timeout(timeout))?,
            None => query.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::mock::*;
    use uuid::Uuid;

    struct Harness {
        recipients: InMemoryRecipientStore,
        contacts: InMemoryContactDirectory,
        state: InMemoryStateStore,
        client: MockDiscoveryClient,
        orchestrator: RefreshOrchestrator,
    }

    fn harness(config: DiscoveryConfig) -> Harness {
        let recipients = InMemoryRecipientStore::new();
        let contacts = InMemoryContactDirectory::default();
        let identities = InMemoryIdentityStore::new();
        let state = InMemoryStateStore::new();
        let client = MockDiscoveryClient::new();

        let orchestrator = RefreshOrchestrator::new(
            Collaborators {
                recipients: Arc::new(recipients.clone()),
                contacts: Arc::new(contacts.clone()),
                identities: Arc::new(identities),
                state: Arc::new(state.clone()),
                client: Arc::new(client.clone()),
            },
            &config,
        )
        .unwrap();

        Harness {
            recipients,
            contacts,
            state,
            client,
            orchestrator,
        }
    }

    fn id(s: &str) -> Identifier {
        Identifier::sanitize(s).unwrap()
    }

    fn registration(n: u128) -> Registration {
        Registration {
            primary: ServiceId(Uuid::from_u128(n)),
            secondary: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_all_cold_start() {
        let h = harness(DiscoveryConfig::default());
        h.contacts.set_numbers(["+15551234567"]);
        h.client.register(id("+15551234567"), registration(1));

        let result = h.orchestrator.refresh_all().await.unwrap();

        assert_eq!(result.registered.len(), 1);
        assert!(result.rewrites.is_empty());
        assert_eq!(
            h.state.snapshot().identifiers,
            [id("+15551234567")].into_iter().collect()
        );
        assert_eq!(h.orchestrator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_refresh_all_discloses_only_novel() {
        let h = harness(DiscoveryConfig::default());
        h.recipients.insert(RecipientId(1), "+15550000001");
        h.orchestrator.refresh_all().await.unwrap();
        let first_token = h.state.snapshot().token;

        h.contacts.set_numbers(["+15550000002"]);
        h.orchestrator.refresh_all().await.unwrap();

        let requests = h.client.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].previous, [id("+15550000001")].into_iter().collect());
        assert_eq!(requests[1].novel, [id("+15550000002")].into_iter().collect());
        assert_eq!(requests[1].token, first_token);
    }

    #[tokio::test]
    async fn test_subset_empty_short_circuits() {
        let h = harness(DiscoveryConfig::default());
        h.recipients.insert(RecipientId(1), "abc");
        h.recipients.insert_without_number(RecipientId(2));

        let result = h
            .orchestrator
            .refresh_subset(&[RecipientId(1), RecipientId(2)])
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(h.client.request_count(), 0);
    }

    #[tokio::test]
    async fn test_subset_one_off_leaves_state() {
        let h = harness(DiscoveryConfig::default());
        h.recipients.insert(RecipientId(1), "+15550000001");
        h.client.register(id("+15550000001"), registration(1));

        let result = h.orchestrator.refresh_subset(&[RecipientId(1)]).await.unwrap();

        assert_eq!(result.registered, [RecipientId(1)].into_iter().collect());
        assert!(h.state.snapshot().is_empty());
        assert_eq!(h.client.requests()[0].mode, RequestMode::OneOff);
    }

    #[tokio::test]
    async fn test_network_failure_leaves_failed_phase() {
        let h = harness(DiscoveryConfig::default());
        h.recipients.insert(RecipientId(1), "+15550000001");
        h.client.fail_next(DiscoveryError::Network("down".to_string()));

        let err = h.orchestrator.refresh_all().await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(h.orchestrator.phase(), RefreshPhase::Failed);
        assert!(h.state.snapshot().is_empty());

        h.orchestrator.refresh_all().await.unwrap();
        assert_eq!(h.orchestrator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_empty_cold_start_skips_network() {
        let h = harness(DiscoveryConfig::default());
        h.recipients.insert(RecipientId(1), "not a number");

        let result = h.orchestrator.refresh_all().await.unwrap();

        assert!(result.is_empty());
        assert_eq!(h.client.request_count(), 0);
        assert_eq!(h.state.save_count(), 0);
        assert_eq!(h.orchestrator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_empty_candidates_with_confirmed_set_still_syncs() {
        let h = harness(DiscoveryConfig::default());
        h.contacts.set_numbers(["+15550000001"]);
        h.orchestrator.refresh_all().await.unwrap();

        h.contacts.set_numbers(Vec::<String>::new());
        h.orchestrator.refresh_all().await.unwrap();

        let requests = h.client.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].novel.is_empty());
        assert_eq!(requests[1].previous, [id("+15550000001")].into_iter().collect());
    }

    #[tokio::test]
    async fn test_invalid_token_clears_state() {
        let h = harness(DiscoveryConfig::default());
        h.recipients.insert(RecipientId(1), "+15550000001");
        h.orchestrator.refresh_all().await.unwrap();
        assert!(!h.state.snapshot().is_empty());

        h.client.fail_next(DiscoveryError::InvalidToken);
        let err = h.orchestrator.refresh_all().await.unwrap_err();

        assert!(matches!(
            err,
            RefreshError::Discovery(DiscoveryError::InvalidToken)
        ));
        assert!(h.state.snapshot().is_empty());

        h.orchestrator.refresh_all().await.unwrap();
        let last = h.client.requests().pop().unwrap();
        assert!(last.previous.is_empty());
        assert!(last.token.is_none());
        assert_eq!(last.novel, [id("+15550000001")].into_iter().collect());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let h = harness(DiscoveryConfig {
            request_timeout: Some("20ms".to_string()),
            ..Default::default()
        });
        h.recipients.insert(RecipientId(1), "+15550000001");
        h.client.set_latency(Duration::from_millis(500));

        let err = h.orchestrator.refresh_all().await.unwrap_err();

        assert!(matches!(
            err,
            RefreshError::Discovery(DiscoveryError::Timeout(_))
        ));
        assert!(h.state.snapshot().is_empty());
        assert_eq!(h.client.in_flight_queries(), 0);
    }

    #[tokio::test]
    async fn test_set_without_token_is_cold_start() {
        let h = harness(DiscoveryConfig::default());
        let stale = InMemoryStateStore::with_confirmed(ConfirmedSet {
            identifiers: [id("+15550000001")].into_iter().collect(),
            token: None,
        });
        let orchestrator = RefreshOrchestrator::new(
            Collaborators {
                recipients: Arc::new(h.recipients.clone()),
                contacts: Arc::new(h.contacts.clone()),
                identities: Arc::new(InMemoryIdentityStore::new()),
                state: Arc::new(stale.clone()),
                client: Arc::new(h.client.clone()),
            },
            &DiscoveryConfig::default(),
        )
        .unwrap();
        h.recipients.insert(RecipientId(1), "+15550000001");

        orchestrator.refresh_all().await.unwrap();

        let request = &h.client.requests()[0];
        assert!(request.previous.is_empty());
        assert_eq!(request.novel, [id("+15550000001")].into_iter().collect());
        assert!(stale.snapshot().token.is_some());
    }

    #[test]
    fn test_invalid_timeout_rejected_at_construction() {
        let result = RefreshOrchestrator::new(
            Collaborators {
                recipients: Arc::new(InMemoryRecipientStore::new()),
                contacts: Arc::new(InMemoryContactDirectory::default()),
                identities: Arc::new(InMemoryIdentityStore::new()),
                state: Arc::new(InMemoryStateStore::new()),
                client: Arc::new(MockDiscoveryClient::new()),
            },
            &DiscoveryConfig {
                request_timeout: Some("whenever".to_string()),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }
}
