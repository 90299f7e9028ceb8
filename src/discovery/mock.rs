//! In-memory Discovery Collaborators
//!
//! Provides in-memory stores and `MockDiscoveryClient` for tests and for the
//! `cds-sync refresh --fixture` dry run, without a real discovery service.

use super::identifier::Identifier;
use super::traits::*;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Registration state of an in-memory recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisteredState {
    Unknown,
    Registered(Registration),
    NotRegistered,
}

#[derive(Debug, Clone)]
struct RecipientRecord {
    number: Option<String>,
    state: RegisteredState,
}

#[derive(Default)]
struct RecipientState {
    records: BTreeMap<RecipientId, RecipientRecord>,
    next_id: i64,
    registration_writes: usize,
}

/// In-memory recipient store
#[derive(Clone, Default)]
pub struct InMemoryRecipientStore {
    state: Arc<Mutex<RecipientState>>,
}

impl InMemoryRecipientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a recipient with a raw phone number
    pub fn insert(&self, id: RecipientId, number: &str) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            id,
            RecipientRecord {
                number: Some(number.to_string()),
                state: RegisteredState::Unknown,
            },
        );
        state.next_id = state.next_id.max(id.0 + 1);
    }

    /// Add a recipient that has no phone number
    pub fn insert_without_number(&self, id: RecipientId) {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            id,
            RecipientRecord {
                number: None,
                state: RegisteredState::Unknown,
            },
        );
        state.next_id = state.next_id.max(id.0 + 1);
    }

    pub fn recipient_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn number_of(&self, id: RecipientId) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&id)
            .and_then(|r| r.number.clone())
    }

    pub fn state_of(&self, id: RecipientId) -> Option<RegisteredState> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.state.clone())
    }

    /// Whether any recipient with this identifier is registered
    pub fn is_registered(&self, identifier: &Identifier) -> bool {
        self.state.lock().unwrap().records.values().any(|r| {
            r.number.as_deref() == Some(identifier.as_str())
                && matches!(r.state, RegisteredState::Registered(_))
        })
    }

    /// Number of registration writes that changed state
    pub fn registration_writes(&self) -> usize {
        self.state.lock().unwrap().registration_writes
    }
}

#[async_trait]
impl RecipientStore for InMemoryRecipientStore {
    async fn all_known_identifiers(&self) -> StoreResult<HashSet<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .values()
            .filter_map(|r| r.number.clone())
            .collect())
    }

    async fn identifier_for(&self, recipient: RecipientId) -> StoreResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.records.get(&recipient).and_then(|r| r.number.clone()))
    }

    async fn apply_registration(
        &self,
        identifier: &Identifier,
        registration: &Registration,
    ) -> StoreResult<HashSet<RecipientId>> {
        let mut state = self.state.lock().unwrap();

        let mut matched: HashSet<RecipientId> = state
            .records
            .iter()
            .filter(|(_, r)| r.number.as_deref() == Some(identifier.as_str()))
            .map(|(id, _)| *id)
            .collect();

        if matched.is_empty() {
            let id = RecipientId(state.next_id);
            state.next_id += 1;
            state.records.insert(
                id,
                RecipientRecord {
                    number: Some(identifier.as_str().to_string()),
                    state: RegisteredState::Unknown,
                },
            );
            matched.insert(id);
        }

        let target = RegisteredState::Registered(*registration);
        let mut writes = 0;
        for id in &matched {
            if let Some(record) = state.records.get_mut(id) {
                if record.state != target {
                    record.state = target.clone();
                    writes += 1;
                }
            }
        }
        state.registration_writes += writes;

        Ok(matched)
    }

    async fn mark_unregistered(&self, identifiers: &BTreeSet<Identifier>) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        for record in state.records.values_mut() {
            let hit = record
                .number
                .as_deref()
                .and_then(Identifier::sanitize)
                .map(|n| identifiers.contains(&n))
                .unwrap_or(false);
            if hit {
                record.state = RegisteredState::NotRegistered;
            }
        }
        Ok(())
    }

    async fn apply_rewrites(&self, rewrites: &HashMap<Identifier, Identifier>) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        for record in state.records.values_mut() {
            let new = record
                .number
                .as_deref()
                .and_then(Identifier::sanitize)
                .and_then(|old| rewrites.get(&old));
            if let Some(new) = new {
                record.number = Some(new.as_str().to_string());
            }
        }
        Ok(())
    }
}

/// In-memory system contact directory
#[derive(Clone, Default)]
pub struct InMemoryContactDirectory {
    numbers: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryContactDirectory {
    pub fn new<I, S>(numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            numbers: Arc::new(Mutex::new(numbers.into_iter().map(Into::into).collect())),
        }
    }

    pub fn set_numbers<I, S>(&self, numbers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.numbers.lock().unwrap() = numbers.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContactDirectory {
    async fn all_display_numbers(&self) -> StoreResult<HashSet<String>> {
        Ok(self.numbers.lock().unwrap().clone())
    }
}

/// In-memory identity store
#[derive(Clone, Default)]
pub struct InMemoryIdentityStore {
    identities: Arc<Mutex<BTreeMap<RecipientId, (ServiceId, IdentityKey)>>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recipient: RecipientId, service_id: ServiceId, key: IdentityKey) {
        self.identities
            .lock()
            .unwrap()
            .insert(recipient, (service_id, key));
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn identity_material_for(
        &self,
        scope: &RecipientScope,
    ) -> StoreResult<ServiceIdentityMap> {
        let identities = self.identities.lock().unwrap();
        let map = match scope {
            RecipientScope::All => identities
                .values()
                .map(|(sid, key)| (*sid, key.clone()))
                .collect(),
            RecipientScope::Only(ids) => ids
                .iter()
                .filter_map(|id| identities.get(id))
                .map(|(sid, key)| (*sid, key.clone()))
                .collect(),
        };
        Ok(map)
    }
}

#[derive(Default)]
struct StateStoreInner {
    confirmed: ConfirmedSet,
    save_count: usize,
    fail_next_save: bool,
    fail_next_load: bool,
}

/// In-memory discovery state store
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<StateStoreInner>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing confirmed set
    pub fn with_confirmed(confirmed: ConfirmedSet) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().confirmed = confirmed;
        store
    }

    pub fn snapshot(&self) -> ConfirmedSet {
        self.inner.lock().unwrap().confirmed.clone()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().unwrap().save_count
    }

    pub fn fail_next_save(&self) {
        self.inner.lock().unwrap().fail_next_save = true;
    }

    pub fn fail_next_load(&self) {
        self.inner.lock().unwrap().fail_next_load = true;
    }
}

#[async_trait]
impl DiscoveryStateStore for InMemoryStateStore {
    async fn load(&self) -> StoreResult<ConfirmedSet> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_next_load) {
            return Err(StoreError::Backend("injected load failure".to_string()));
        }
        Ok(inner.confirmed.clone())
    }

    async fn save(
        &self,
        identifiers: &BTreeSet<Identifier>,
        token: &ContinuationToken,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if std::mem::take(&mut inner.fail_next_save) {
            return Err(StoreError::Backend("injected save failure".to_string()));
        }
        inner.confirmed = ConfirmedSet {
            identifiers: identifiers.clone(),
            token: Some(token.clone()),
        };
        inner.save_count += 1;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.inner.lock().unwrap().confirmed = ConfirmedSet::empty();
        Ok(())
    }
}

#[derive(Default)]
struct ClientState {
    directory: HashMap<Identifier, Registration>,
    rewrites: HashMap<Identifier, Identifier>,
    requests: Vec<DiscoveryRequest>,
    queued_failures: VecDeque<DiscoveryError>,
    next_token: u64,
    latency: Option<Duration>,
}

/// Mock discovery client backed by a simulated directory
#[derive(Clone, Default)]
pub struct MockDiscoveryClient {
    state: Arc<Mutex<ClientState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockDiscoveryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identifier in the simulated directory
    pub fn register(&self, identifier: Identifier, registration: Registration) {
        self.state
            .lock()
            .unwrap()
            .directory
            .insert(identifier, registration);
    }

    /// Remove an identifier from the simulated directory
    pub fn unregister(&self, identifier: &Identifier) {
        self.state.lock().unwrap().directory.remove(identifier);
    }

    /// Report `old` as re-keyed to `new` whenever it is queried
    pub fn add_rewrite(&self, old: Identifier, new: Identifier) {
        self.state.lock().unwrap().rewrites.insert(old, new);
    }

    /// Fail the next query with `error`
    pub fn fail_next(&self, error: DiscoveryError) {
        self.state.lock().unwrap().queued_failures.push_back(error);
    }

    /// Delay every query by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    /// Requests received so far (including failed ones)
    pub fn requests(&self) -> Vec<DiscoveryRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// Queries currently awaiting a reply
    pub fn in_flight_queries(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of queries observed running at once
    pub fn max_concurrent_queries(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &DiscoveryRequest) -> DiscoveryClientResult<DiscoveryResult> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if let Some(error) = state.queued_failures.pop_front() {
            return Err(error);
        }

        let queried = request.queried();
        let rewrites: HashMap<Identifier, Identifier> = state
            .rewrites
            .iter()
            .filter(|(old, _)| queried.contains(*old))
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        // Renumbered identifiers are reported under their new value
        let registered = state
            .directory
            .iter()
            .filter(|(identifier, _)| {
                queried.contains(*identifier) || rewrites.values().any(|new| new == *identifier)
            })
            .map(|(identifier, registration)| (identifier.clone(), *registration))
            .collect();

        let continuation_token = match request.mode {
            RequestMode::FullSync => {
                state.next_token += 1;
                Some(ContinuationToken(state.next_token.to_be_bytes().to_vec()))
            }
            RequestMode::OneOff => None,
        };

        Ok(DiscoveryResult {
            registered,
            rewrites,
            continuation_token,
        })
    }
}

/// Decrements the in-flight counter even when the query future is dropped
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscoveryClient for MockDiscoveryClient {
    async fn query(&self, request: DiscoveryRequest) -> DiscoveryClientResult<DiscoveryResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(self.in_flight.clone());
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = self.state.lock().unwrap().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.respond(&request)
    }
}
