//! Property-based tests for the discovery engine
//!
//! Tests for:
//! - Sanitization: idempotence, canonical form
//! - Set algebra: novel = candidates − confirmed, disjointness
//! - Strategy: threshold behaviour
//! - Refresh: monotonic confirmed set, one-off immutability, failure atomicity

use super::candidates::novel_identifiers;
use super::config::DiscoveryConfig;
use super::identifier::Identifier;
use super::mock::*;
use super::orchestrator::{Collaborators, RefreshOrchestrator};
use super::strategy::{select_strategy, RefreshScope, Strategy as RequestStrategy};
use super::traits::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn raw_number() -> impl Strategy<Value = String> {
    prop_oneof![
        "\\+[1-9][0-9]{6,14}",
        "\\+0[0-9]{0,5}",
        "[0-9+ ()-]{0,16}",
        ".{0,12}",
    ]
}

fn valid_set(max: usize) -> impl Strategy<Value = BTreeSet<Identifier>> {
    prop::collection::btree_set("\\+1555[0-9]{3}", 0..max)
        .prop_map(|raw| raw.iter().filter_map(|s| Identifier::sanitize(s)).collect())
}

fn non_empty_set(max: usize) -> impl Strategy<Value = BTreeSet<Identifier>> {
    prop::collection::btree_set("\\+1555[0-9]{3}", 1..max)
        .prop_map(|raw| raw.iter().filter_map(|s| Identifier::sanitize(s)).collect())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn orchestrator(
    recipients: &InMemoryRecipientStore,
    state: &InMemoryStateStore,
    client: &MockDiscoveryClient,
    threshold: usize,
) -> RefreshOrchestrator {
    RefreshOrchestrator::new(
        Collaborators {
            recipients: Arc::new(recipients.clone()),
            contacts: Arc::new(InMemoryContactDirectory::default()),
            identities: Arc::new(InMemoryIdentityStore::new()),
            state: Arc::new(state.clone()),
            client: Arc::new(client.clone()),
        },
        &DiscoveryConfig::with_threshold(threshold),
    )
    .unwrap()
}

proptest! {
    /// Property: Sanitizing twice equals sanitizing once
    #[test]
    fn sanitize_is_idempotent(raw in raw_number()) {
        let once = Identifier::sanitize(&raw);
        let twice = once.as_ref().and_then(|id| Identifier::sanitize(id.as_str()));
        prop_assert_eq!(once, twice);
    }

    /// Property: Accepted identifiers are prefix + non-zero-leading digits
    #[test]
    fn sanitized_form_is_canonical(raw in raw_number()) {
        if let Some(id) = Identifier::sanitize(&raw) {
            let digits = id.as_str().strip_prefix('+').unwrap();
            prop_assert!(!digits.is_empty());
            prop_assert!(!digits.starts_with('0'));
            prop_assert!(digits.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    /// Property: Novel set is exactly candidates minus confirmed
    #[test]
    fn novel_is_difference(candidates in valid_set(40), confirmed in valid_set(40)) {
        let novel = novel_identifiers(&candidates, &confirmed);

        prop_assert!(novel.is_disjoint(&confirmed));
        prop_assert!(novel.is_subset(&candidates));
        for id in &candidates {
            prop_assert_eq!(novel.contains(id), !confirmed.contains(id));
        }
    }

    /// Property: Targeted refreshes pick one-off up to K, full sync above
    #[test]
    fn strategy_threshold(count in 0usize..50, k in 0usize..20) {
        let strategy = select_strategy(RefreshScope::Targeted { target_count: count }, k);
        let expected = if count == 0 {
            RequestStrategy::ShortCircuit
        } else if count > k {
            RequestStrategy::DowngradedFullSync
        } else {
            RequestStrategy::OneOff
        };
        prop_assert_eq!(strategy, expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: Each successful refresh_all yields a superset of the previous confirmed set
    #[test]
    fn confirmed_set_is_monotonic(rounds in prop::collection::vec(valid_set(10), 1..5)) {
        let rt = runtime();
        let recipients = InMemoryRecipientStore::new();
        let state = InMemoryStateStore::new();
        let client = MockDiscoveryClient::new();
        let engine = orchestrator(&recipients, &state, &client, 3);

        let mut next_id = 1;
        for round in rounds {
            for id in &round {
                recipients.insert(RecipientId(next_id), id.as_str());
                next_id += 1;
            }
            let before = state.snapshot().identifiers;
            rt.block_on(engine.refresh_all()).unwrap();
            let after = state.snapshot().identifiers;

            prop_assert!(after.is_superset(&before));
            prop_assert!(after.is_superset(&round));
        }
    }

    /// Property: One-off refreshes never change the confirmed set or token
    #[test]
    fn one_off_never_mutates_state(targets in valid_set(4), seeded in valid_set(10)) {
        let rt = runtime();
        let recipients = InMemoryRecipientStore::new();
        let state = InMemoryStateStore::with_confirmed(ConfirmedSet {
            identifiers: seeded,
            token: Some(ContinuationToken(vec![7, 7, 7])),
        });
        let client = MockDiscoveryClient::new();
        let engine = orchestrator(&recipients, &state, &client, 3);

        let ids: Vec<RecipientId> = targets
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let rid = RecipientId(i as i64 + 1);
                recipients.insert(rid, id.as_str());
                rid
            })
            .collect();

        let before = state.snapshot();
        rt.block_on(engine.refresh_subset(&ids)).unwrap();

        prop_assert_eq!(state.snapshot(), before);
        prop_assert_eq!(state.save_count(), 0);
    }

    /// Property: A failed discovery call leaves the state untouched
    #[test]
    fn failure_leaves_no_trace(first in valid_set(10), second in non_empty_set(10)) {
        let rt = runtime();
        let recipients = InMemoryRecipientStore::new();
        let state = InMemoryStateStore::new();
        let client = MockDiscoveryClient::new();
        let engine = orchestrator(&recipients, &state, &client, 3);

        let mut next_id = 1;
        for id in &first {
            recipients.insert(RecipientId(next_id), id.as_str());
            next_id += 1;
        }
        rt.block_on(engine.refresh_all()).unwrap();

        for id in &second {
            recipients.insert(RecipientId(next_id), id.as_str());
            next_id += 1;
        }
        let before = state.snapshot();
        client.fail_next(DiscoveryError::Network("unreachable".to_string()));

        prop_assert!(rt.block_on(engine.refresh_all()).is_err());
        prop_assert_eq!(state.snapshot(), before);
    }
}
