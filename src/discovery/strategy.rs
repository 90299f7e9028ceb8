//! Strategy Selector
//!
//! Chooses the request shape for a refresh.
//!
//! A one-off request consumes a fixed unit of rate-limit quota per call and
//! bypasses the server-side negative cache, so it only pays off for a small
//! targeted set. A full synchronization discloses only the novel set and
//! relies on the continuation token for everything previously confirmed.
//!
//! | Scope                     | Sanitized targets | Strategy              |
//! |---------------------------|-------------------|-----------------------|
//! | whole device              | n/a               | `FullSync`            |
//! | targeted                  | 0                 | `ShortCircuit`        |
//! | targeted                  | 1..=K             | `OneOff`              |
//! | targeted                  | > K               | `DowngradedFullSync`  |

use super::identifier::Identifier;
use super::traits::{ConfirmedSet, DiscoveryRequest, RequestMode, ServiceIdentityMap};
use std::collections::BTreeSet;

/// What the caller asked to refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshScope {
    /// `refresh_all`
    Everything,
    /// `refresh_subset` with this many sanitized identifiers
    Targeted { target_count: usize },
}

/// Selected request strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing to query; return an empty result without touching the network
    ShortCircuit,
    /// Small targeted lookup
    OneOff,
    /// Whole-of-device synchronization
    FullSync,
    /// Targeted set too large for one-off: full sync, then filter to targets
    DowngradedFullSync,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::ShortCircuit => "short_circuit",
            Strategy::OneOff => "one_off",
            Strategy::FullSync => "full_sync",
            Strategy::DowngradedFullSync => "downgraded_full_sync",
        }
    }
}

/// Pick a strategy given the scope and the one-off threshold `K`.
pub fn select_strategy(scope: RefreshScope, one_off_threshold: usize) -> Strategy {
    match scope {
        RefreshScope::Everything => Strategy::FullSync,
        RefreshScope::Targeted { target_count: 0 } => Strategy::ShortCircuit,
        RefreshScope::Targeted { target_count } if target_count > one_off_threshold => {
            Strategy::DowngradedFullSync
        }
        RefreshScope::Targeted { .. } => Strategy::OneOff,
    }
}

/// Shape a full synchronization: previous identifiers ride on the token,
/// only `novel` is disclosed.
pub fn full_sync_request(
    confirmed: &ConfirmedSet,
    novel: BTreeSet<Identifier>,
    identities: ServiceIdentityMap,
) -> DiscoveryRequest {
    DiscoveryRequest {
        mode: RequestMode::FullSync,
        previous: confirmed.identifiers.clone(),
        novel,
        identities,
        token: confirmed.token.clone(),
    }
}

/// Shape a one-off request: no previous set, no token.
pub fn one_off_request(
    targets: BTreeSet<Identifier>,
    identities: ServiceIdentityMap,
) -> DiscoveryRequest {
    DiscoveryRequest {
        mode: RequestMode::OneOff,
        previous: BTreeSet::new(),
        novel: targets,
        identities,
        token: None,
    }
}
