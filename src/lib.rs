//! cds-sync - Contact Discovery Synchronization
//!
//! Decides which of a device's phone-number identifiers belong to registered
//! users of the network service, without re-disclosing the full contact list
//! on every query.
//!
//! Key principles:
//! - Sanitize before anything leaves the device
//! - Disclose only the novel set on full syncs
//! - One refresh at a time (single-flight)
//! - No partial commits: a failed round trip leaves state untouched
//! - Identifiers and tokens are never logged in clear

pub mod discovery;
