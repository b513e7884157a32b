//! Public key pinning
//!
//! Pins are base64 SHA-256 digests of a certificate's SubjectPublicKeyInfo,
//! the same format HPKP used. A chain passes when any of its certificates
//! carries a pinned key.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::trust::PeerCertificate;

/// Outcome of validating a chain against the pin table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinningResult {
    pub is_valid: bool,
    /// False when no pins are configured for the host
    pub is_pinned: bool,
    pub observed: BTreeSet<String>,
    pub expected: BTreeSet<String>,
}

impl PinningResult {
    fn not_pinned() -> Self {
        Self {
            is_valid: true,
            is_pinned: false,
            observed: BTreeSet::new(),
            expected: BTreeSet::new(),
        }
    }
}

/// SPKI SHA-256 pin of a DER certificate, or `None` when it does not parse
pub fn spki_sha256(der: &[u8]) -> Option<String> {
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => {
            let digest = Sha256::digest(cert.public_key().raw);
            Some(STANDARD.encode(digest))
        }
        Err(e) => {
            debug!("Skipping unparseable certificate in chain: {}", e);
            None
        }
    }
}

fn normalize_pin(pin: &str) -> String {
    let pin = pin.trim();
    pin.strip_prefix("sha256/").unwrap_or(pin).to_string()
}

/// Host to expected-pin table, safe to mutate while validations run
#[derive(Debug, Default)]
pub struct PinningValidator {
    pins: DashMap<String, BTreeSet<String>>,
}

impl PinningValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pin(&self, host: &str, pin: &str) {
        let host = host.trim().to_ascii_lowercase();
        info!("Adding SPKI pin for {}", host);
        self.pins.entry(host).or_default().insert(normalize_pin(pin));
    }

    /// Replace every pin for `host`; an empty set unpins the host
    pub fn set_pins<I, S>(&self, host: &str, pins: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let host = host.trim().to_ascii_lowercase();
        let pins: BTreeSet<String> = pins.into_iter().map(|p| normalize_pin(p.as_ref())).collect();
        if pins.is_empty() {
            self.pins.remove(&host);
        } else {
            info!("Pinning {} key(s) for {}", pins.len(), host);
            self.pins.insert(host, pins);
        }
    }

    pub fn remove_pins(&self, host: &str) -> bool {
        self.pins.remove(&host.trim().to_ascii_lowercase()).is_some()
    }

    pub fn pins_for(&self, host: &str) -> BTreeSet<String> {
        self.pins
            .get(&host.trim().to_ascii_lowercase())
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn pinned_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.pins.iter().map(|e| e.key().clone()).collect();
        hosts.sort();
        hosts
    }

    pub fn clear(&self) {
        self.pins.clear();
    }

    pub fn validate(&self, chain: &[PeerCertificate], host: &str) -> PinningResult {
        // Clone out of the map so no shard lock is held while hashing
        let expected = self.pins_for(host);
        if expected.is_empty() {
            return PinningResult::not_pinned();
        }

        let observed: BTreeSet<String> = chain
            .iter()
            .filter_map(|cert| spki_sha256(&cert.der))
            .collect();
        let is_valid = observed.iter().any(|pin| expected.contains(pin));

        if !is_valid {
            warn!(
                host = %host,
                observed = ?observed,
                expected = ?expected,
                "Certificate pinning failed"
            );
        }

        PinningResult {
            is_valid,
            is_pinned: true,
            observed,
            expected,
        }
    }
}
