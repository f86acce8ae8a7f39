//! Relay types and path selection
//!
//! Defines relay metadata as reported by the control-protocol client and the
//! random selection of guard, middle and exit hops used by the allocator.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

/// Country code used when the client could not geolocate a relay
pub const UNKNOWN_COUNTRY: &str = "??";

/// A relay from the directory snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    #[serde(default)]
    pub nickname: String,

    /// Fingerprint (hex-encoded identity key hash)
    pub fingerprint: String,

    /// Two-letter country code, lowercase
    #[serde(default = "unknown_country")]
    pub country_code: String,

    /// Relay flags
    #[serde(default)]
    pub flags: RelayFlags,
}

fn unknown_country() -> String {
    UNKNOWN_COUNTRY.to_string()
}

impl Relay {
    /// Create a relay, normalizing fingerprint and country code
    pub fn new(
        nickname: impl Into<String>,
        fingerprint: impl Into<String>,
        country_code: impl Into<String>,
        flags: RelayFlags,
    ) -> Self {
        let country_code = country_code.into().trim().to_lowercase();
        Self {
            nickname: nickname.into(),
            fingerprint: fingerprint.into().trim_start_matches('$').to_uppercase(),
            country_code: if country_code.is_empty() {
                unknown_country()
            } else {
                country_code
            },
            flags,
        }
    }

    /// Check if this relay can be used as an entry guard
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.running
    }

    /// Check if this relay can be used as an exit
    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit && self.flags.running
    }

    /// Check if this relay is usable as a middle hop
    pub fn is_middle(&self) -> bool {
        self.flags.running
    }

    /// Fingerprint is 20 bytes of hex
    pub fn has_valid_fingerprint(&self) -> bool {
        self.fingerprint.len() == 40
            && hex::decode(&self.fingerprint)
                .map(|bytes| bytes.len() == 20)
                .unwrap_or(false)
    }

    /// Short form for logs: the first 8 characters of the fingerprint
    ///
    /// Fingerprints from a directory are not validated, so this counts
    /// characters rather than bytes.
    pub fn short_id(&self) -> &str {
        match self.fingerprint.char_indices().nth(8) {
            Some((end, _)) => &self.fingerprint[..end],
            None => &self.fingerprint,
        }
    }
}

/// Relay flags from the directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayFlags {
    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Exit - allows exit traffic
    pub exit: bool,

    /// Fast - fast relay
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// Running - currently running
    pub running: bool,

    /// Stable - stable relay
    pub stable: bool,

    /// Valid - valid relay descriptor
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a space-separated flag list ("Exit Fast Guard Running")
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        relay_flags
    }
}

#[derive(Deserialize)]
struct DirectoryDocument {
    relays: Vec<Relay>,
    #[serde(default)]
    entry_guards: Vec<String>,
}

/// Read-only snapshot of known relays and entry guards
#[derive(Debug, Clone, Default)]
pub struct RelayDirectory {
    /// All relays in the snapshot
    relays: Vec<Relay>,

    /// Fingerprints the client designated as entry guards
    entry_guards: Vec<String>,
}

impl RelayDirectory {
    /// Create a directory; guards are the relays flagged `Guard`
    pub fn new(relays: Vec<Relay>) -> Self {
        Self {
            relays,
            entry_guards: Vec::new(),
        }
    }

    /// Use an explicit entry-guard list instead of the `Guard` flag
    pub fn with_entry_guards(mut self, guards: Vec<String>) -> Self {
        self.entry_guards = guards
            .into_iter()
            .map(|fp| fp.trim_start_matches('$').to_uppercase())
            .collect();
        self
    }

    /// Load a snapshot from JSON (`{"relays": [...], "entry_guards": [...]}`)
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: DirectoryDocument = serde_json::from_str(json)?;

        let relays: Vec<Relay> = doc
            .relays
            .into_iter()
            .map(|r| Relay::new(r.nickname, r.fingerprint, r.country_code, r.flags))
            .collect();

        if let Some(bad) = relays.iter().find(|r| !r.has_valid_fingerprint()) {
            return Err(ProbeError::InvalidRelay(format!(
                "bad fingerprint {:?} for {}",
                bad.fingerprint, bad.nickname
            )));
        }

        let directory = Self::new(relays).with_entry_guards(doc.entry_guards);
        log::info!(
            "📊 Directory loaded: {} relays, {} exits, {} guards",
            directory.count(),
            directory.exits().len(),
            directory.guards().len()
        );
        Ok(directory)
    }

    /// Look up a relay by fingerprint
    pub fn get(&self, fingerprint: &str) -> Option<&Relay> {
        self.relays
            .iter()
            .find(|r| r.fingerprint.eq_ignore_ascii_case(fingerprint))
    }

    /// All entry guards
    pub fn guards(&self) -> Vec<&Relay> {
        if self.entry_guards.is_empty() {
            self.relays.iter().filter(|r| r.is_guard()).collect()
        } else {
            self.entry_guards
                .iter()
                .filter_map(|fp| self.get(fp))
                .collect()
        }
    }

    /// All exit-capable relays
    pub fn exits(&self) -> Vec<&Relay> {
        self.relays.iter().filter(|r| r.is_exit()).collect()
    }

    /// Exit-capable relays outside the excluded countries
    pub fn exit_candidates(&self, excluded_countries: &HashSet<String>) -> Vec<&Relay> {
        self.relays
            .iter()
            .filter(|r| r.is_exit() && !excluded_countries.contains(&r.country_code))
            .collect()
    }

    /// Uniformly random exit outside the excluded countries
    pub fn select_exit<R: Rng + ?Sized>(
        &self,
        excluded_countries: &HashSet<String>,
        rng: &mut R,
    ) -> Option<&Relay> {
        self.exit_candidates(excluded_countries)
            .choose(rng)
            .copied()
    }

    /// Uniformly random entry guard, avoiding `exclude` when possible
    pub fn select_guard<R: Rng + ?Sized>(&self, exclude: &[&str], rng: &mut R) -> Option<&Relay> {
        Self::choose_avoiding(self.guards(), exclude, rng)
    }

    /// Uniformly random middle relay, avoiding `exclude` when possible
    pub fn select_middle<R: Rng + ?Sized>(
        &self,
        exclude: &[&str],
        rng: &mut R,
    ) -> Option<&Relay> {
        let middles = self.relays.iter().filter(|r| r.is_middle()).collect();
        Self::choose_avoiding(middles, exclude, rng)
    }

    // A relay cannot appear twice on one path; fall back to the full set only
    // when the directory is too small to avoid it.
    fn choose_avoiding<'a, R: Rng + ?Sized>(
        candidates: Vec<&'a Relay>,
        exclude: &[&str],
        rng: &mut R,
    ) -> Option<&'a Relay> {
        let preferred: Vec<&Relay> = candidates
            .iter()
            .copied()
            .filter(|r| !exclude.contains(&r.fingerprint.as_str()))
            .collect();
        if preferred.is_empty() {
            candidates.choose(rng).copied()
        } else {
            preferred.choose(rng).copied()
        }
    }

    /// Get total number of relays
    pub fn count(&self) -> usize {
        self.relays.len()
    }

    /// Distinct exit countries in the snapshot
    pub fn exit_countries(&self) -> HashSet<&str> {
        self.exits()
            .into_iter()
            .map(|r| r.country_code.as_str())
            .collect()
    }
}
