//! Cross-circuit comparison
//!
//! Every circuit's identifier set is compared against the intersection of
//! all sets. A circuit is flagged when the intersection holds identifiers
//! its own set lacks. Identifiers a circuit saw beyond the intersection are
//! reported as well, without a flag.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::protocol::CircuitId;

/// What one fetch over one circuit produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitResult {
    pub circuit_id: CircuitId,
    pub exit_fingerprint: String,
    pub exit_nickname: String,
    pub exit_country: String,
    /// HTTP status of the response
    pub status: u16,
    /// Identifiers in document order
    pub identifiers: Vec<String>,
    /// Response body length in bytes
    pub byte_length: usize,
    /// Stream rode the circuit allocated for it
    pub consistent_binding: bool,
}

impl CircuitResult {
    pub fn identifier_set(&self) -> BTreeSet<String> {
        self.identifiers.iter().cloned().collect()
    }

    /// `<exit fingerprint> <country> <id> <id> ...`
    pub fn to_record_line(&self) -> String {
        let mut line = format!("{} {}", self.exit_fingerprint, self.exit_country);
        for id in &self.identifiers {
            line.push(' ');
            line.push_str(id);
        }
        line
    }
}

/// Identifiers present in every result; empty when there are no results
pub fn common_identifiers<'a, I>(results: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a CircuitResult>,
{
    let mut iter = results.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };

    iter.fold(first.identifier_set(), |common, result| {
        let own = result.identifier_set();
        common.intersection(&own).cloned().collect()
    })
}

/// Report line for one circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitReport {
    pub circuit_id: CircuitId,
    pub exit_fingerprint: String,
    pub exit_country: String,
    pub status: u16,
    pub identifier_count: usize,
    pub byte_length: usize,
    /// In the intersection but not in this circuit's set
    pub missing: BTreeSet<String>,
    /// In this circuit's set but not in the intersection
    pub beyond_common: BTreeSet<String>,
    pub consistent_binding: bool,
}

impl CircuitReport {
    pub fn is_discrepancy(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Comparative report over all circuits of a probe run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub target: String,
    pub common: BTreeSet<String>,
    /// Ordered by circuit id
    pub circuits: Vec<CircuitReport>,
    /// Tasks that gave up without a result
    pub failed_tasks: usize,
}

impl ProbeReport {
    /// Compare the collected results
    pub fn from_results(
        target: impl Into<String>,
        results: &HashMap<CircuitId, CircuitResult>,
        failed_tasks: usize,
    ) -> Self {
        let common = common_identifiers(results.values());

        let mut circuits: Vec<CircuitReport> = results
            .values()
            .map(|result| {
                let own = result.identifier_set();
                CircuitReport {
                    circuit_id: result.circuit_id,
                    exit_fingerprint: result.exit_fingerprint.clone(),
                    exit_country: result.exit_country.clone(),
                    status: result.status,
                    identifier_count: result.identifiers.len(),
                    byte_length: result.byte_length,
                    missing: common.difference(&own).cloned().collect(),
                    beyond_common: own.difference(&common).cloned().collect(),
                    consistent_binding: result.consistent_binding,
                }
            })
            .collect();
        circuits.sort_by_key(|c| c.circuit_id);

        Self {
            target: target.into(),
            common,
            circuits,
            failed_tasks,
        }
    }

    /// Circuits flagged as missing common identifiers
    pub fn discrepancies(&self) -> impl Iterator<Item = &CircuitReport> {
        self.circuits.iter().filter(|c| c.is_discrepancy())
    }

    pub fn has_discrepancies(&self) -> bool {
        self.discrepancies().next().is_some()
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} circuits, {} identifiers common to all",
            self.target,
            self.circuits.len(),
            self.common.len()
        )?;

        for c in &self.circuits {
            write!(
                f,
                "  exit {} ({}): {} identifiers, {} bytes, HTTP {}",
                c.exit_fingerprint, c.exit_country, c.identifier_count, c.byte_length, c.status
            )?;
            if !c.beyond_common.is_empty() {
                write!(f, ", {} beyond common", c.beyond_common.len())?;
            }
            if !c.consistent_binding {
                write!(f, " [stream left its allocated circuit]")?;
            }
            writeln!(f)?;

            if c.is_discrepancy() {
                let missing: Vec<&str> = c.missing.iter().map(String::as_str).collect();
                writeln!(
                    f,
                    "  !!! exit {} ({}) is missing: {}",
                    c.exit_fingerprint,
                    c.exit_country,
                    missing.join(" ")
                )?;
            }
        }

        if self.failed_tasks > 0 {
            writeln!(f, "  {} fetches gave up without a result", self.failed_tasks)?;
        }
        Ok(())
    }
}
