//! Circuit and stream metadata as seen from the control port

use std::fmt;

use serde::{Deserialize, Serialize};

use super::relay::Relay;
use crate::error::{ProbeError, Result};

/// Number of hops on every probe circuit
pub const PATH_LEN: usize = 3;

/// Network-assigned circuit identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-assigned stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Guard, middle and exit, in that order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    hops: [Relay; PATH_LEN],
}

impl Path {
    /// Build a path from its three hops
    pub fn new(guard: Relay, middle: Relay, exit: Relay) -> Self {
        Self {
            hops: [guard, middle, exit],
        }
    }

    /// Build a path from a hop list, which must have exactly three entries
    pub fn from_hops(hops: Vec<Relay>) -> Result<Self> {
        let hops: [Relay; PATH_LEN] = hops.try_into().map_err(|v: Vec<Relay>| {
            ProbeError::InvalidRelay(format!("path needs {} hops, got {}", PATH_LEN, v.len()))
        })?;
        Ok(Self { hops })
    }

    pub fn guard(&self) -> &Relay {
        &self.hops[0]
    }

    pub fn middle(&self) -> &Relay {
        &self.hops[1]
    }

    pub fn exit(&self) -> &Relay {
        &self.hops[2]
    }

    pub fn hops(&self) -> &[Relay] {
        &self.hops
    }

    /// Fingerprints in `$FP,$FP,$FP` form, as the control port expects them
    pub fn to_control_string(&self) -> String {
        self.hops
            .iter()
            .map(|r| format!("${}", r.fingerprint))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .hops
            .iter()
            .map(|r| format!("{}({})", r.short_id(), r.country_code))
            .collect();
        write!(f, "{}", names.join(" -> "))
    }
}

/// Lifecycle of a circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Submitted, extension in progress
    Launched,
    /// All hops extended
    Built,
    /// Construction failed or circuit was torn down
    Failed(String),
}

/// A circuit through the overlay network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: CircuitId,
    pub path: Path,
    pub status: CircuitStatus,
}

impl Circuit {
    /// A freshly launched circuit
    pub fn launched(id: CircuitId, path: Path) -> Self {
        Self {
            id,
            path,
            status: CircuitStatus::Launched,
        }
    }

    pub fn exit(&self) -> &Relay {
        self.path.exit()
    }

    pub fn is_built(&self) -> bool {
        self.status == CircuitStatus::Built
    }
}

/// A new outbound stream announced by the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub id: StreamId,
    /// Local source port of the application connection that opened it
    pub source_port: u16,
    /// Destination as requested through the proxy (`host:port`)
    pub target: String,
    /// Circuit the network reports the stream on, when it names one
    pub circuit: Option<CircuitId>,
}

impl Stream {
    /// Whether the network placed this stream somewhere other than `expected`
    pub fn left_circuit(&self, expected: CircuitId) -> bool {
        self.circuit.map_or(false, |id| id != expected)
    }
}
