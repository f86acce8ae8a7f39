//! Overlay-network model
//!
//! This module models what the probe sees of the Tor network through its
//! control-protocol client:
//! - The relay directory snapshot and random hop selection
//! - Circuits, their paths and build status
//! - Streams announced by the network
//! - The launcher/observer/attacher roles the client plays

mod circuit;
mod events;
mod relay;

pub use circuit::{Circuit, CircuitId, CircuitStatus, Path, Stream, StreamId, PATH_LEN};
pub use events::{
    AttachDecision, BuildOutcome, BuildTracker, BuildWait, CircuitLauncher, CircuitObserver,
    StreamAttacher, StreamObserver, EARLY_OUTCOME_LIMIT,
};
pub use relay::{Relay, RelayDirectory, RelayFlags, UNKNOWN_COUNTRY};
