//! # Tor Exit Probe
//!
//! Fetches the same page through several Tor circuits at once, each ending
//! in an exit relay from a different country, and reports which exits were
//! served less content than the others.
//!
//! ## Architecture
//!
//! ```text
//! DiversityProbe
//!   ↓  N concurrent fetch tasks
//! BoundEndpoint ──► CircuitAllocator ──► CircuitLauncher (control client)
//!   ↓                    ▲
//! StreamBinder ◄── ProbeController ◄── circuit / stream events
//!   ↓
//! HTTP fetch ──► IdentifierExtractor ──► ProbeReport
//! ```
//!
//! ## Features
//!
//! - **Exit diversity**: no two pending circuits share an exit country
//! - **Explicit stream attachment**: every connection rides the circuit
//!   allocated for it, matched by local source port
//! - **Executor-agnostic**: built on `futures`, runs in a browser (wasm32)
//!   or natively; native retry delays use tokio's timer inside a tokio
//!   runtime and `futures-timer` under any other executor
//! - **Injectable retry policy**: unbounded in production, bounded in tests

pub mod allocator;
pub mod binder;
pub mod config;
pub mod controller;
pub mod endpoint;
mod error;
pub mod extract;
pub mod http;
pub mod probe;
pub mod protocol;
pub mod report;
pub mod runtime;
pub mod sink;

pub use allocator::{AllocatedCircuit, AllocatorStats, CircuitAllocator, ExitClaim, PendingExitSet};
pub use binder::{BinderStats, BoundStream, PendingBinding, StreamBinder};
pub use config::{ProbeConfig, RetryPolicy, DEFAULT_IDENTIFIER_ATTRIBUTE, DEFAULT_USER_AGENT};
pub use controller::ProbeController;
pub use endpoint::{BoundConnection, BoundEndpoint, Transport};
pub use error::{ErrorCode, FailureClass, ProbeError, Result};
pub use extract::{DataAttributeExtractor, IdentifierExtractor};
pub use http::{HttpResponse, Target};
pub use probe::{DiversityProbe, FetchState};
pub use protocol::{
    AttachDecision, BuildTracker, Circuit, CircuitId, CircuitLauncher, CircuitObserver,
    CircuitStatus, Path, Relay, RelayDirectory, RelayFlags, Stream, StreamAttacher, StreamId,
    StreamObserver,
};
pub use report::{CircuitReport, CircuitResult, ProbeReport};
pub use runtime::{ImmediateSleeper, RuntimeSleeper, SleepFuture, SleepProvider};
pub use sink::{FileSink, MemorySink, ResultSink};

/// Install a logger at `level`
///
/// Logs go to the browser console on wasm32 and to stderr elsewhere. Only
/// the first call installs a logger.
pub fn init_logging(level: log::Level) {
    #[cfg(target_arch = "wasm32")]
    let installed = console_log::init_with_level(level);

    #[cfg(not(target_arch = "wasm32"))]
    let installed = env_logger::Builder::new()
        .filter_level(level.to_level_filter())
        .try_init();

    match installed {
        Ok(()) => log::info!("Tor exit probe logging at {}", level),
        Err(_) => log::debug!("Logger already installed"),
    }
}
