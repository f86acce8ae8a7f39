//! Control-port capabilities the probe consumes
//!
//! The control-protocol client is external. It is seen through four narrow
//! roles:
//!
//! - [`CircuitLauncher`]: submit a path for construction
//! - [`CircuitObserver`]: told when a launched circuit is built or fails
//! - [`StreamObserver`]: told when a new outbound stream appears
//! - [`StreamAttacher`]: asked which circuit should carry a new stream
//!
//! [`BuildTracker`] turns the push-style circuit events back into a future
//! the allocator can await.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::oneshot;

use super::circuit::{Circuit, CircuitId, Path, Stream};
use crate::error::Result;

/// How many build outcomes to remember for circuits nobody waits on yet
pub const EARLY_OUTCOME_LIMIT: usize = 256;

/// Submits circuits to the network
#[async_trait]
pub trait CircuitLauncher: Send + Sync {
    /// Ask the network to build `path`
    ///
    /// An `Err` means the request was rejected outright. Success means the
    /// circuit was accepted and extension is in progress; completion arrives
    /// later through [`CircuitObserver`].
    async fn launch(&self, path: &Path) -> Result<Circuit>;
}

/// Circuit lifecycle notifications
pub trait CircuitObserver {
    fn on_circuit_built(&self, circuit: &Circuit);
    fn on_circuit_failed(&self, circuit: &Circuit, reason: &str);
}

/// New-stream notifications
pub trait StreamObserver {
    fn on_new_stream(&self, stream: &Stream);
}

/// Attachment authority for new streams
pub trait StreamAttacher {
    fn attach_stream(&self, stream: &Stream) -> AttachDecision;
}

/// Answer to "which circuit should carry this stream?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachDecision {
    /// Attach to this circuit
    Attach(CircuitId),
    /// Let the network apply its own policy
    UseDefault,
}

/// Result of a circuit build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,
    Failed(String),
}

#[derive(Default)]
struct TrackerState {
    waiting: HashMap<CircuitId, oneshot::Sender<BuildOutcome>>,
    early: VecDeque<(CircuitId, BuildOutcome)>,
}

/// Routes circuit build events to whoever is waiting on that circuit
///
/// Events may arrive before the waiter registers (the control client can
/// report BUILT before `launch` returns); those are kept in a bounded buffer.
#[derive(Default)]
pub struct BuildTracker {
    state: Mutex<TrackerState>,
}

impl BuildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the outcome of circuit `id`
    pub fn wait_for(&self, id: CircuitId) -> BuildWait {
        let mut state = self.lock();

        if let Some(pos) = state.early.iter().position(|(early_id, _)| *early_id == id) {
            if let Some((_, outcome)) = state.early.remove(pos) {
                return BuildWait::ready(outcome);
            }
        }

        let (tx, rx) = oneshot::channel();
        state.waiting.insert(id, tx);
        BuildWait {
            inner: WaitInner::Pending(rx),
        }
    }

    /// Deliver an outcome for circuit `id`
    pub fn resolve(&self, id: CircuitId, outcome: BuildOutcome) {
        let mut state = self.lock();

        match state.waiting.remove(&id) {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    log::debug!("Build waiter for circuit {} went away", id);
                }
            }
            None => {
                if state.early.len() >= EARLY_OUTCOME_LIMIT {
                    state.early.pop_front();
                }
                state.early.push_back((id, outcome));
            }
        }
    }

    /// Stop waiting on `id` (the attempt was abandoned)
    pub fn forget(&self, id: CircuitId) {
        let mut state = self.lock();
        state.waiting.remove(&id);
        state.early.retain(|(early_id, _)| *early_id != id);
    }

    /// Circuits someone is currently waiting on
    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CircuitObserver for BuildTracker {
    fn on_circuit_built(&self, circuit: &Circuit) {
        self.resolve(circuit.id, BuildOutcome::Built);
    }

    fn on_circuit_failed(&self, circuit: &Circuit, reason: &str) {
        self.resolve(circuit.id, BuildOutcome::Failed(reason.to_string()));
    }
}

enum WaitInner {
    Ready(Option<BuildOutcome>),
    Pending(oneshot::Receiver<BuildOutcome>),
}

/// Future for a circuit's build outcome
///
/// If the tracker drops the waiter without an outcome, the build counts as
/// failed.
pub struct BuildWait {
    inner: WaitInner,
}

impl BuildWait {
    fn ready(outcome: BuildOutcome) -> Self {
        Self {
            inner: WaitInner::Ready(Some(outcome)),
        }
    }
}

impl Future for BuildWait {
    type Output = BuildOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            WaitInner::Ready(outcome) => Poll::Ready(
                outcome
                    .take()
                    .unwrap_or_else(|| BuildOutcome::Failed("outcome already taken".into())),
            ),
            WaitInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => {
                    Poll::Ready(BuildOutcome::Failed("build tracker dropped waiter".into()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
