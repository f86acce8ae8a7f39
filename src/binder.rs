//! Stream-to-Circuit Binding
//!
//! Tor gives no way to pick a circuit when opening a SOCKS connection. The
//! binder closes that gap: once a connection's local source port is known,
//! it is registered here together with the circuit it should use. When the
//! network announces a new stream from that port, the binder answers with
//! that circuit and resolves the waiting future.
//!
//! Streams from ports nobody registered fall through to Tor's default
//! attachment. Events that arrive before their registration are not
//! buffered; they take the default path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{ProbeError, Result};
use crate::protocol::{AttachDecision, Circuit, Stream, StreamAttacher};

/// A stream matched to the circuit registered for its port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundStream {
    pub stream: Stream,
    pub circuit: Circuit,
}

struct PortBinding {
    generation: u64,
    circuit: Circuit,
    sender: oneshot::Sender<BoundStream>,
}

/// Statistics about binding
#[derive(Debug, Clone, Default)]
pub struct BinderStats {
    /// Ports registered
    pub registered: u64,
    /// Registrations resolved by a stream event
    pub matched: u64,
    /// Registrations dropped before a stream arrived
    pub abandoned: u64,
}

#[derive(Default)]
struct BinderState {
    ports: HashMap<u16, PortBinding>,
    next_generation: u64,
    stats: BinderStats,
}

/// Correlation table from local source port to pending circuit
#[derive(Clone, Default)]
pub struct StreamBinder {
    state: Arc<Mutex<BinderState>>,
}

impl StreamBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `port` as belonging to `circuit`
    ///
    /// The returned future resolves once the network reports a stream from
    /// `port`. A port can only be registered again after its previous
    /// registration resolved or was dropped.
    pub fn register_pending_port(&self, port: u16, circuit: Circuit) -> Result<PendingBinding> {
        let mut state = self.lock();
        if state.ports.contains_key(&port) {
            return Err(ProbeError::PortAlreadyBound(port));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let (sender, receiver) = oneshot::channel();

        log::debug!("🔗 Port {} waiting for circuit {}", port, circuit.id);
        state.ports.insert(
            port,
            PortBinding {
                generation,
                circuit,
                sender,
            },
        );
        state.stats.registered += 1;

        Ok(PendingBinding {
            port,
            generation,
            receiver,
            binder: self.clone(),
            finished: false,
        })
    }

    /// Decide attachment for a newly observed stream
    pub fn on_new_stream_observed(&self, stream: &Stream) -> AttachDecision {
        let mut state = self.lock();

        let Some(binding) = state.ports.remove(&stream.source_port) else {
            log::debug!(
                "Stream {} from unregistered port {}, default attachment",
                stream.id,
                stream.source_port
            );
            return AttachDecision::UseDefault;
        };
        state.stats.matched += 1;

        let circuit_id = binding.circuit.id;
        log::info!(
            "📎 Stream {} (port {}) -> circuit {}",
            stream.id,
            stream.source_port,
            circuit_id
        );
        if stream.left_circuit(circuit_id) {
            log::warn!(
                "  ⚠️ Stream {} is reported on another circuit than {}",
                stream.id,
                circuit_id
            );
        }

        let bound = BoundStream {
            stream: stream.clone(),
            circuit: binding.circuit,
        };
        if binding.sender.send(bound).is_err() {
            log::debug!("Nobody waits on port {} any more", stream.source_port);
        }

        AttachDecision::Attach(circuit_id)
    }

    /// Ports currently waiting for a stream
    pub fn pending_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().ports.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_pending(&self, port: u16) -> bool {
        self.lock().ports.contains_key(&port)
    }

    /// Get statistics
    pub fn stats(&self) -> BinderStats {
        self.lock().stats.clone()
    }

    fn abandon(&self, port: u16, generation: u64) {
        let mut state = self.lock();
        let ours = state
            .ports
            .get(&port)
            .map(|b| b.generation == generation)
            .unwrap_or(false);
        if ours {
            state.ports.remove(&port);
            state.stats.abandoned += 1;
            log::debug!("Dropped pending binding for port {}", port);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StreamAttacher for StreamBinder {
    fn attach_stream(&self, stream: &Stream) -> AttachDecision {
        self.on_new_stream_observed(stream)
    }
}

/// Resolves to the stream that used the registered port
///
/// Dropping it before resolution removes the registration.
pub struct PendingBinding {
    port: u16,
    generation: u64,
    receiver: oneshot::Receiver<BoundStream>,
    binder: StreamBinder,
    finished: bool,
}

impl PendingBinding {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Future for PendingBinding {
    type Output = Result<BoundStream>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.receiver).poll(cx);
        match polled {
            Poll::Ready(Ok(bound)) => {
                self.finished = true;
                Poll::Ready(Ok(bound))
            }
            Poll::Ready(Err(_)) => {
                self.finished = true;
                Poll::Ready(Err(ProbeError::BindingLost(self.port)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingBinding {
    fn drop(&mut self) {
        if !self.finished {
            self.binder.abandon(self.port, self.generation);
        }
    }
}
