//! Event entry point for the control-protocol client
//!
//! The control client pushes circuit and stream events into a single
//! [`ProbeController`], which hands them to the part of the probe that owns
//! each concern: build outcomes go to the [`BuildTracker`], attachment
//! questions go to the [`StreamBinder`].

use std::sync::Arc;

use crate::binder::StreamBinder;
use crate::protocol::{
    AttachDecision, BuildTracker, Circuit, CircuitObserver, Stream, StreamAttacher,
    StreamObserver,
};

/// Routes network events into the probe
#[derive(Clone)]
pub struct ProbeController {
    tracker: Arc<BuildTracker>,
    binder: StreamBinder,
}

impl ProbeController {
    pub fn new(tracker: Arc<BuildTracker>, binder: StreamBinder) -> Self {
        Self { tracker, binder }
    }

    /// A fresh tracker and binder, wired together
    pub fn standalone() -> Self {
        Self::new(Arc::new(BuildTracker::new()), StreamBinder::new())
    }

    pub fn tracker(&self) -> &Arc<BuildTracker> {
        &self.tracker
    }

    pub fn binder(&self) -> &StreamBinder {
        &self.binder
    }

    /// Observe a new stream and decide where it goes
    pub fn handle_new_stream(&self, stream: &Stream) -> AttachDecision {
        self.on_new_stream(stream);
        self.attach_stream(stream)
    }
}

impl CircuitObserver for ProbeController {
    fn on_circuit_built(&self, circuit: &Circuit) {
        log::debug!("Circuit {} BUILT ({})", circuit.id, circuit.path);
        self.tracker.on_circuit_built(circuit);
    }

    fn on_circuit_failed(&self, circuit: &Circuit, reason: &str) {
        log::debug!("Circuit {} FAILED: {}", circuit.id, reason);
        self.tracker.on_circuit_failed(circuit, reason);
    }
}

impl StreamObserver for ProbeController {
    fn on_new_stream(&self, stream: &Stream) {
        log::debug!(
            "Stream {} NEW from port {} to {}",
            stream.id,
            stream.source_port,
            stream.target
        );
    }
}

impl StreamAttacher for ProbeController {
    fn attach_stream(&self, stream: &Stream) -> AttachDecision {
        self.binder.on_new_stream_observed(stream)
    }
}
