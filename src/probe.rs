//! Diversity probe
//!
//! Fetches the same page over several circuits at once, each with an exit in
//! a different country, and compares what every exit was served.
//!
//! Each fetch task walks through
//!
//! ```text
//! Allocating ─► Connecting ─► Binding ─► Fetching ─► Done
//!      ▲                                    │
//!      └──────────── transient error ───────┘
//! ```
//!
//! A failed attempt is abandoned as a whole: its circuit claim and port
//! binding are released and the next attempt starts from a fresh circuit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use web_time::Instant;

use crate::allocator::CircuitAllocator;
use crate::binder::StreamBinder;
use crate::config::ProbeConfig;
use crate::controller::ProbeController;
use crate::endpoint::{BoundEndpoint, Transport};
use crate::error::{ProbeError, Result};
use crate::extract::{DataAttributeExtractor, IdentifierExtractor};
use crate::http::{self, Target};
use crate::protocol::{CircuitId, CircuitLauncher, RelayDirectory};
use crate::report::{CircuitResult, ProbeReport};
use crate::runtime::{RuntimeSleeper, SleepProvider};
use crate::sink::{FileSink, ResultSink};

/// Phase of a fetch task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// Waiting for a built circuit
    Allocating,
    /// Opening the proxy connection
    Connecting,
    /// Waiting for the stream to be attached
    Binding,
    /// Request sent, reading the response
    Fetching,
    Done,
}

type ResultMap = Mutex<HashMap<CircuitId, CircuitResult>>;

/// Runs concurrent fetches over distinct exits and compares the results
pub struct DiversityProbe<L, S, T> {
    allocator: Arc<CircuitAllocator<L, S>>,
    binder: StreamBinder,
    transport: Arc<T>,
    extractor: Box<dyn IdentifierExtractor>,
    sink: Option<Arc<dyn ResultSink>>,
    config: ProbeConfig,
}

impl<L: CircuitLauncher, T: Transport> DiversityProbe<L, RuntimeSleeper, T> {
    /// Wire a probe to `controller`
    ///
    /// The allocator waits on the controller's build tracker and the
    /// controller's binder answers attachment requests, so the control
    /// client only needs to feed events into `controller`.
    pub fn build(
        directory: Arc<RelayDirectory>,
        launcher: Arc<L>,
        transport: Arc<T>,
        controller: &ProbeController,
        config: ProbeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let allocator = CircuitAllocator::new(directory, launcher, Arc::clone(controller.tracker()))
            .with_policy(config.circuit_retry_policy());
        Ok(Self::new(
            Arc::new(allocator),
            controller.binder().clone(),
            transport,
            config,
        ))
    }
}

impl<L, S, T> DiversityProbe<L, S, T>
where
    L: CircuitLauncher,
    S: SleepProvider,
    T: Transport,
{
    /// Create a probe from its parts
    ///
    /// Identifiers are read from `config.identifier_attribute`, limited to
    /// elements of `config.identifier_class` when one is set. When
    /// `config.output_path` is set every completed fetch is appended there.
    pub fn new(
        allocator: Arc<CircuitAllocator<L, S>>,
        binder: StreamBinder,
        transport: Arc<T>,
        config: ProbeConfig,
    ) -> Self {
        let mut extractor = DataAttributeExtractor::new(config.identifier_attribute.clone());
        if let Some(class) = &config.identifier_class {
            extractor = extractor.with_element_class(class.clone());
        }
        let extractor = Box::new(extractor);
        let sink = config
            .output_path
            .as_ref()
            .map(|path| Arc::new(FileSink::new(path.clone())) as Arc<dyn ResultSink>);

        Self {
            allocator,
            binder,
            transport,
            extractor,
            sink,
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: impl IdentifierExtractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    /// Replace the result sink
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn allocator(&self) -> &CircuitAllocator<L, S> {
        &self.allocator
    }

    /// Probe the configured target with the configured concurrency
    pub async fn run_configured(&self) -> Result<ProbeReport> {
        self.run(&self.config.target, self.config.concurrency).await
    }

    /// Fetch `target` over `concurrency` circuits and compare the results
    ///
    /// Returns once every task has finished. Tasks only give up when the
    /// fetch retry policy is bounded, or on an error no retry can fix; such
    /// tasks are counted in [`ProbeReport::failed_tasks`].
    pub async fn run(&self, target: &str, concurrency: usize) -> Result<ProbeReport> {
        let parsed = Target::parse(target)?;
        if concurrency == 0 {
            return Err(ProbeError::Config("concurrency must be at least 1".into()));
        }

        log::info!("🚀 Probing {} over {} circuits", parsed, concurrency);
        let started = Instant::now();

        let results: ResultMap = Mutex::new(HashMap::new());
        let finished = join_all(
            (0..concurrency).map(|task| self.fetch_task(task, &parsed, &results)),
        )
        .await;
        let failed_tasks = finished.iter().filter(|ok| !**ok).count();

        let results = results
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let report = ProbeReport::from_results(target.trim(), &results, failed_tasks);

        log::info!(
            "🏁 Probe finished in {}ms: {} circuits, {} common identifiers, {} flagged",
            started.elapsed().as_millis(),
            report.circuits.len(),
            report.common.len(),
            report.discrepancies().count()
        );
        log::debug!("Pending exits after run: {}", self.allocator.pending_count());

        Ok(report)
    }

    /// Drive one task to completion; `false` if it gave up
    async fn fetch_task(&self, task: usize, target: &Target, results: &ResultMap) -> bool {
        let policy = self.config.fetch_retry_policy();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if !policy.allows(attempt) {
                log::warn!(
                    "  ⚠️ Fetch {} gave up after {} attempts",
                    task,
                    attempt - 1
                );
                return false;
            }

            match self.fetch_once(task, target).await {
                Ok(result) => {
                    self.record(result, results);
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    log::warn!(
                        "  ⚠️ Fetch {} attempt {} failed: {}, restarting",
                        task,
                        attempt,
                        e
                    );
                }
                Err(e) => {
                    log::error!("❌ Fetch {} abandoned: {}", task, e);
                    return false;
                }
            }
        }
    }

    /// One pass from allocation to parsed response
    async fn fetch_once(&self, task: usize, target: &Target) -> Result<CircuitResult> {
        let endpoint = BoundEndpoint::new(
            self.allocator.as_ref(),
            &self.binder,
            self.transport.as_ref(),
            target.clone(),
        );

        let mut bound = endpoint
            .connect_tracked(|state| log::debug!("Fetch {} → {:?}", task, state))
            .await?;

        log::debug!("Fetch {} → {:?}", task, FetchState::Fetching);
        let started = Instant::now();
        let response = http::fetch(&mut bound.connection, target, &self.config.user_agent).await?;
        let elapsed = started.elapsed().as_millis();

        let exit = bound.circuit.exit();
        if !response.is_success() {
            log::warn!(
                "  ⚠️ Exit {} ({}) got HTTP {}",
                exit.short_id(),
                exit.country_code,
                response.status
            );
        }

        let identifiers = self.extractor.extract(&response.body);
        log::info!(
            "  📄 Exit {} ({}): {} identifiers, {} bytes in {}ms",
            exit.short_id(),
            exit.country_code,
            identifiers.len(),
            response.body.len(),
            elapsed
        );

        let result = CircuitResult {
            circuit_id: bound.circuit.id,
            exit_fingerprint: exit.fingerprint.clone(),
            exit_nickname: exit.nickname.clone(),
            exit_country: exit.country_code.clone(),
            status: response.status,
            identifiers,
            byte_length: response.body.len(),
            consistent_binding: bound.is_consistent(),
        };

        log::debug!("Fetch {} → {:?}", task, FetchState::Done);
        // Dropping `bound` here releases the exit claim
        Ok(result)
    }

    fn record(&self, result: CircuitResult, results: &ResultMap) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record(&result) {
                log::warn!("  ⚠️ Could not record result: {}", e);
            }
        }

        let mut results = results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = results.insert(result.circuit_id, result) {
            log::warn!(
                "  ⚠️ Circuit {} reported twice, keeping the later result",
                previous.circuit_id
            );
        }
    }
}
