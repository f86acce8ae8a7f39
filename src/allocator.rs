//! Exit-Diverse Circuit Allocation
//!
//! Builds 3-hop circuits whose exits are spread across countries.
//!
//! Each allocation claims its exit relay in a shared pending set before the
//! circuit is launched. While a claim is held, no other allocation may pick
//! an exit in the same country. The claim moves to the caller on success
//! and is released when the caller drops it; failed attempts release it
//! before retrying.
//!
//! Retry behaviour:
//! - Launch rejected outright: release the exit, retry at once
//! - Build failed later: release the exit, wait the policy delay, retry
//! - No exit outside the pending countries: wait the policy delay, retry

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use web_time::Instant;

use crate::config::RetryPolicy;
use crate::error::{ProbeError, Result};
use crate::protocol::{
    BuildOutcome, BuildTracker, Circuit, CircuitId, CircuitLauncher, CircuitStatus, Path, Relay,
    RelayDirectory,
};
use crate::runtime::{RuntimeSleeper, SleepProvider};

/// Exit relays claimed by in-flight allocations, keyed by fingerprint
#[derive(Debug, Default)]
pub struct PendingExitSet {
    exits: HashMap<String, String>,
}

impl PendingExitSet {
    /// Countries of every pending exit
    pub fn countries(&self) -> HashSet<String> {
        self.exits.values().cloned().collect()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.exits.contains_key(fingerprint)
    }

    fn insert(&mut self, exit: &Relay) -> bool {
        self.exits
            .insert(exit.fingerprint.clone(), exit.country_code.clone())
            .is_none()
    }

    fn remove(&mut self, fingerprint: &str) -> bool {
        self.exits.remove(fingerprint).is_some()
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }
}

type SharedPending = Arc<Mutex<PendingExitSet>>;

fn lock_pending(pending: &SharedPending) -> MutexGuard<'_, PendingExitSet> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An exit relay held in the pending set
///
/// Dropping the claim releases the exit.
#[derive(Debug)]
pub struct ExitClaim {
    pending: SharedPending,
    exit: Relay,
    released: bool,
}

impl ExitClaim {
    pub fn exit(&self) -> &Relay {
        &self.exit
    }

    /// Release the exit now instead of on drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if lock_pending(&self.pending).remove(&self.exit.fingerprint) {
            log::debug!(
                "Released exit {} ({})",
                self.exit.short_id(),
                self.exit.country_code
            );
        }
    }
}

impl Drop for ExitClaim {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Removes a build waiter from the tracker if the allocation is dropped
/// before the outcome arrives
struct WaitRegistration<'a> {
    tracker: &'a BuildTracker,
    id: CircuitId,
    armed: bool,
}

impl<'a> WaitRegistration<'a> {
    fn new(tracker: &'a BuildTracker, id: CircuitId) -> Self {
        Self {
            tracker,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("Allocation abandoned while circuit {} was building", self.id);
            self.tracker.forget(self.id);
        }
    }
}

/// A built circuit together with the claim on its exit
#[derive(Debug)]
pub struct AllocatedCircuit {
    circuit: Circuit,
    claim: ExitClaim,
}

impl AllocatedCircuit {
    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    pub fn exit(&self) -> &Relay {
        self.claim.exit()
    }

    /// Split into the circuit and the claim that keeps its exit pending
    pub fn into_parts(self) -> (Circuit, ExitClaim) {
        (self.circuit, self.claim)
    }
}

/// Statistics about circuit allocation
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Allocation attempts (each picks a fresh path)
    pub attempts: u64,
    /// Launches rejected immediately by the network
    pub launch_rejections: u64,
    /// Launches that failed while extending
    pub build_failures: u64,
    /// Attempts that found no exit outside the pending countries
    pub no_candidates: u64,
    /// Circuits handed to callers
    pub circuits_built: u64,
    /// Build time of the most recent circuit (ms)
    pub last_build_ms: u64,
    /// Average build time (ms)
    pub avg_build_ms: f64,
}

/// Builds circuits with pairwise-distinct pending exit countries
pub struct CircuitAllocator<L, S = RuntimeSleeper> {
    directory: Arc<RelayDirectory>,
    launcher: Arc<L>,
    tracker: Arc<BuildTracker>,
    sleeper: S,
    policy: RetryPolicy,
    pending: SharedPending,
    stats: Mutex<AllocatorStats>,
}

impl<L: CircuitLauncher> CircuitAllocator<L, RuntimeSleeper> {
    /// Create an allocator with the platform timer and unbounded retries
    pub fn new(
        directory: Arc<RelayDirectory>,
        launcher: Arc<L>,
        tracker: Arc<BuildTracker>,
    ) -> Self {
        Self {
            directory,
            launcher,
            tracker,
            sleeper: RuntimeSleeper,
            policy: RetryPolicy::default(),
            pending: Arc::new(Mutex::new(PendingExitSet::default())),
            stats: Mutex::new(AllocatorStats::default()),
        }
    }
}

impl<L: CircuitLauncher, S: SleepProvider> CircuitAllocator<L, S> {
    /// Replace the retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the timer used for retry delays
    pub fn with_sleeper<S2: SleepProvider>(self, sleeper: S2) -> CircuitAllocator<L, S2> {
        CircuitAllocator {
            directory: self.directory,
            launcher: self.launcher,
            tracker: self.tracker,
            sleeper,
            policy: self.policy,
            pending: self.pending,
            stats: self.stats,
        }
    }

    /// Obtain a built circuit
    ///
    /// With an unbounded policy this only returns once a circuit is built.
    /// With a bounded policy it fails with `RetriesExhausted`.
    pub async fn allocate(&self) -> Result<AllocatedCircuit> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if !self.policy.allows(attempt) {
                return Err(ProbeError::RetriesExhausted {
                    operation: "circuit allocation".into(),
                    attempts: attempt - 1,
                });
            }
            self.update_stats(|s| s.attempts += 1);

            let (path, claim) = match self.claim_path() {
                Some(selected) => selected,
                None => {
                    self.update_stats(|s| s.no_candidates += 1);
                    log::warn!(
                        "  ⚠️ No exit available outside pending countries (attempt {}), waiting",
                        attempt
                    );
                    self.sleeper.sleep(self.policy.delay).await;
                    continue;
                }
            };

            log::info!("🔨 Launching circuit {} (attempt {})", path, attempt);
            let started = Instant::now();

            let mut circuit = match self.launcher.launch(&path).await {
                Ok(circuit) => circuit,
                Err(e) => {
                    self.update_stats(|s| s.launch_rejections += 1);
                    log::warn!("  ⚠️ Launch rejected: {}", e);
                    drop(claim);
                    continue;
                }
            };

            let waiting = WaitRegistration::new(&self.tracker, circuit.id);
            let outcome = self.tracker.wait_for(circuit.id).await;
            waiting.disarm();

            match outcome {
                BuildOutcome::Built => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    circuit.status = CircuitStatus::Built;
                    self.record_build(elapsed);
                    log::info!(
                        "  ✅ Circuit {} built in {}ms, exit {} ({})",
                        circuit.id,
                        elapsed,
                        claim.exit().short_id(),
                        claim.exit().country_code
                    );
                    return Ok(AllocatedCircuit { circuit, claim });
                }
                BuildOutcome::Failed(reason) => {
                    self.update_stats(|s| s.build_failures += 1);
                    log::warn!("  ⚠️ Circuit {} failed: {}", circuit.id, reason);
                    drop(claim);
                    self.sleeper.sleep(self.policy.delay).await;
                }
            }
        }
    }

    /// Pick a path and claim its exit, atomically with respect to other
    /// allocations
    fn claim_path(&self) -> Option<(Path, ExitClaim)> {
        let mut rng = rand::thread_rng();

        let exit = {
            let mut pending = lock_pending(&self.pending);
            let excluded = pending.countries();
            let exit = self.directory.select_exit(&excluded, &mut rng)?.clone();
            pending.insert(&exit);
            exit
        };
        let claim = ExitClaim {
            pending: Arc::clone(&self.pending),
            exit,
            released: false,
        };

        let exit_fp = claim.exit().fingerprint.as_str();
        let guard = self.directory.select_guard(&[exit_fp], &mut rng)?.clone();
        let middle = self
            .directory
            .select_middle(&[exit_fp, guard.fingerprint.as_str()], &mut rng)?
            .clone();

        let path = Path::new(guard, middle, claim.exit().clone());
        Some((path, claim))
    }

    /// Fingerprints of every pending exit
    pub fn pending_exits(&self) -> Vec<String> {
        lock_pending(&self.pending).exits.keys().cloned().collect()
    }

    /// Countries of every pending exit
    pub fn pending_countries(&self) -> HashSet<String> {
        lock_pending(&self.pending).countries()
    }

    /// Number of pending exits
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// The directory this allocator selects from
    pub fn directory(&self) -> &RelayDirectory {
        &self.directory
    }

    /// Get statistics
    pub fn stats(&self) -> AllocatorStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut AllocatorStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    fn record_build(&self, elapsed_ms: u64) {
        self.update_stats(|s| {
            s.circuits_built += 1;
            s.last_build_ms = elapsed_ms;
            let n = s.circuits_built as f64;
            s.avg_build_ms += (elapsed_ms as f64 - s.avg_build_ms) / n;
        });
    }
}
