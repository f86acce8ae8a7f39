//! In-memory Tor network for integration tests
//!
//! `FakeNetwork` plays both external collaborators of the probe: it launches
//! circuits (reporting build outcomes through a `ProbeController`, before
//! `launch` even returns) and it is the local proxy (announcing a stream
//! for every handshake and serving a page chosen by the exit's country).
//! Every handshake yields once, so concurrent fetch tasks hold their
//! circuits at the same time.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use tor_exit_probe::{
    AttachDecision, Circuit, CircuitAllocator, CircuitId, CircuitLauncher, CircuitObserver,
    ImmediateSleeper, Path, ProbeController, ProbeError, Relay, RelayDirectory, RelayFlags, Result,
    RetryPolicy, SleepFuture, SleepProvider, Stream, StreamId, Target, Transport,
};

pub const FIRST_LOCAL_PORT: u16 = 40000;

/// Circuit that misrouted streams are reported on
pub const MISROUTED_CIRCUIT: CircuitId = CircuitId(9999);

/// Directory with one exit-and-guard relay per country
pub fn directory(countries: &[&str]) -> RelayDirectory {
    let relays = countries
        .iter()
        .enumerate()
        .map(|(i, cc)| {
            Relay::new(
                format!("relay{}{}", cc, i),
                format!("{:040X}", i + 1),
                *cc,
                RelayFlags::from_string("Exit Fast Guard Running Stable Valid"),
            )
        })
        .collect();
    RelayDirectory::new(relays)
}

/// A fake network with its own controller
pub fn network() -> Arc<FakeNetwork> {
    Arc::new(FakeNetwork::new(ProbeController::standalone()))
}

/// Allocator launching through `network`, with timers that never wait
pub fn allocator(
    network: &Arc<FakeNetwork>,
    directory: RelayDirectory,
    policy: RetryPolicy,
) -> CircuitAllocator<FakeNetwork, ImmediateSleeper> {
    CircuitAllocator::new(
        Arc::new(directory),
        Arc::clone(network),
        Arc::clone(network.controller().tracker()),
    )
    .with_policy(policy)
    .with_sleeper(ImmediateSleeper)
}

/// Timer that returns at once and remembers every requested delay
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

impl SleepProvider for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        self.calls.lock().unwrap().push(duration);
        Box::pin(futures::future::ready(()))
    }
}

/// Body of a timeline page listing `ids`
pub fn timeline(ids: &[&str]) -> String {
    let items: String = ids
        .iter()
        .map(|id| format!("<li class=\"tweet\" data-tweet-id=\"{}\">post</li>\n", id))
        .collect();
    format!("<html><body><ol>\n{}</ol></body></html>", items)
}

pub struct FakeNetwork {
    controller: ProbeController,
    next_circuit: AtomicU64,
    next_stream: AtomicU64,
    next_port: AtomicU16,
    /// Circuits launched so far, by id
    launched: Mutex<HashMap<CircuitId, Circuit>>,
    /// Number of upcoming launches to reject outright
    reject_launches: AtomicUsize,
    /// Number of upcoming launches whose build fails
    fail_builds: AtomicUsize,
    /// Number of upcoming proxy connections to refuse
    fail_connects: AtomicUsize,
    /// Number of upcoming streams reported on a circuit of the network's choosing
    misroute_streams: AtomicUsize,
    /// Id handed to every launched circuit, instead of fresh ones
    fixed_circuit_id: Mutex<Option<CircuitId>>,
    /// Targets handed to `establish`, in order
    established: Mutex<Vec<Target>>,
    /// Page served per exit country
    pages: Mutex<HashMap<String, String>>,
    default_page: Mutex<String>,
}

impl FakeNetwork {
    pub fn new(controller: ProbeController) -> Self {
        Self {
            controller,
            next_circuit: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            next_port: AtomicU16::new(FIRST_LOCAL_PORT),
            launched: Mutex::new(HashMap::new()),
            reject_launches: AtomicUsize::new(0),
            fail_builds: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            misroute_streams: AtomicUsize::new(0),
            fixed_circuit_id: Mutex::new(None),
            established: Mutex::new(Vec::new()),
            pages: Mutex::new(HashMap::new()),
            default_page: Mutex::new(timeline(&[])),
        }
    }

    pub fn controller(&self) -> &ProbeController {
        &self.controller
    }

    pub fn reject_next_launches(&self, n: usize) {
        self.reject_launches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_builds(&self, n: usize) {
        self.fail_builds.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn misroute_next_streams(&self, n: usize) {
        self.misroute_streams.store(n, Ordering::SeqCst);
    }

    /// Give every future circuit the same id, as a confused control client might
    pub fn reuse_circuit_id(&self, id: CircuitId) {
        *self.fixed_circuit_id.lock().unwrap() = Some(id);
    }

    pub fn serve(&self, country: &str, ids: &[&str]) {
        self.pages
            .lock()
            .unwrap()
            .insert(country.to_string(), timeline(ids));
    }

    pub fn serve_default(&self, ids: &[&str]) {
        *self.default_page.lock().unwrap() = timeline(ids);
    }

    pub fn established(&self) -> Vec<Target> {
        self.established.lock().unwrap().clone()
    }

    pub fn launched(&self) -> Vec<Circuit> {
        let mut circuits: Vec<Circuit> = self.launched.lock().unwrap().values().cloned().collect();
        circuits.sort_by_key(|c| c.id);
        circuits
    }

    /// Announce a stream from `port` and return the controller's decision
    pub fn announce_stream(&self, port: u16, target: &str) -> AttachDecision {
        let stream = Stream {
            id: StreamId(self.next_stream.fetch_add(1, Ordering::SeqCst)),
            source_port: port,
            target: target.to_string(),
            circuit: Self::take_one(&self.misroute_streams).then_some(MISROUTED_CIRCUIT),
        };
        self.controller.handle_new_stream(&stream)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn page_for(&self, circuit: CircuitId) -> String {
        let country = self
            .launched
            .lock()
            .unwrap()
            .get(&circuit)
            .map(|c| c.exit().country_code.clone());
        country
            .and_then(|cc| self.pages.lock().unwrap().get(&cc).cloned())
            .unwrap_or_else(|| self.default_page.lock().unwrap().clone())
    }
}

#[async_trait]
impl CircuitLauncher for FakeNetwork {
    async fn launch(&self, path: &Path) -> Result<Circuit> {
        if Self::take_one(&self.reject_launches) {
            return Err(ProbeError::CircuitLaunchRejected(
                "552 No such router".into(),
            ));
        }

        let fresh = CircuitId(self.next_circuit.fetch_add(1, Ordering::SeqCst));
        let id = self.fixed_circuit_id.lock().unwrap().unwrap_or(fresh);
        let circuit = Circuit::launched(id, path.clone());
        self.launched.lock().unwrap().insert(id, circuit.clone());

        // The outcome is reported before the allocator starts waiting
        if Self::take_one(&self.fail_builds) {
            self.controller.on_circuit_failed(&circuit, "DESTROYED");
        } else {
            self.controller.on_circuit_built(&circuit);
        }
        Ok(circuit)
    }
}

#[async_trait]
impl Transport for FakeNetwork {
    type Connection = FakeConnection;

    async fn open(&self) -> Result<FakeConnection> {
        if Self::take_one(&self.fail_connects) {
            return Err(ProbeError::ConnectionFailed(
                "connection refused by proxy".into(),
            ));
        }
        Ok(FakeConnection::new(
            self.next_port.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn local_port(&self, conn: &FakeConnection) -> Result<u16> {
        Ok(conn.port)
    }

    async fn establish(&self, mut conn: FakeConnection, target: &Target) -> Result<FakeConnection> {
        // Let the other fetch tasks allocate while this handshake is in flight
        YieldOnce::default().await;
        self.established.lock().unwrap().push(target.clone());

        match self.announce_stream(conn.port, &target.authority()) {
            AttachDecision::Attach(circuit) => {
                let body = self.page_for(circuit);
                conn.response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Type: text/html\r\n\r\n{}",
                    body
                )
                .into_bytes();
                Ok(conn)
            }
            AttachDecision::UseDefault => Err(ProbeError::ConnectionFailed(
                "stream was not attached".into(),
            )),
        }
    }
}

/// Pending on the first poll, ready on the second
#[derive(Default)]
pub struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Proxy connection that records the request and replays a canned response
pub struct FakeConnection {
    pub port: u16,
    pub request: Vec<u8>,
    response: Vec<u8>,
    read_pos: usize,
}

impl FakeConnection {
    fn new(port: u16) -> Self {
        Self {
            port,
            request: Vec::new(),
            response: Vec::new(),
            read_pos: 0,
        }
    }
}

impl AsyncRead for FakeConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let remaining = &this.response[this.read_pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        this.read_pos += n;
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for FakeConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().request.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
