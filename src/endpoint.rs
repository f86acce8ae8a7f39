//! Circuit-bound connections
//!
//! A [`BoundEndpoint`] opens one application connection through the local
//! Tor proxy and makes sure it rides a freshly allocated circuit:
//!
//! ```text
//! allocate circuit ─► open proxy connection ─► read local port
//!        ─► register port with binder ─┬─► proxy handshake (stream appears)
//!                                      └─► await binding
//! ```
//!
//! The handshake and the binding run together: Tor only announces the stream
//! once the proxy request is sent, so waiting for the binding first would
//! never finish.

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use crate::allocator::{AllocatedCircuit, CircuitAllocator, ExitClaim};
use crate::binder::StreamBinder;
use crate::error::Result;
use crate::http::Target;
use crate::probe::FetchState;
use crate::protocol::{Circuit, CircuitLauncher, Stream};
use crate::runtime::SleepProvider;

/// Connection primitive towards the local Tor proxy
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: AsyncRead + AsyncWrite + Unpin + Send;

    /// Open a raw connection to the proxy
    async fn open(&self) -> Result<Self::Connection>;

    /// Local source port of an open connection
    fn local_port(&self, conn: &Self::Connection) -> Result<u16>;

    /// Run the proxy handshake for `target`; afterwards the connection
    /// carries application data end to end
    ///
    /// Requests are written as plain HTTP. When `target.is_https` is set the
    /// returned connection must already be wrapped in TLS for `target.host`.
    async fn establish(&self, conn: Self::Connection, target: &Target) -> Result<Self::Connection>;
}

/// An established connection and the circuit that carries it
pub struct BoundConnection<C> {
    pub connection: C,
    /// Circuit the binder attached the stream to
    pub circuit: Circuit,
    pub stream: Stream,
    /// Circuit that was allocated for this connection
    pub allocated: Circuit,
    claim: ExitClaim,
}

impl<C> BoundConnection<C> {
    /// Whether the stream rode the circuit allocated for it
    ///
    /// The binder attaches to the allocated circuit, so a mismatch only shows
    /// up when the network reports the stream on a different one.
    pub fn is_consistent(&self) -> bool {
        self.circuit.id == self.allocated.id && !self.stream.left_circuit(self.allocated.id)
    }

    /// Claim keeping the exit pending while the connection is in use
    pub fn claim(&self) -> &ExitClaim {
        &self.claim
    }
}

/// One logical connection bound to its own circuit
pub struct BoundEndpoint<'a, L, S, T> {
    allocator: &'a CircuitAllocator<L, S>,
    binder: &'a StreamBinder,
    transport: &'a T,
    target: Target,
}

impl<'a, L, S, T> BoundEndpoint<'a, L, S, T>
where
    L: CircuitLauncher,
    S: SleepProvider,
    T: Transport,
{
    pub fn new(
        allocator: &'a CircuitAllocator<L, S>,
        binder: &'a StreamBinder,
        transport: &'a T,
        target: Target,
    ) -> Self {
        Self {
            allocator,
            binder,
            transport,
            target,
        }
    }

    /// Allocate a circuit, connect, and wait until the stream is bound
    ///
    /// Transport failures are returned as-is; retrying is the caller's call.
    pub async fn connect(&self) -> Result<BoundConnection<T::Connection>> {
        self.connect_tracked(|_| {}).await
    }

    /// Like [`connect`](Self::connect), reporting each phase as it starts
    pub async fn connect_tracked(
        &self,
        mut on_state: impl FnMut(FetchState),
    ) -> Result<BoundConnection<T::Connection>> {
        on_state(FetchState::Allocating);
        let allocated: AllocatedCircuit = self.allocator.allocate().await?;
        let (allocated, claim) = allocated.into_parts();

        on_state(FetchState::Connecting);
        log::debug!("🔌 Opening proxy connection for circuit {}", allocated.id);
        let conn = self.transport.open().await?;
        let port = self.transport.local_port(&conn)?;

        on_state(FetchState::Binding);
        let binding = self
            .binder
            .register_pending_port(port, allocated.clone())?;

        let (connection, bound) = futures::try_join!(
            self.transport.establish(conn, &self.target),
            binding
        )?;

        let bound = BoundConnection {
            connection,
            circuit: bound.circuit,
            stream: bound.stream,
            allocated,
            claim,
        };

        if bound.is_consistent() {
            log::info!(
                "  ✅ Port {} bound to circuit {} (exit {} {})",
                port,
                bound.circuit.id,
                bound.claim.exit().short_id(),
                bound.claim.exit().country_code
            );
        } else {
            log::warn!(
                "  ⚠️ Port {} was allocated circuit {} but rode circuit {}",
                port,
                bound.allocated.id,
                bound.circuit.id
            );
        }

        Ok(bound)
    }
}
