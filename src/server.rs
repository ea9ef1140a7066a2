//! # The Serving Loop
//!
//! A single-threaded loop over a fixed pool of client slots. Each slot is
//! created once at startup, owns its 4096-byte I/O buffer, and cycles
//! through a linear state machine:
//!
//! ```text
//! accepting --> reading --> writing --> disconnecting --> accepting
//! ```
//!
//! The handler runs inline between read and write; it performs one
//! signature verification and a few small file reads, so the whole
//! request fits comfortably between two I/O submissions. There is no
//! per-slot locking to get right because there is only one thread: the
//! loop must run on a current-thread runtime inside a
//! [`tokio::task::LocalSet`] (or via [`Server::serve`], which owns one),
//! and the runtime's reactor is the completion source.
//!
//! ## Capacity and backpressure
//!
//! A slot is taken from the pool *before* `accept` is awaited, so when
//! all [`SLOT_COUNT`] slots are mid-request new arrivals queue in the
//! kernel listen backlog. No graceful shedding.
//!
//! ## Failure containment
//!
//! A slot stuck in `reading` or `writing` past [`IO_DEADLINE`] is
//! force-closed and recycled; other slots are unaffected. Clients always
//! see a well-formed response or a reset, and the loop never exits on
//! client misbehavior. A slot surfacing in the `idle` sentinel state
//! during steady-state operation is a bug and is logged as such.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::handler::{self, Reply, ServerContext};
use crate::http::{ParseError, Request};

/// Number of long-lived client slots.
pub const SLOT_COUNT: usize = 256;

/// Per-slot I/O buffer size. Requests are parsed from and responses
/// written into this one buffer.
pub const SLOT_BUF_LEN: usize = 4096;

/// Deadline for a single read or write before the slot is force-closed.
const IO_DEADLINE: Duration = Duration::from_secs(10);

/// Lifecycle of a client slot. `Idle` exists only between slot creation
/// and the first accept being posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Accepting,
    Reading,
    Writing,
    Disconnecting,
}

/// A preallocated per-client record: buffer, fill level, request start
/// time, and state. Slots are recycled, never reallocated.
struct ClientSlot {
    id: usize,
    buf: Box<[u8; SLOT_BUF_LEN]>,
    len: usize,
    started: Instant,
    state: SlotState,
}

impl ClientSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            buf: Box::new([0u8; SLOT_BUF_LEN]),
            len: 0,
            started: Instant::now(),
            state: SlotState::Idle,
        }
    }

    fn recycle(&mut self) {
        self.len = 0;
        self.state = SlotState::Accepting;
    }
}

/// How a slot's read phase ended.
enum ReadOutcome {
    /// A complete request is in the buffer.
    Complete,
    /// The bytes can never parse; answer 400.
    Malformed,
    /// The buffer filled without a complete request; answer 413.
    Overflow,
    /// Peer closed before sending a full request.
    ClosedEarly,
    /// No progress within [`IO_DEADLINE`].
    TimedOut,
    Failed(std::io::Error),
}

/// The board server: listener, shared context, and the slot pool.
pub struct Server {
    listener: TcpListener,
    ctx: Rc<ServerContext>,
    slots: usize,
}

impl Server {
    /// Binds the listener. The std-level bind uses the default kernel
    /// listen backlog of 128, which is also this design's backpressure
    /// queue. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Bind failures are startup-fatal; the caller propagates them to the
    /// process entry point.
    pub fn bind(addr: SocketAddr, ctx: ServerContext) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set listener non-blocking")?;
        let listener =
            TcpListener::from_std(std_listener).context("failed to register listener")?;

        Ok(Self { listener, ctx: Rc::new(ctx), slots: SLOT_COUNT })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the loop until Ctrl-C. Must execute inside a
    /// [`tokio::task::LocalSet`]; use [`serve`](Self::serve) when there
    /// is no ambient one.
    pub async fn run(self) -> Result<()> {
        let Server { listener, ctx, slots } = self;

        // The pool: slots travel out through `accept` and back through
        // `free_tx` when their connection disconnects. Capacity equals
        // the slot count, so returns never block.
        let (free_tx, mut free_rx) = mpsc::channel::<ClientSlot>(slots);
        for id in 0..slots {
            let mut slot = ClientSlot::new(id);
            // Posting the first accept ends the idle sentinel state.
            slot.state = SlotState::Accepting;
            free_tx.try_send(slot).expect("pool capacity equals slot count");
        }

        info!(addr = %listener.local_addr()?, slots, "listening");

        loop {
            let mut slot = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                slot = free_rx.recv() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };
            if slot.state != SlotState::Accepting {
                error!(slot = slot.id, state = ?slot.state, "slot surfaced outside accepting state");
                slot.state = SlotState::Accepting;
            }

            let (stream, peer) = tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        let _ = free_tx.try_send(slot);
                        continue;
                    }
                },
            };

            tokio::task::spawn_local(drive(slot, stream, peer, Rc::clone(&ctx), free_tx.clone()));
        }

        info!("shutting down");
        Ok(())
    }

    /// Runs the loop on a fresh [`tokio::task::LocalSet`].
    pub async fn serve(self) -> Result<()> {
        let local = tokio::task::LocalSet::new();
        local.run_until(self.run()).await
    }
}

/// Drives one connection through the slot state machine, then returns
/// the slot to the pool.
async fn drive(
    mut slot: ClientSlot,
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Rc<ServerContext>,
    free_tx: mpsc::Sender<ClientSlot>,
) {
    slot.state = SlotState::Reading;
    slot.started = Instant::now();
    slot.len = 0;

    let outcome = read_request(&mut slot, &mut stream).await;
    let reply_info: Option<(Reply<'_>, String)> = match outcome {
        ReadOutcome::Complete => match Request::parse(&slot.buf[..slot.len]) {
            Ok(req) => {
                let line = format!("{} {}", req.method.as_str(), req.path);
                Some((handler::handle(&req, &ctx), line))
            }
            Err(_) => Some((Reply::Error(400), "<malformed>".into())),
        },
        ReadOutcome::Malformed => Some((Reply::Error(400), "<malformed>".into())),
        ReadOutcome::Overflow => Some((Reply::Error(413), "<oversized>".into())),
        ReadOutcome::ClosedEarly => {
            debug!(slot = slot.id, peer = %peer, "peer closed mid-request");
            None
        }
        ReadOutcome::TimedOut => {
            warn!(slot = slot.id, peer = %peer, "read deadline exceeded, closing slot");
            None
        }
        ReadOutcome::Failed(e) => {
            debug!(slot = slot.id, peer = %peer, error = %e, "recv failed");
            None
        }
    };

    if let Some((reply, request_line)) = reply_info {
        slot.state = SlotState::Writing;
        let status = reply.status();
        let resp_len = handler::write_reply(&reply, &mut slot.buf[..]);

        match time::timeout(IO_DEADLINE, stream.write_all(&slot.buf[..resp_len])).await {
            Ok(Ok(())) => {
                info!(
                    peer = %peer,
                    status,
                    elapsed_us = slot.started.elapsed().as_micros() as u64,
                    request = %request_line,
                    "request complete"
                );
            }
            Ok(Err(e)) => debug!(slot = slot.id, peer = %peer, error = %e, "send failed"),
            Err(_) => warn!(slot = slot.id, peer = %peer, "write deadline exceeded, closing slot"),
        }
    }

    slot.state = SlotState::Disconnecting;
    let _ = stream.shutdown().await;
    drop(stream);

    slot.recycle();
    let _ = free_tx.try_send(slot);
}

/// Reads into the slot buffer until a complete request, a protocol
/// violation, or a deadline.
async fn read_request(slot: &mut ClientSlot, stream: &mut TcpStream) -> ReadOutcome {
    loop {
        if slot.len == SLOT_BUF_LEN {
            return ReadOutcome::Overflow;
        }
        let n = match time::timeout(IO_DEADLINE, stream.read(&mut slot.buf[slot.len..])).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return ReadOutcome::Failed(e),
            Err(_) => return ReadOutcome::TimedOut,
        };
        if n == 0 {
            return ReadOutcome::ClosedEarly;
        }
        slot.len += n;

        match Request::parse(&slot.buf[..slot.len]) {
            Ok(_) => return ReadOutcome::Complete,
            Err(ParseError::Incomplete) => {}
            Err(ParseError::Malformed) => return ReadOutcome::Malformed,
        }
    }
}
