//! The RMAP engine: a receive-loop thread that multiplexes one [`ByteLink`]
//! across many concurrent callers, plus a thin per-caller initiator on top.
//!
//! Shaped after `drv-lpc55-sprot-server`'s main loop -- one thread owns the
//! transport and dispatches by a small integer key -- except the dispatch
//! key here is an RMAP transaction id handed out by a FIFO allocator rather
//! than a fixed protocol slot, and replies are delivered to a waiting caller
//! thread instead of being written back synchronously.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use growth_link::ByteLink;
use growth_rmap_api::{CommandPacket, Instruction, ParsedPacket, ReplyPacket, RmapStatus, RmapTarget};
use growth_ssdtp::{EopKind, SsdtpFramer};
use tracing::{debug, warn};

growth_counters::counters! {
    /// Monotonic counters exposed for diagnostics; never reset.
    #[derive(Debug)]
    pub struct EngineCounters {
        pub discarded_received_commands,
        pub discarded_malformed_packets,
        pub erroneous_replies,
        pub erroneous_received_commands,
        pub transactions_aborted,
        pub transaction_id_exhausted,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no free transaction ids available")]
    TooManyConcurrentTransactions,
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("framer error while sending command: {0}")]
    Send(#[from] growth_ssdtp::FramerError),
}

enum WakerState {
    Pending,
    Delivered(ReplyPacket),
    ShutDown,
}

/// A one-shot slot an initiator waits on for its reply. Matches the
/// "cyclic ownership" note in the design: the engine only ever holds a
/// `Arc<Waker>`, never a pointer back to the initiator itself.
pub struct Waker {
    state: Mutex<WakerState>,
    cv: Condvar,
}

pub enum WaitOutcome {
    Reply(ReplyPacket),
    TimedOut,
    ShutDown,
}

impl Default for Waker {
    fn default() -> Self {
        Waker {
            state: Mutex::new(WakerState::Pending),
            cv: Condvar::new(),
        }
    }
}

impl Waker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a reply is delivered, the engine shuts down, or
    /// `timeout` elapses. Spurious wakeups are absorbed by
    /// `wait_timeout_while`'s own predicate loop.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let guard = self.state.lock().unwrap();
        let (mut guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| matches!(s, WakerState::Pending))
            .unwrap();
        match std::mem::replace(&mut *guard, WakerState::Pending) {
            WakerState::Pending => WaitOutcome::TimedOut,
            WakerState::Delivered(reply) => WaitOutcome::Reply(reply),
            WakerState::ShutDown => WaitOutcome::ShutDown,
        }
    }

    fn deliver(&self, reply: ReplyPacket) {
        *self.state.lock().unwrap() = WakerState::Delivered(reply);
        self.cv.notify_all();
    }

    fn shutdown(&self) {
        *self.state.lock().unwrap() = WakerState::ShutDown;
        self.cv.notify_all();
    }
}

struct PendingTable {
    free_ids: VecDeque<u16>,
    waiting: HashMap<u16, Arc<Waker>>,
}

/// Owns one byte-link (via its framer) and the transaction-id space built
/// on top of it. Long-lived: created once per serial connection and shut
/// down once at teardown.
pub struct RmapEngine<L: ByteLink> {
    framer: Arc<SsdtpFramer<L>>,
    table: Mutex<PendingTable>,
    pub counters: EngineCounters,
    stopped: AtomicBool,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<L: ByteLink + 'static> RmapEngine<L> {
    /// Allocates transaction ids from the full 16-bit space.
    pub fn new(link: Arc<L>) -> Arc<Self> {
        Self::with_id_pool(link, 0..=u16::MAX)
    }

    /// Allocates transaction ids only from `ids`. Exists so more than one
    /// engine can share a link's id space by partitioning it, and so tests
    /// can starve the free-id pool down to a handful of ids without sending
    /// tens of thousands of throwaway transactions first.
    pub fn with_id_pool(link: Arc<L>, ids: impl IntoIterator<Item = u16>) -> Arc<Self> {
        let framer = Arc::new(SsdtpFramer::new(link));
        let engine = Arc::new(RmapEngine {
            framer,
            table: Mutex::new(PendingTable {
                free_ids: ids.into_iter().collect(),
                waiting: HashMap::new(),
            }),
            counters: EngineCounters::default(),
            stopped: AtomicBool::new(false),
            receive_thread: Mutex::new(None),
        });
        let worker = engine.clone();
        let handle = thread::Builder::new()
            .name("rmap-engine-rx".into())
            .spawn(move || worker.receive_loop())
            .expect("failed to spawn rmap engine receive thread");
        *engine.receive_thread.lock().unwrap() = Some(handle);
        engine
    }

    /// Allocates a transaction id, registers `waker` (if the command
    /// expects a reply), serialises `command` with that id, and sends it.
    /// If the command does not request a reply, the id is released
    /// immediately after a successful send.
    pub fn initiate(
        &self,
        mut command: CommandPacket,
        waker: Option<Arc<Waker>>,
    ) -> Result<u16, EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }

        let id = {
            let mut table = self.table.lock().unwrap();
            match table.free_ids.pop_front() {
                Some(id) => {
                    command.transaction_id = id;
                    if command.instruction.reply {
                        if let Some(w) = &waker {
                            table.waiting.insert(id, w.clone());
                        }
                    }
                    id
                }
                None => {
                    self.counters.transaction_id_exhausted.inc();
                    return Err(EngineError::TooManyConcurrentTransactions);
                }
            }
        };

        let wire = command.serialize();
        if let Err(e) = self.framer.send(&wire, EopKind::Eop) {
            let mut table = self.table.lock().unwrap();
            table.waiting.remove(&id);
            table.free_ids.push_back(id);
            return Err(e.into());
        }

        if !command.instruction.reply {
            let mut table = self.table.lock().unwrap();
            table.free_ids.push_back(id);
        }
        Ok(id)
    }

    /// Removes `id` from the pending table and releases it. A reply that
    /// arrives afterwards no longer finds an entry and is counted as
    /// unexpected rather than delivered.
    pub fn cancel(&self, id: u16) {
        let mut table = self.table.lock().unwrap();
        if table.waiting.remove(&id).is_some() {
            self.counters.transactions_aborted.inc();
        }
        table.free_ids.push_back(id);
    }

    /// Stops the receive loop, joins its thread, and wakes any still-
    /// pending waiters with [`WaitOutcome::ShutDown`]. Calling this more
    /// than once has no additional effect.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.framer.cancel();
        if let Some(handle) = self.receive_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn receive_loop(self: Arc<Self>) {
        loop {
            match self.framer.recv() {
                Ok(Some((payload, _eop))) => self.handle_frame(&payload),
                Ok(None) => break,
                Err(growth_ssdtp::FramerError::Link(e)) => {
                    warn!(error = %e, "rmap engine link error, stopping receive loop");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "rmap engine dropping malformed ssdtp frame");
                    self.counters.discarded_malformed_packets.inc();
                }
            }
        }
        self.stopped.store(true, Ordering::Release);
        let mut table = self.table.lock().unwrap();
        for (_, waker) in table.waiting.drain() {
            waker.shutdown();
        }
    }

    fn handle_frame(&self, payload: &[u8]) {
        match growth_rmap_api::parse(payload) {
            Ok(ParsedPacket::Reply(reply)) => {
                let waker = self.table.lock().unwrap().waiting.remove(&reply.transaction_id);
                match waker {
                    Some(waker) => {
                        self.table.lock().unwrap().free_ids.push_back(reply.transaction_id);
                        waker.deliver(reply);
                    }
                    None => {
                        self.counters.erroneous_replies.inc();
                        debug!(tid = reply.transaction_id, "reply with no matching pending transaction");
                    }
                }
            }
            Ok(ParsedPacket::Command(_)) => {
                self.counters.discarded_received_commands.inc();
            }
            Err(e) => {
                self.counters.discarded_malformed_packets.inc();
                debug!(error = %e, "malformed rmap packet discarded");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InitiatorError {
    #[error("transaction timed out waiting for a reply")]
    Timeout,
    #[error("reply carried a non-success status: {0:?}")]
    ReplyStatus(RmapStatus),
    #[error("read reply payload did not fit in the caller's buffer")]
    ReadReplyTooLarge,
    #[error("expected a write reply with no payload")]
    UnexpectedWriteReply,
    #[error("engine shut down while waiting for a reply")]
    Shutdown,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Per-caller thin wrapper over [`RmapEngine`] offering blocking read/write.
pub struct RmapInitiator<L: ByteLink> {
    engine: Arc<RmapEngine<L>>,
    target: RmapTarget,
}

impl<L: ByteLink + 'static> RmapInitiator<L> {
    pub fn new(engine: Arc<RmapEngine<L>>, target: RmapTarget) -> Self {
        RmapInitiator { engine, target }
    }

    pub fn read(&self, addr: u32, len: u32, buf: &mut [u8], timeout: Duration) -> Result<(), InitiatorError> {
        let command = CommandPacket::read(&self.target, 0, addr, len);
        let waker = Arc::new(Waker::new());
        let id = self.engine.initiate(command, Some(waker.clone()))?;
        match waker.wait(timeout) {
            WaitOutcome::Reply(reply) => {
                if !reply.status.is_success() {
                    return Err(InitiatorError::ReplyStatus(reply.status));
                }
                let payload = reply.payload.ok_or(InitiatorError::UnexpectedWriteReply)?;
                if payload.len() > buf.len() {
                    return Err(InitiatorError::ReadReplyTooLarge);
                }
                buf[..payload.len()].copy_from_slice(&payload);
                Ok(())
            }
            WaitOutcome::TimedOut => {
                self.engine.cancel(id);
                Err(InitiatorError::Timeout)
            }
            WaitOutcome::ShutDown => Err(InitiatorError::Shutdown),
        }
    }

    /// Writes `data` at `addr`. `instruction` overrides the default
    /// verify=1/reply=1/increment=1 write flags when the caller needs
    /// different semantics (e.g. a fire-and-forget write with reply=0).
    pub fn write(
        &self,
        addr: u32,
        data: &[u8],
        timeout: Duration,
        instruction: Option<Instruction>,
    ) -> Result<(), InitiatorError> {
        let instruction = instruction.unwrap_or_else(|| Instruction::write_command(0));
        let command = CommandPacket::write(&self.target, 0, addr, data, instruction);

        if !instruction.reply {
            self.engine.initiate(command, None)?;
            return Ok(());
        }

        let waker = Arc::new(Waker::new());
        let id = self.engine.initiate(command, Some(waker.clone()))?;
        match waker.wait(timeout) {
            WaitOutcome::Reply(reply) => {
                if reply.payload.is_some() {
                    return Err(InitiatorError::UnexpectedWriteReply);
                }
                if !reply.status.is_success() {
                    return Err(InitiatorError::ReplyStatus(reply.status));
                }
                Ok(())
            }
            WaitOutcome::TimedOut => {
                self.engine.cancel(id);
                Err(InitiatorError::Timeout)
            }
            WaitOutcome::ShutDown => Err(InitiatorError::Shutdown),
        }
    }
}
