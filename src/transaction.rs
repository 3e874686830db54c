//! Transaction correlation between requests and responses.
//!
//! Every client connection runs one registry task that owns the pending
//! transaction state exclusively. User calls, inbound transport bytes,
//! connection events and timers all funnel into that task through a single
//! `select!` loop, so a response can never race a timeout for the same
//! transaction.
//!
//! Two registries exist because the framings impose different disciplines:
//!
//! - **TCP** ([`TcpRegistry`]): many transactions in flight, correlated by
//!   the MBAP transaction identifier allocated from a
//!   [`TransactionSequence`].
//! - **RTU** ([`RtuRegistry`]): the line is half duplex, so exactly one
//!   transaction is in flight; further requests queue FIFO and each
//!   transmit waits for the t3.5 turnaround gate. Unit 0 is broadcast: no
//!   response is awaited and the caller completes once the line has been
//!   quiet for t3.5 after the transmit.
//!
//! A transaction lives from send to response, timeout, cancellation or
//! transport disconnect, whichever comes first. Frames that match no
//! pending transaction (late responses, strays from other masters) are
//! dropped and counted in [`TransportStats::dropped_frames`].

use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{DecodeErrorKind, ModbusError, ModbusResult};
use crate::mbap::{self, MbapDecoder, MbapFrame};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId, BROADCAST_SLAVE_ID};
use crate::rtu::{self, RtuDecoder, RtuFrame, TurnaroundGate};
use crate::transport::{ModbusTransport, TransportEvent};

/// Monotonically increasing transaction identifier source.
///
/// Identifiers are generated in the range `[0, 65535]` and wrap back to 0
/// after a full revolution.
#[derive(Debug, Default)]
pub struct TransactionSequence {
    next_id: u16,
}

impl TransactionSequence {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    /// Return the next identifier and advance the counter.
    pub fn next(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Allocate a transaction identifier that is not currently pending.
///
/// Probes forward from the sequence position for at most one full
/// revolution; with all 65536 identifiers held the allocation fails.
fn allocate_transaction_id<T>(
    sequence: &mut TransactionSequence,
    pending: &HashMap<u16, T>,
) -> ModbusResult<u16> {
    for _ in 0..=u16::MAX as u32 {
        let id = sequence.next();
        if !pending.contains_key(&id) {
            return Ok(id);
        }
    }
    Err(ModbusError::TooManyOutstanding)
}

/// Counters describing one client connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Frames that matched no pending transaction and were discarded.
    pub dropped_frames: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SharedStats {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    dropped_frames: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connected: AtomicBool,
}

impl SharedStats {
    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// A registry completes each request with the decoded response, or `None`
/// for broadcasts, or an error.
type Reply = oneshot::Sender<ModbusResult<Option<ModbusResponse>>>;

pub(crate) enum Command {
    Request { unit_id: SlaveId, request: ModbusRequest, reply: Reply, token: u64 },
    Cancel { token: u64 },
    Shutdown,
}

/// One in-flight transaction.
struct Pending {
    token: u64,
    unit_id: SlaveId,
    function: ModbusFunction,
    reply: Reply,
    deadline: Instant,
    broadcast: bool,
}

struct QueuedRequest {
    unit_id: SlaveId,
    request: ModbusRequest,
    reply: Reply,
    token: u64,
}

/// Outcome of one `select!` round; handled with full access to the
/// registry state after the losing futures are dropped.
enum Tick {
    Command(Option<Command>),
    Transport(TransportEvent),
    TimerElapsed,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Decode the response PDU for a completed transaction and finish its
/// awaiter. Exception PDUs surface as errors, never as `Ok`.
fn complete_with_pdu(stats: &SharedStats, pending: Pending, pdu: &[u8]) {
    let result = match ModbusResponse::decode(pdu, pending.function) {
        Ok(ModbusResponse::Exception { function, exception }) => {
            SharedStats::count(&stats.errors);
            Err(ModbusError::Exception { function: function.to_u8(), exception })
        }
        Ok(response) => {
            SharedStats::count(&stats.responses_received);
            Ok(Some(response))
        }
        Err(kind) => {
            SharedStats::count(&stats.errors);
            Err(ModbusError::decode(kind))
        }
    };
    let _ = pending.reply.send(result);
}

/// Cloneable submission handle to a registry task.
#[derive(Clone)]
pub(crate) struct RegistryHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    stats: Arc<SharedStats>,
    next_token: Arc<AtomicU64>,
}

impl RegistryHandle {
    /// Submit a request and await its completion.
    ///
    /// Dropping the returned future before completion cancels the
    /// transaction (and on RTU admits the next queued request).
    pub(crate) async fn execute(
        &self,
        unit_id: SlaveId,
        request: ModbusRequest,
    ) -> ModbusResult<Option<ModbusResponse>> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request { unit_id, request, reply: reply_tx, token })
            .map_err(|_| ModbusError::NotConnected)?;

        let mut guard = CancelOnDrop { cmd_tx: &self.cmd_tx, token, armed: true };
        let result = match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::connection_lost("client task terminated")),
        };
        guard.armed = false;
        result
    }

    pub(crate) fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    /// Ask the registry task to shut down; pending requests complete with
    /// `Cancelled`.
    pub(crate) fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct CancelOnDrop<'a> {
    cmd_tx: &'a mpsc::UnboundedSender<Command>,
    token: u64,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.cmd_tx.send(Command::Cancel { token: self.token });
        }
    }
}

/// Transaction registry for MBAP-framed (TCP) transports.
pub(crate) struct TcpRegistry {
    transport: Box<dyn ModbusTransport>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    decoder: MbapDecoder,
    sequence: TransactionSequence,
    pending: HashMap<u16, Pending>,
    stats: Arc<SharedStats>,
    request_timeout: Duration,
    connected: bool,
}

impl TcpRegistry {
    /// Spawn the registry task for `transport` and return the submission
    /// handle.
    pub(crate) fn spawn<T: ModbusTransport>(
        transport: T,
        request_timeout: Duration,
    ) -> RegistryHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SharedStats::default());
        stats.connected.store(true, Ordering::Relaxed);
        let registry = Self {
            transport: Box::new(transport),
            cmd_rx,
            decoder: MbapDecoder::new(),
            sequence: TransactionSequence::new(),
            pending: HashMap::new(),
            stats: stats.clone(),
            request_timeout,
            connected: true,
        };
        tokio::spawn(registry.run());
        RegistryHandle { cmd_tx, stats, next_token: Arc::new(AtomicU64::new(0)) }
    }

    async fn run(mut self) {
        loop {
            let deadline = self.pending.values().map(|p| p.deadline).min();
            let tick = tokio::select! {
                cmd = self.cmd_rx.recv() => Tick::Command(cmd),
                event = self.transport.recv() => Tick::Transport(event),
                _ = sleep_until_opt(deadline) => Tick::TimerElapsed,
            };
            match tick {
                Tick::Command(None) | Tick::Command(Some(Command::Shutdown)) => break,
                Tick::Command(Some(Command::Request { unit_id, request, reply, token })) => {
                    self.handle_request(unit_id, request, reply, token).await;
                }
                Tick::Command(Some(Command::Cancel { token })) => self.cancel(token),
                Tick::Transport(event) => self.handle_transport(event).await,
                Tick::TimerElapsed => self.expire(Instant::now()),
            }
        }

        let _ = self.transport.close().await;
        self.stats.connected.store(false, Ordering::Relaxed);
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ModbusError::Cancelled));
        }
    }

    async fn handle_request(
        &mut self,
        unit_id: SlaveId,
        request: ModbusRequest,
        reply: Reply,
        token: u64,
    ) {
        if !self.connected {
            let _ = reply.send(Err(ModbusError::NotConnected));
            return;
        }
        let tid = match allocate_transaction_id(&mut self.sequence, &self.pending) {
            Ok(tid) => tid,
            Err(e) => {
                SharedStats::count(&self.stats.errors);
                let _ = reply.send(Err(e));
                return;
            }
        };
        let pdu = request.to_bytes();
        let mut frame = BytesMut::with_capacity(mbap::MBAP_HEADER_SIZE + pdu.len());
        mbap::encode_frame(tid, unit_id, &pdu, &mut frame);
        trace!("tcp tx tid={tid} uid={unit_id}: {}", hex::encode(&frame));
        if let Err(e) = self.transport.send(&frame).await {
            SharedStats::count(&self.stats.errors);
            let _ = reply.send(Err(e));
            return;
        }
        SharedStats::count(&self.stats.requests_sent);
        SharedStats::add(&self.stats.bytes_sent, frame.len() as u64);
        self.pending.insert(
            tid,
            Pending {
                token,
                unit_id,
                function: request.function(),
                reply,
                deadline: Instant::now() + self.request_timeout,
                broadcast: false,
            },
        );
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(data) => {
                SharedStats::add(&self.stats.bytes_received, data.len() as u64);
                self.decoder.extend(&data);
                loop {
                    match self.decoder.next_frame() {
                        Ok(Some(frame)) => self.on_frame(frame),
                        Ok(None) => break,
                        Err(kind) => {
                            warn!("MBAP stream desynchronized: {kind}");
                            let _ = self.transport.close().await;
                            self.disconnect(format!("framing error: {kind}"));
                            break;
                        }
                    }
                }
            }
            TransportEvent::Disconnected { cause } => self.disconnect(cause),
            TransportEvent::Connected => {
                debug!("transport connected");
                self.connected = true;
                self.stats.connected.store(true, Ordering::Relaxed);
                self.decoder.reset();
            }
        }
    }

    fn on_frame(&mut self, frame: MbapFrame) {
        let Some(pending) = self.pending.remove(&frame.transaction_id) else {
            SharedStats::count(&self.stats.dropped_frames);
            debug!(
                "dropping frame with unknown transaction id {} ({} pending)",
                frame.transaction_id,
                self.pending.len()
            );
            return;
        };
        if frame.unit_id != pending.unit_id {
            warn!(
                "response tid={} answered by unit {} instead of {}",
                frame.transaction_id, frame.unit_id, pending.unit_id
            );
        }
        complete_with_pdu(&self.stats, pending, &frame.pdu);
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in expired {
            if let Some(pending) = self.pending.remove(&tid) {
                SharedStats::count(&self.stats.timeouts);
                debug!("transaction {tid} to unit {} timed out", pending.unit_id);
                let _ = pending
                    .reply
                    .send(Err(ModbusError::timeout(self.request_timeout.as_millis() as u64)));
            }
        }
    }

    fn cancel(&mut self, token: u64) {
        let tid = self
            .pending
            .iter()
            .find(|(_, p)| p.token == token)
            .map(|(tid, _)| *tid);
        if let Some(tid) = tid {
            if let Some(pending) = self.pending.remove(&tid) {
                let _ = pending.reply.send(Err(ModbusError::Cancelled));
            }
        }
    }

    fn disconnect(&mut self, cause: String) {
        if self.connected {
            warn!("transport disconnected: {cause}");
        }
        self.connected = false;
        self.stats.connected.store(false, Ordering::Relaxed);
        self.decoder.reset();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ModbusError::connection_lost(cause.clone())));
        }
    }
}

/// Transaction registry for RTU (serial) transports.
pub(crate) struct RtuRegistry {
    transport: Box<dyn ModbusTransport>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    decoder: RtuDecoder,
    gate: TurnaroundGate,
    current: Option<Pending>,
    queue: VecDeque<QueuedRequest>,
    stats: Arc<SharedStats>,
    request_timeout: Duration,
    connected: bool,
}

impl RtuRegistry {
    /// Spawn the registry task for `transport` and return the submission
    /// handle. `baud_rate` drives the t1.5/t3.5 silence thresholds.
    pub(crate) fn spawn<T: ModbusTransport>(
        transport: T,
        baud_rate: u32,
        request_timeout: Duration,
    ) -> RegistryHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SharedStats::default());
        stats.connected.store(true, Ordering::Relaxed);
        let registry = Self {
            transport: Box::new(transport),
            cmd_rx,
            decoder: RtuDecoder::new(baud_rate),
            gate: TurnaroundGate::new(baud_rate),
            current: None,
            queue: VecDeque::new(),
            stats: stats.clone(),
            request_timeout,
            connected: true,
        };
        tokio::spawn(registry.run());
        RegistryHandle { cmd_tx, stats, next_token: Arc::new(AtomicU64::new(0)) }
    }

    async fn run(mut self) {
        loop {
            self.maybe_transmit().await;

            let deadline = self.next_deadline();
            let tick = tokio::select! {
                cmd = self.cmd_rx.recv() => Tick::Command(cmd),
                event = self.transport.recv() => Tick::Transport(event),
                _ = sleep_until_opt(deadline) => Tick::TimerElapsed,
            };
            match tick {
                Tick::Command(None) | Tick::Command(Some(Command::Shutdown)) => break,
                Tick::Command(Some(Command::Request { unit_id, request, reply, token })) => {
                    self.enqueue(unit_id, request, reply, token);
                }
                Tick::Command(Some(Command::Cancel { token })) => self.cancel(token),
                Tick::Transport(event) => self.handle_transport(event),
                Tick::TimerElapsed => self.on_timer(),
            }
        }

        let _ = self.transport.close().await;
        self.stats.connected.store(false, Ordering::Relaxed);
        if let Some(pending) = self.current.take() {
            let _ = pending.reply.send(Err(ModbusError::Cancelled));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(ModbusError::Cancelled));
        }
    }

    /// Admit the next queued request when the line is free and quiet.
    async fn maybe_transmit(&mut self) {
        if self.current.is_some() || !self.connected || self.queue.is_empty() {
            return;
        }
        let now = Instant::now();
        if !self.gate.is_ready(now.into_std()) {
            return;
        }
        let queued = match self.queue.pop_front() {
            Some(queued) => queued,
            None => return,
        };

        let pdu = queued.request.to_bytes();
        let mut frame = BytesMut::with_capacity(pdu.len() + 3);
        rtu::encode_frame(queued.unit_id, &pdu, &mut frame);
        trace!("rtu tx uid={}: {}", queued.unit_id, hex::encode(&frame));
        if let Err(e) = self.transport.send(&frame).await {
            SharedStats::count(&self.stats.errors);
            let _ = queued.reply.send(Err(e));
            return;
        }
        let now = Instant::now();
        self.gate.record_activity(now.into_std());
        SharedStats::count(&self.stats.requests_sent);
        SharedStats::add(&self.stats.bytes_sent, frame.len() as u64);
        let broadcast = queued.unit_id == BROADCAST_SLAVE_ID;
        self.current = Some(Pending {
            token: queued.token,
            unit_id: queued.unit_id,
            function: queued.request.function(),
            reply: queued.reply,
            deadline: now + self.request_timeout,
            broadcast,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |candidate: Instant| {
            deadline = Some(match deadline {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        };
        match &self.current {
            Some(pending) if pending.broadcast => {
                // A broadcast completes once the line has been quiet for
                // t3.5 after the transmit.
                match self.gate.ready_at() {
                    Some(at) => consider(Instant::from_std(at)),
                    None => consider(pending.deadline),
                }
            }
            Some(pending) => consider(pending.deadline),
            None if !self.queue.is_empty() && self.connected => {
                if let Some(at) = self.gate.ready_at() {
                    consider(Instant::from_std(at));
                }
            }
            None => {}
        }
        if let Some(silence) = self.decoder.silence_deadline() {
            consider(Instant::from_std(silence));
        }
        deadline
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if let Some(result) = self.decoder.poll_complete(now.into_std()) {
            self.on_frame_result(result);
        }
        let (broadcast, deadline) = match &self.current {
            Some(pending) => (pending.broadcast, pending.deadline),
            None => return,
        };
        if broadcast {
            if self.gate.is_ready(now.into_std()) {
                if let Some(pending) = self.current.take() {
                    SharedStats::count(&self.stats.responses_received);
                    let _ = pending.reply.send(Ok(None));
                }
            }
        } else if deadline <= now {
            if let Some(pending) = self.current.take() {
                SharedStats::count(&self.stats.timeouts);
                debug!("request to unit {} timed out", pending.unit_id);
                let _ = pending
                    .reply
                    .send(Err(ModbusError::timeout(self.request_timeout.as_millis() as u64)));
            }
        }
    }

    fn enqueue(&mut self, unit_id: SlaveId, request: ModbusRequest, reply: Reply, token: u64) {
        if !self.connected {
            let _ = reply.send(Err(ModbusError::NotConnected));
            return;
        }
        if unit_id == BROADCAST_SLAVE_ID && request.function().is_read_function() {
            let _ = reply.send(Err(ModbusError::invalid_argument(
                "broadcast requests cannot expect a response",
            )));
            return;
        }
        self.queue.push_back(QueuedRequest { unit_id, request, reply, token });
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(data) => {
                let now = Instant::now().into_std();
                SharedStats::add(&self.stats.bytes_received, data.len() as u64);
                self.gate.record_activity(now);
                if let Some(result) = self.decoder.feed(&data, now) {
                    self.on_frame_result(result);
                }
            }
            TransportEvent::Disconnected { cause } => self.disconnect(cause),
            TransportEvent::Connected => {
                debug!("transport connected");
                self.connected = true;
                self.stats.connected.store(true, Ordering::Relaxed);
                self.decoder.reset();
            }
        }
    }

    fn on_frame_result(&mut self, result: Result<RtuFrame, DecodeErrorKind>) {
        match result {
            Ok(frame) => self.on_frame(frame),
            Err(kind) => {
                let awaiting = self
                    .current
                    .as_ref()
                    .map(|p| !p.broadcast)
                    .unwrap_or(false);
                if awaiting {
                    if let Some(pending) = self.current.take() {
                        SharedStats::count(&self.stats.errors);
                        let _ = pending.reply.send(Err(ModbusError::decode(kind)));
                    }
                } else {
                    SharedStats::count(&self.stats.dropped_frames);
                    debug!("discarding corrupt frame with no transaction outstanding: {kind}");
                }
            }
        }
    }

    fn on_frame(&mut self, frame: RtuFrame) {
        let matches = self
            .current
            .as_ref()
            .map(|p| !p.broadcast && p.unit_id == frame.unit_id)
            .unwrap_or(false);
        if !matches {
            SharedStats::count(&self.stats.dropped_frames);
            debug!("dropping unmatched RTU frame from unit {}", frame.unit_id);
            return;
        }
        if let Some(pending) = self.current.take() {
            complete_with_pdu(&self.stats, pending, &frame.pdu);
        }
    }

    fn cancel(&mut self, token: u64) {
        if self.current.as_ref().map(|p| p.token) == Some(token) {
            if let Some(pending) = self.current.take() {
                let _ = pending.reply.send(Err(ModbusError::Cancelled));
            }
            return;
        }
        if let Some(index) = self.queue.iter().position(|q| q.token == token) {
            if let Some(queued) = self.queue.remove(index) {
                let _ = queued.reply.send(Err(ModbusError::Cancelled));
            }
        }
    }

    fn disconnect(&mut self, cause: String) {
        if self.connected {
            warn!("transport disconnected: {cause}");
        }
        self.connected = false;
        self.stats.connected.store(false, Ordering::Relaxed);
        self.decoder.reset();
        if let Some(pending) = self.current.take() {
            let _ = pending.reply.send(Err(ModbusError::connection_lost(cause.clone())));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(ModbusError::connection_lost(cause.clone())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_rollover() {
        let mut sequence = TransactionSequence::new();
        // Identifiers run 0..=65535 and roll over back to 0, twice.
        for _ in 0..2 {
            for expected in 0..=u16::MAX {
                assert_eq!(sequence.next(), expected);
            }
        }
        assert_eq!(sequence.next(), 0);
    }

    #[test]
    fn test_allocation_skips_pending_identifiers() {
        let mut sequence = TransactionSequence::new();
        let mut pending: HashMap<u16, ()> = HashMap::new();
        pending.insert(0, ());
        pending.insert(1, ());
        pending.insert(3, ());
        assert_eq!(allocate_transaction_id(&mut sequence, &pending).unwrap(), 2);
        assert_eq!(allocate_transaction_id(&mut sequence, &pending).unwrap(), 4);
    }

    #[test]
    fn test_allocation_wraps_past_the_end() {
        let mut sequence = TransactionSequence::new();
        for _ in 0..u16::MAX {
            sequence.next();
        }
        // Counter now sits at 65535; 65535 is taken so allocation wraps to 0.
        let mut pending: HashMap<u16, ()> = HashMap::new();
        pending.insert(u16::MAX, ());
        assert_eq!(allocate_transaction_id(&mut sequence, &pending).unwrap(), 0);
    }

    #[test]
    fn test_allocation_exhausted() {
        let mut sequence = TransactionSequence::new();
        let mut pending: HashMap<u16, ()> = HashMap::new();
        for id in 0..=u16::MAX {
            pending.insert(id, ());
        }
        assert_eq!(
            allocate_transaction_id(&mut sequence, &pending),
            Err(ModbusError::TooManyOutstanding)
        );
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = SharedStats::default();
        SharedStats::count(&stats.requests_sent);
        SharedStats::count(&stats.requests_sent);
        SharedStats::add(&stats.bytes_sent, 12);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.bytes_sent, 12);
        assert_eq!(snapshot.responses_received, 0);
    }
}
