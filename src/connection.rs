use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex, MutexGuard, Notify};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info};

use crate::codec::{ReplyCodec, READ_BUFFER_CAPACITY};
use crate::config::ConnectionConfig;
use crate::handshake::{self, ServerInfo};
use crate::message::{Completion, Message};
use crate::reply::Reply;
use crate::sink::ResultSink;
use crate::stats::{Counters, Stats};
use crate::{Error, Result};

/// Flush the output buffer to the socket early once it grows past this,
/// even when other writers are still queued behind the write lock.
const PARTIAL_FLUSH_BYTES: usize = 8192;

/// When enabled, completions run on the reader task instead of being
/// dispatched to the worker pool. Process-wide; meant for test harnesses
/// that need deterministic completion ordering.
static INLINE_COMPLETIONS: AtomicBool = AtomicBool::new(false);

pub fn set_inline_completions(enabled: bool) {
    INLINE_COMPLETIONS.store(enabled, Ordering::SeqCst);
}

/// Connection lifecycle. The ordering is strict: a connection only ever
/// moves forward, and every transition is an atomic compare-and-swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::New,
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// Fired exactly once, on the transition to `Closed`.
    Closed,
    /// Any asynchronous failure: server error replies are non-fatal, I/O
    /// and protocol failures while reading are fatal.
    Error { message: String, fatal: bool },
}

/// The write half of the socket plus everything the writer tracks while
/// holding the write lock.
pub(crate) struct Writer {
    sink: OwnedWriteHalf,
    pub(crate) buffer: BytesMut,
    /// Database the server currently has selected for this connection.
    /// `-1` means unknown, forcing a `SELECT` before the next
    /// database-bound command.
    pub(crate) current_db: i32,
    io_timeout: Option<Duration>,
}

impl Writer {
    fn new(sink: OwnedWriteHalf, io_timeout: Option<Duration>) -> Writer {
        Writer {
            sink,
            buffer: BytesMut::with_capacity(PARTIAL_FLUSH_BYTES),
            current_db: 0,
            io_timeout,
        }
    }

    /// Push buffered bytes to the socket. A soft flush is a no-op until
    /// the buffer is large enough to be worth a syscall; the last writer
    /// in a coalesced batch always flushes hard.
    pub(crate) async fn flush(&mut self, hard: bool) -> io::Result<()> {
        if self.buffer.is_empty() || (!hard && self.buffer.len() < PARTIAL_FLUSH_BYTES) {
            return Ok(());
        }

        let data = self.buffer.split();
        match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, self.sink.write_all(&data))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "socket send timed out"))?,
            None => self.sink.write_all(&data).await,
        }
    }
}

/// The FIFO of messages written to the wire and awaiting replies. The
/// queue signals `drained` on every pop that empties it, which is what
/// `close` waits on before it is willing to enqueue QUIT.
struct SentQueue {
    queue: Mutex<VecDeque<Message>>,
    drained: Notify,
}

impl SentQueue {
    fn new() -> SentQueue {
        SentQueue {
            queue: Mutex::new(VecDeque::new()),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().expect("sent queue lock poisoned")
    }

    fn push(&self, msg: Message) {
        self.lock().push_back(msg);
    }

    fn pop(&self) -> Option<Message> {
        let mut queue = self.lock();
        let msg = queue.pop_front();
        if msg.is_some() && queue.is_empty() {
            self.drained.notify_waiters();
        }
        msg
    }

    fn oldest(&self) -> Option<String> {
        self.lock().front().map(|msg| msg.to_string())
    }

    async fn wait_empty(&self) {
        loop {
            let drained = self.drained.notified();
            if self.lock().is_empty() {
                return;
            }
            drained.await;
        }
    }
}

/// A pipelined client connection to one server.
///
/// Any number of tasks may enqueue concurrently; writes are serialized
/// by a single write lock and coalesced, one reader task drives the
/// receive loop, and replies are matched to in-flight messages strictly
/// in send order.
pub struct Connection {
    config: ConnectionConfig,
    state: AtomicU8,
    /// Pre-open gate: user messages accumulate in `unsent` and are not
    /// written until the handshake releases the hold.
    held: AtomicBool,
    /// Set by an abortive close; everything but QUIT fails from then on.
    abort: AtomicBool,
    unsent: Mutex<VecDeque<Message>>,
    sent: SentQueue,
    writer: AsyncMutex<Option<Writer>>,
    /// Writers currently inside `enqueue`; the last one to finish
    /// performs the hard flush for the whole batch.
    pending_writers: AtomicUsize,
    counters: Counters,
    events: broadcast::Sender<ConnectionEvent>,
    closed_fired: AtomicBool,
    closing: Notify,
    server_info: Mutex<Option<ServerInfo>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Arc<Connection> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Connection {
            config,
            state: AtomicU8::new(ConnectionState::New as u8),
            held: AtomicBool::new(true),
            abort: AtomicBool::new(false),
            unsent: Mutex::new(VecDeque::new()),
            sent: SentQueue::new(),
            writer: AsyncMutex::new(None),
            pending_writers: AtomicUsize::new(0),
            counters: Counters::default(),
            events,
            closed_fired: AtomicBool::new(false),
            closing: Notify::new(),
            server_info: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn try_transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Subscribe to lifecycle and failure events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info
            .lock()
            .expect("server info lock poisoned")
            .clone()
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> Stats {
        let unsent = self.unsent.lock().expect("unsent queue lock poisoned").len();
        self.counters.snapshot(unsent)
    }

    // ---- open ----------------------------------------------------------

    /// Connect, run the handshake, and move the connection to `Open`.
    ///
    /// Fails with a lifecycle error when called on anything but a fresh
    /// connection. A non-`ERR` handshake failure forces `Closed`; a
    /// server `ERR ...` reply to the probe counts as success (the server
    /// is talking, it just lacks a feature).
    pub async fn open(self: &Arc<Connection>) -> Result<()> {
        if !self.try_transition(ConnectionState::New, ConnectionState::Opening) {
            return Err(Error::Lifecycle(format!(
                "cannot open a connection in the {:?} state",
                self.state()
            )));
        }

        info!(host = %self.config.host, port = self.config.port, "connecting");

        let stream = match self.connect_socket().await {
            Ok(stream) => stream,
            Err(err) => {
                self.shutdown(format!("connect failed: {}", err)).await;
                return Err(err);
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(Writer::new(write_half, self.config.io_timeout));

        let reader = Arc::clone(self);
        tokio::spawn(async move { reader.read_loop(read_half).await });

        match self.run_handshake().await {
            Ok(()) => {}
            Err(err) => {
                self.shutdown(format!("handshake failed: {}", err)).await;
                return Err(err);
            }
        }

        if !self.try_transition(ConnectionState::Opening, ConnectionState::Open) {
            // The reader hit a fatal error while the handshake was in
            // flight and the connection is already on its way down.
            return Err(Error::Shutdown(
                "the connection closed during the handshake".to_string(),
            ));
        }

        info!(server = ?self.server_info(), "connection open");

        // Release the held gate and pump the backlog accumulated while
        // the handshake owned the socket.
        self.held.store(false, Ordering::SeqCst);
        self.write_pass(None).await;

        Ok(())
    }

    async fn connect_socket(&self) -> Result<TcpStream> {
        let addr = (self.config.host.as_str(), self.config.port);
        let connect = TcpStream::connect(addr);
        let stream = match self.config.io_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// The handshake sequence issued while the connection is held:
    /// optional AUTH, then a probe whose completion decides the open
    /// outcome, then optional client-name registration.
    async fn run_handshake(self: &Arc<Connection>) -> Result<()> {
        if let Some(password) = self.config.password.clone() {
            // A wrong password surfaces as a must-succeed failure, which
            // tears the connection down before the probe resolves.
            let auth = Message::new(None, "AUTH", vec![Bytes::from(password)])
                .expecting(b"OK")
                .must_succeed()
                .during_init();
            self.execute_ok(auth).await;
        }

        let known = self.config.known_server.clone();
        let probe_result = match known {
            Some(info) => {
                *self.server_info.lock().expect("server info lock poisoned") = Some(info.clone());
                self.probe_known(&info).await
            }
            None => self.probe_discover().await,
        };

        match probe_result {
            Ok(()) => Ok(()),
            // "ERR unknown command" and friends: the server answered, it
            // just lacks the feature the probe used.
            Err(Error::Server(text)) if text.starts_with("ERR") => {
                debug!(error = %text, "probe rejected by server; treating as success");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn probe_known(self: &Arc<Connection>, info: &ServerInfo) -> Result<()> {
        if let Some(name) = self.config.name.clone() {
            if handshake::supports_client_name(info) {
                let setname = Message::new(
                    None,
                    "CLIENT",
                    vec![Bytes::from_static(b"SETNAME"), Bytes::from(name)],
                )
                .expecting(b"OK")
                .during_init();
                let probe = self.execute_ok(setname).await;
                return self.wait(probe).await;
            }
        }

        let ping = Message::new(None, "PING", Vec::new()).during_init();
        let probe = self.execute_status(ping).await;
        self.wait(probe).await.map(|_| ())
    }

    async fn probe_discover(self: &Arc<Connection>) -> Result<()> {
        let probe = self
            .execute_string(Message::new(None, "INFO", Vec::new()).during_init())
            .await;
        let text = self.wait(probe).await?.unwrap_or_default();

        let info = handshake::parse_info(&text);
        debug!(version = ?info.version, server_type = ?info.server_type, "discovered server");

        let supports_name = handshake::supports_client_name(&info);
        *self.server_info.lock().expect("server info lock poisoned") = Some(info);

        if supports_name {
            if let Some(name) = self.config.name.clone() {
                // Fire-and-forget: a failure here is reported through the
                // event channel, not the open outcome.
                let setname = Message::new(
                    None,
                    "CLIENT",
                    vec![Bytes::from_static(b"SETNAME"), Bytes::from(name)],
                )
                .expecting(b"OK")
                .during_init();
                self.enqueue(setname).await;
            }
        }

        Ok(())
    }

    // ---- execute primitives --------------------------------------------

    /// The delegation point for typed command wrappers: attach the sink
    /// matching the expected reply shape and enqueue.
    pub async fn execute_ok(&self, msg: Message) -> Completion<()> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Ok(tx))).await;
        completion
    }

    pub async fn execute_status(&self, msg: Message) -> Completion<String> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Status(tx))).await;
        completion
    }

    pub async fn execute_boolean(&self, msg: Message) -> Completion<bool> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Boolean(tx))).await;
        completion
    }

    pub async fn execute_integer(&self, msg: Message) -> Completion<i64> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Integer(tx))).await;
        completion
    }

    pub async fn execute_nullable_integer(&self, msg: Message) -> Completion<Option<i64>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::NullableInteger(tx)))
            .await;
        completion
    }

    pub async fn execute_double(&self, msg: Message) -> Completion<f64> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Double(tx))).await;
        completion
    }

    pub async fn execute_nullable_double(&self, msg: Message) -> Completion<Option<f64>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::NullableDouble(tx)))
            .await;
        completion
    }

    pub async fn execute_bytes(&self, msg: Message) -> Completion<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Bytes(tx))).await;
        completion
    }

    pub async fn execute_string(&self, msg: Message) -> Completion<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::String(tx))).await;
        completion
    }

    pub async fn execute_bytes_array(&self, msg: Message) -> Completion<Vec<Option<Bytes>>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::BytesArray(tx))).await;
        completion
    }

    pub async fn execute_string_array(&self, msg: Message) -> Completion<Vec<Option<String>>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::StringArray(tx)))
            .await;
        completion
    }

    pub async fn execute_score_pairs(&self, msg: Message) -> Completion<Vec<(Bytes, f64)>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::ScorePairs(tx))).await;
        completion
    }

    pub async fn execute_field_pairs(&self, msg: Message) -> Completion<Vec<(Bytes, Bytes)>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::FieldPairs(tx))).await;
        completion
    }

    pub async fn execute_raw(&self, msg: Message) -> Completion<Reply> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.enqueue(msg.with_sink(ResultSink::Raw(tx))).await;
        completion
    }

    /// Await a completion, bounded by the configured sync timeout.
    pub async fn wait<T>(&self, completion: Completion<T>) -> Result<T> {
        match tokio::time::timeout(self.config.sync_timeout, completion).await {
            Ok(result) => result,
            Err(_) => {
                self.counters.record_timeout();
                let detail = if self.config.include_detail_in_timeouts {
                    self.sent
                        .oldest()
                        .map(|cmd| format!("; oldest in-flight command: {}", cmd))
                        .unwrap_or_default()
                } else {
                    String::new()
                };
                Err(Error::Timeout(detail))
            }
        }
    }

    // ---- send path -----------------------------------------------------

    /// Enqueue one message. Any failure is delivered through the
    /// message's completion, never as a panic or a lost write.
    pub async fn enqueue(&self, msg: Message) {
        if msg.is_queue_jump() {
            self.counters.record_queue_jumper();
        }

        if self.abort.load(Ordering::SeqCst) && !msg.is_quit() {
            msg.fail(Error::Shutdown(
                "the connection was aborted; no further messages are accepted".to_string(),
            ));
            return;
        }
        let state = self.state();
        if state == ConnectionState::Closed
            || (state == ConnectionState::Closing && !msg.is_quit())
        {
            msg.fail(Error::Shutdown(format!(
                "cannot enqueue on a connection in the {:?} state",
                state
            )));
            return;
        }

        // Held: park the message and stay away from the socket; the
        // post-handshake pump flushes the backlog. During-init and
        // queue-jump messages go straight through the gate.
        let held = self.held.load(Ordering::SeqCst);
        if held && !msg.is_during_init() && !msg.is_queue_jump() {
            self.push_unsent(msg);
            return;
        }

        self.write_pass(Some(msg)).await;
    }

    fn push_unsent(&self, msg: Message) {
        let mut unsent = self.unsent.lock().expect("unsent queue lock poisoned");
        if let Some(limit) = self.config.max_unsent {
            if unsent.len() >= limit {
                drop(unsent);
                msg.fail(Error::Lifecycle(format!(
                    "the unsent queue is over its {} message limit",
                    limit
                )));
                return;
            }
        }
        unsent.push_back(msg);
    }

    fn pop_unsent(&self) -> Option<Message> {
        self.unsent
            .lock()
            .expect("unsent queue lock poisoned")
            .pop_front()
    }

    /// One trip through the write lock: drain the backlog (unless the
    /// connection is held), write the direct message if any, drain
    /// whatever arrived meanwhile, then flush according to the
    /// coalescing counter.
    async fn write_pass(&self, direct: Option<Message>) {
        self.pending_writers.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            self.pending_writers.fetch_sub(1, Ordering::SeqCst);
            if let Some(msg) = direct {
                msg.fail(Error::Shutdown(
                    "the connection is closed".to_string(),
                ));
            }
            return;
        };

        // While held, only handshake and queue-jump traffic may reach
        // the socket; the parked backlog waits for the pump that runs
        // when the hold is released.
        let held = self.held.load(Ordering::SeqCst);
        if !held {
            while let Some(msg) = self.pop_unsent() {
                self.write_message(writer, msg);
            }
        }
        if let Some(msg) = direct {
            self.write_message(writer, msg);
            // Absorb anything enqueued while this writer held the lock.
            if !held {
                while let Some(msg) = self.pop_unsent() {
                    self.write_message(writer, msg);
                }
            }
        }

        let remaining = self.pending_writers.fetch_sub(1, Ordering::SeqCst) - 1;
        if let Err(err) = writer.flush(remaining == 0).await {
            drop(guard);
            self.handle_write_error(err).await;
        }
    }

    /// A failed socket write is fatal: report it and tear down.
    pub(crate) async fn handle_write_error(&self, err: io::Error) {
        let cause = format!("error writing to the server: {}", err);
        self.raise_error(cause.clone(), true);
        self.shutdown(cause).await;
    }

    /// Serialize one message into the output buffer and append it to the
    /// sent queue. Returns whether the message made it to the wire.
    pub(crate) fn write_message(&self, writer: &mut Writer, msg: Message) -> bool {
        if !msg.try_mark_sent() {
            self.counters.record_cancelled();
            msg.complete(Reply::Cancelled);
            return false;
        }

        if self.abort.load(Ordering::SeqCst) && !msg.is_quit() {
            msg.fail(Error::Shutdown(
                "the connection was aborted before the message was written".to_string(),
            ));
            return false;
        }

        // A message bound to a database the server does not have selected
        // gets a synthetic SELECT serialized immediately before it, under
        // the same lock acquisition.
        if let Some(db) = msg.db() {
            if writer.current_db != i32::from(db) {
                let select = Message::select(db);
                select.try_mark_sent();
                select.write_to(&mut writer.buffer);
                self.counters.record_sent(None);
                self.sent.push(select);
                writer.current_db = i32::from(db);
            }
        }

        let invalidates = msg.invalidates_db();
        msg.write_to(&mut writer.buffer);
        self.counters.record_sent(msg.db());
        self.sent.push(msg);

        if invalidates {
            writer.current_db = -1;
        }

        true
    }

    /// Lock the writer for a multi-message composite (transactions). The
    /// caller writes through [`Connection::write_message`] and flushes.
    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, Option<Writer>> {
        self.writer.lock().await
    }

    pub(crate) fn push_sent(&self, msg: Message) {
        self.sent.push(msg);
    }

    /// Wait until every in-flight message has its reply, bounded by the
    /// sync timeout. Used before serializing messages such as QUIT.
    pub(crate) async fn wait_sent_drained(&self) -> bool {
        tokio::time::timeout(self.config.sync_timeout, self.sent.wait_empty())
            .await
            .is_ok()
    }

    // ---- receive path --------------------------------------------------

    /// The single reader: fill the buffer from the socket, decode every
    /// complete reply, match each against the oldest in-flight message,
    /// repeat. Any decode failure or EOF shuts the connection down.
    async fn read_loop(self: Arc<Connection>, mut source: OwnedReadHalf) {
        let mut codec = ReplyCodec;
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

        let cause = 'outer: loop {
            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(reply)) => {
                        if let Err(err) = self.on_reply(reply) {
                            break 'outer format!("error processing data: {}", err);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => break 'outer format!("error processing data: {}", err),
                }
            }

            if self.state() == ConnectionState::Closed {
                return;
            }

            tokio::select! {
                _ = self.closing.notified() => return,
                read = source.read_buf(&mut buffer) => match read {
                    Ok(0) => break 'outer "the server terminated the connection".to_string(),
                    Ok(_) => {}
                    Err(err) => break 'outer format!("error reading from the server: {}", err),
                },
            }
        };

        // An EOF racing a deliberate close is not a failure.
        if self.state() == ConnectionState::Closed {
            return;
        }

        self.raise_error(cause.clone(), true);
        self.shutdown(cause).await;
    }

    /// Match one decoded reply with the oldest in-flight message. An
    /// error return is fatal to the connection.
    fn on_reply(&self, reply: Reply) -> Result<()> {
        self.counters.record_received();

        let msg = self.sent.pop().ok_or_else(|| {
            Error::Protocol("received a reply with no message awaiting one".to_string())
        })?;

        // Substitute the synthetic outcomes for expected-literal messages.
        let reply = match (msg.expected(), reply) {
            (Some(expected), Reply::Status(status)) if status == *expected => Reply::Pass,
            (Some(_), Reply::Status(status)) => {
                Reply::Error(String::from_utf8_lossy(&status).into_owned())
            }
            (_, reply) => reply,
        };

        if let Reply::Error(text) = &reply {
            self.counters.record_error_message();
            self.raise_error(text.clone(), false);

            if msg.is_must_succeed() {
                let failure = format!("{} failed: {}", msg, text);
                msg.complete(reply);
                return Err(Error::Protocol(failure));
            }
        }

        debug!(command = %msg, reply = %reply, "matched reply");

        // Completions run off the reader so a slow caller cannot stall
        // the receive loop.
        if INLINE_COMPLETIONS.load(Ordering::SeqCst) {
            msg.complete(reply);
        } else {
            tokio::spawn(async move { msg.complete(reply) });
        }

        Ok(())
    }

    // ---- close ---------------------------------------------------------

    /// Close the connection. A graceful close (`abort == false`) waits
    /// for in-flight replies and exchanges QUIT within the sync timeout;
    /// an abortive close tears down immediately. Idempotent.
    pub async fn close(&self, abort: bool) -> Result<()> {
        if abort {
            self.abort.store(true, Ordering::SeqCst);
        }

        let closing = self.try_transition(ConnectionState::Open, ConnectionState::Closing)
            || self.try_transition(ConnectionState::Opening, ConnectionState::Closing);
        if !closing {
            if self.try_transition(ConnectionState::New, ConnectionState::Closed) {
                self.fire_closed();
            }
            // Already closing or closed: nothing further to do.
            return Ok(());
        }

        if !abort && self.config.quit_on_close {
            // QUIT serializes behind everything in flight: wait for the
            // sent queue to drain first.
            self.wait_sent_drained().await;
            let quit = Message::quit();
            let goodbye = self.execute_ok(quit).await;
            if let Err(err) = self.wait(goodbye).await {
                debug!(error = %err, "QUIT exchange failed during close");
            }
        }

        self.shutdown("connection closed by client".to_string()).await;
        Ok(())
    }

    /// `close(true)` without the result. Safe to call any number of
    /// times, in any state.
    pub async fn dispose(&self) {
        let _ = self.close(true).await;
    }

    /// Drain the unsent backlog, completing every message as cancelled.
    pub fn cancel_unsent(&self) {
        let drained: Vec<Message> = {
            let mut unsent = self.unsent.lock().expect("unsent queue lock poisoned");
            unsent.drain(..).collect()
        };
        for msg in drained {
            self.counters.record_cancelled();
            msg.complete(Reply::Cancelled);
        }
    }

    /// Final teardown: move to `Closed`, release the socket, fail every
    /// outstanding message, and fire the closed event exactly once.
    async fn shutdown(&self, cause: String) {
        let _ = self.try_transition(ConnectionState::Opening, ConnectionState::Closing)
            || self.try_transition(ConnectionState::Open, ConnectionState::Closing);
        let became_closed =
            self.try_transition(ConnectionState::Closing, ConnectionState::Closed)
                || self.try_transition(ConnectionState::New, ConnectionState::Closed);

        // Wake the reader and release the socket and output buffer.
        self.closing.notify_waiters();
        let writer = self.writer.lock().await.take();
        drop(writer);

        // Every message still awaiting a reply completes with a
        // termination error; the backlog is failed the same way.
        while let Some(msg) = self.sent.pop() {
            msg.fail(Error::Shutdown(format!(
                "the server terminated before a reply was received ({})",
                cause
            )));
        }
        while let Some(msg) = self.pop_unsent() {
            msg.fail(Error::Shutdown(format!(
                "the connection closed before the message was sent ({})",
                cause
            )));
        }

        if became_closed {
            debug!(%cause, "connection closed");
        }
        self.fire_closed();
    }

    fn fire_closed(&self) {
        if self
            .closed_fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.events.send(ConnectionEvent::Closed);
        }
    }

    pub(crate) fn raise_error(&self, message: String, fatal: bool) {
        if fatal {
            error!(%message, "connection failure");
        } else {
            debug!(%message, "server error reply");
        }
        let _ = self.events.send(ConnectionEvent::Error { message, fatal });
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }
}
