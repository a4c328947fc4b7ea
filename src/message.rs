use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::reply::Reply;
use crate::request;
use crate::sink::{ResultSink, TxItem};
use crate::{Error, Result};

/// Lifecycle of one request message. Transitions are monotonic:
/// `NotSent -> Sent -> Complete`, with `NotSent -> Cancelled` permitted.
/// All transitions go through an atomic compare-and-swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageState {
    NotSent = 0,
    Sent = 1,
    Complete = 2,
    Cancelled = 3,
}

impl MessageState {
    fn from_u8(value: u8) -> MessageState {
        match value {
            0 => MessageState::NotSent,
            1 => MessageState::Sent,
            2 => MessageState::Complete,
            _ => MessageState::Cancelled,
        }
    }
}

/// One caller request: the immutable command and arguments, the target
/// database, delivery flags, the lifecycle state, and the sink that
/// completes the caller's future.
pub struct Message {
    command: Bytes,
    args: Vec<Bytes>,
    db: Option<u16>,
    expected: Option<Bytes>,
    must_succeed: bool,
    during_init: bool,
    queue_jump: bool,
    state: Arc<AtomicU8>,
    sink: ResultSink,
}

impl Message {
    pub fn new(db: Option<u16>, command: impl Into<Bytes>, args: Vec<Bytes>) -> Message {
        Message {
            command: command.into(),
            args,
            db,
            expected: None,
            must_succeed: false,
            during_init: false,
            queue_jump: false,
            state: Arc::new(AtomicU8::new(MessageState::NotSent as u8)),
            sink: ResultSink::Discard,
        }
    }

    /// The literal status reply the server must return for this message
    /// to succeed; the matcher substitutes `Pass` on a byte-for-byte
    /// match and an error reply otherwise.
    pub fn expecting(mut self, literal: &'static [u8]) -> Message {
        self.expected = Some(Bytes::from_static(literal));
        self
    }

    /// A failure reply escalates to a connection-level protocol error.
    pub fn must_succeed(mut self) -> Message {
        self.must_succeed = true;
        self
    }

    /// Allow this message through the pre-open held gate. Used only by
    /// the handshake sequence.
    pub(crate) fn during_init(mut self) -> Message {
        self.during_init = true;
        self
    }

    /// Bypass the held gate without reordering against in-flight writes.
    pub fn queue_jump(mut self) -> Message {
        self.queue_jump = true;
        self
    }

    pub(crate) fn with_sink(mut self, sink: ResultSink) -> Message {
        self.sink = sink;
        self
    }

    /// Synthetic `SELECT n` injected when a message's target database
    /// differs from the connection's current one.
    pub(crate) fn select(db: u16) -> Message {
        Message::new(None, "SELECT", vec![Bytes::from(db.to_string())])
            .expecting(b"OK")
            .must_succeed()
    }

    pub(crate) fn quit() -> Message {
        Message::new(None, "QUIT", Vec::new()).expecting(b"OK")
    }

    pub fn command(&self) -> &Bytes {
        &self.command
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn db(&self) -> Option<u16> {
        self.db
    }

    pub(crate) fn expected(&self) -> Option<&Bytes> {
        self.expected.as_ref()
    }

    pub(crate) fn is_must_succeed(&self) -> bool {
        self.must_succeed
    }

    pub(crate) fn is_during_init(&self) -> bool {
        self.during_init
    }

    pub(crate) fn is_queue_jump(&self) -> bool {
        self.queue_jump
    }

    pub(crate) fn is_quit(&self) -> bool {
        self.command.eq_ignore_ascii_case(b"QUIT")
    }

    /// Whether this command leaves the server's selected database in an
    /// unknown state, forcing a fresh `SELECT` before the next
    /// database-bound message.
    pub(crate) fn invalidates_db(&self) -> bool {
        [&b"EVAL"[..], b"EVALSHA", b"DISCARD", b"EXEC"]
            .iter()
            .any(|name| self.command.eq_ignore_ascii_case(name))
    }

    pub fn state(&self) -> MessageState {
        MessageState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn state_handle(&self) -> Arc<AtomicU8> {
        self.state.clone()
    }

    fn advance(&self, from: MessageState, to: MessageState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The writer claims a message just before putting it on the wire. A
    /// false return means the message was cancelled and must be skipped.
    pub(crate) fn try_mark_sent(&self) -> bool {
        self.advance(MessageState::NotSent, MessageState::Sent)
    }

    pub(crate) fn write_to(&self, dst: &mut BytesMut) {
        request::write_command(dst, &self.command, &self.args);
    }

    /// Complete the caller's future with a decoded reply.
    pub(crate) fn complete(self, reply: Reply) {
        if matches!(reply, Reply::Cancelled) {
            self.advance(MessageState::NotSent, MessageState::Cancelled);
        } else if !self.advance(MessageState::Sent, MessageState::Complete) {
            self.advance(MessageState::NotSent, MessageState::Complete);
        }
        self.sink.complete(reply);
    }

    /// Complete the caller's future with a failure.
    pub(crate) fn fail(self, error: Error) {
        if !self.advance(MessageState::Sent, MessageState::Complete) {
            self.advance(MessageState::NotSent, MessageState::Complete);
        }
        self.sink.fail(error);
    }

    /// Split a buffered transaction member into the item holding its
    /// real sink and the wire message that expects the provisional
    /// `QUEUED` acknowledgement. The lifecycle handle is shared, so a
    /// caller-side cancel still applies.
    pub(crate) fn into_queued(self) -> (Arc<TxItem>, Message) {
        let item = Arc::new(TxItem::new(self.sink));
        let queued = Message {
            command: self.command,
            args: self.args,
            db: self.db,
            expected: Some(Bytes::from_static(b"QUEUED")),
            must_succeed: false,
            during_init: false,
            queue_jump: false,
            state: self.state,
            sink: ResultSink::QueuedAck(item.clone()),
        };
        (item, queued)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.command))?;
        match self.db {
            Some(db) => write!(f, " (db {})", db),
            None => Ok(()),
        }
    }
}

/// The caller's half of a request: a future resolving to the typed reply,
/// plus the handle that can cancel the message while it is still unsent.
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
    state: Arc<AtomicU8>,
}

impl<T> Completion<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>, state: Arc<AtomicU8>) -> Completion<T> {
        Completion { rx, state }
    }

    /// Cancel the message if it has not been written yet. Sent messages
    /// cannot be cancelled: their reply still consumes a pipeline slot.
    /// Returns whether the cancellation took effect.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                MessageState::NotSent as u8,
                MessageState::Cancelled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn state(&self) -> MessageState {
        MessageState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| {
                Err(Error::Shutdown(
                    "the connection was dropped before the reply arrived".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        let msg = Message::new(Some(0), "PING", Vec::new());
        assert_eq!(msg.state(), MessageState::NotSent);

        assert!(msg.try_mark_sent());
        assert_eq!(msg.state(), MessageState::Sent);

        // A sent message can no longer be claimed or cancelled.
        assert!(!msg.try_mark_sent());
        assert!(!msg.advance(MessageState::NotSent, MessageState::Cancelled));
    }

    #[test]
    fn cancelled_message_cannot_be_sent() {
        let msg = Message::new(Some(0), "PING", Vec::new());
        assert!(msg.advance(MessageState::NotSent, MessageState::Cancelled));
        assert!(!msg.try_mark_sent());
    }

    #[tokio::test]
    async fn completion_cancel_applies_only_before_send() {
        let (tx, rx) = oneshot::channel::<Result<i64>>();
        let msg = Message::new(Some(0), "INCR", vec![Bytes::from_static(b"k")])
            .with_sink(ResultSink::Integer(tx));
        let completion = Completion::new(rx, msg.state_handle());

        assert!(completion.cancel());
        assert!(!completion.cancel());
        assert!(!msg.try_mark_sent());

        msg.complete(Reply::Cancelled);
        assert!(matches!(completion.await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn dropping_the_sink_fails_the_future_as_shutdown() {
        let (tx, rx) = oneshot::channel::<Result<i64>>();
        let msg = Message::new(None, "GET", vec![Bytes::from_static(b"k")])
            .with_sink(ResultSink::Integer(tx));
        let completion = Completion::new(rx, msg.state_handle());

        drop(msg);
        assert!(matches!(completion.await, Err(Error::Shutdown(_))));
    }

    #[test]
    fn select_invalidating_commands() {
        assert!(Message::new(None, "EXEC", Vec::new()).invalidates_db());
        assert!(Message::new(None, "eval", Vec::new()).invalidates_db());
        assert!(!Message::new(None, "GET", Vec::new()).invalidates_db());
    }

    #[test]
    fn encodes_as_multi_bulk() {
        let msg = Message::new(Some(3), "GET", vec![Bytes::from_static(b"k")]);
        let mut dst = BytesMut::new();
        msg.write_to(&mut dst);
        assert_eq!(&dst[..], b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
    }
}
