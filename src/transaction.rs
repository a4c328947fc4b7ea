use std::sync::atomic::AtomicU8;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::message::{Completion, Message, MessageState};
use crate::reply::Reply;
use crate::sink::ResultSink;
use crate::{Error, Result};

impl Connection {
    /// Start a transaction. The transaction shares this connection's
    /// socket; nothing touches the wire until [`Transaction::execute`].
    pub fn transaction(self: &Arc<Connection>) -> Transaction {
        Transaction {
            parent: Arc::clone(self),
            buffered: Mutex::new(Vec::new()),
            conditions: Mutex::new(Vec::new()),
        }
    }
}

/// An optimistic-concurrency precondition: `WATCH key` paired with an
/// existence probe. A condition that does not hold downgrades the
/// composite's final command from `EXEC` to `DISCARD`; a watched key
/// changing between the probe and `EXEC` aborts server-side instead.
pub struct Condition {
    key: Bytes,
    expect_exists: bool,
}

impl Condition {
    pub fn key_exists(key: impl Into<Bytes>) -> Condition {
        Condition {
            key: key.into(),
            expect_exists: true,
        }
    }

    pub fn key_not_exists(key: impl Into<Bytes>) -> Condition {
        Condition {
            key: key.into(),
            expect_exists: false,
        }
    }
}

struct PendingCondition {
    condition: Condition,
    verdict: oneshot::Sender<Result<bool>>,
}

/// A batch of commands executed as one atomic `MULTI`/`EXEC` exchange.
///
/// Enqueueing buffers; nothing reaches the server until `execute`, which
/// emits the whole composite under the parent's write lock and fans the
/// reply array back out to the buffered completions. Dropping an
/// unexecuted transaction cancels everything in it.
pub struct Transaction {
    parent: Arc<Connection>,
    buffered: Mutex<Vec<Message>>,
    conditions: Mutex<Vec<PendingCondition>>,
}

impl Transaction {
    /// Transactions cannot nest: the composite owns the wire from
    /// `MULTI` to `EXEC`.
    pub fn transaction(&self) -> Result<Transaction> {
        Err(Error::Lifecycle(
            "nested transactions are not supported".to_string(),
        ))
    }

    /// Add a precondition checked before the final `EXEC`/`DISCARD`
    /// decision. The completion resolves to whether the condition held.
    pub fn check(&self, condition: Condition) -> Completion<bool> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(
            rx,
            Arc::new(AtomicU8::new(MessageState::NotSent as u8)),
        );
        self.conditions
            .lock()
            .expect("condition buffer lock poisoned")
            .push(PendingCondition {
                condition,
                verdict: tx,
            });
        completion
    }

    /// Buffer a message expecting an `OK`-style acknowledgement.
    pub fn execute_ok(&self, msg: Message) -> Completion<()> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.buffer(msg.with_sink(ResultSink::Ok(tx)));
        completion
    }

    pub fn execute_status(&self, msg: Message) -> Completion<String> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.buffer(msg.with_sink(ResultSink::Status(tx)));
        completion
    }

    pub fn execute_boolean(&self, msg: Message) -> Completion<bool> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.buffer(msg.with_sink(ResultSink::Boolean(tx)));
        completion
    }

    pub fn execute_integer(&self, msg: Message) -> Completion<i64> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.buffer(msg.with_sink(ResultSink::Integer(tx)));
        completion
    }

    pub fn execute_bytes(&self, msg: Message) -> Completion<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.buffer(msg.with_sink(ResultSink::Bytes(tx)));
        completion
    }

    pub fn execute_raw(&self, msg: Message) -> Completion<Reply> {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(rx, msg.state_handle());
        self.buffer(msg.with_sink(ResultSink::Raw(tx)));
        completion
    }

    fn buffer(&self, msg: Message) {
        self.buffered
            .lock()
            .expect("transaction buffer lock poisoned")
            .push(msg);
    }

    /// Abandon the transaction: every buffered message completes as
    /// cancelled and nothing is written.
    pub fn discard(self) {
        self.cancel_all();
    }

    fn cancel_all(&self) {
        let buffered: Vec<Message> = {
            let mut buffered = self
                .buffered
                .lock()
                .expect("transaction buffer lock poisoned");
            buffered.drain(..).collect()
        };
        for msg in buffered {
            self.parent.counters().record_cancelled();
            msg.complete(Reply::Cancelled);
        }

        let conditions: Vec<PendingCondition> = {
            let mut conditions = self
                .conditions
                .lock()
                .expect("condition buffer lock poisoned");
            conditions.drain(..).collect()
        };
        for pending in conditions {
            let _ = pending.verdict.send(Err(Error::Cancelled));
        }
    }

    /// Emit the composite exchange and resolve to whether the server
    /// committed it: `true` after an `EXEC` array, `false` after an
    /// abort (failed precondition or changed watched key).
    pub async fn execute(self) -> Completion<bool> {
        let (done, done_rx) = oneshot::channel();
        let completion = Completion::new(
            done_rx,
            Arc::new(AtomicU8::new(MessageState::NotSent as u8)),
        );

        let buffered: Vec<Message> = {
            let mut buffered = self
                .buffered
                .lock()
                .expect("transaction buffer lock poisoned");
            buffered.drain(..).collect()
        };
        let conditions: Vec<PendingCondition> = {
            let mut conditions = self
                .conditions
                .lock()
                .expect("condition buffer lock poisoned");
            conditions.drain(..).collect()
        };

        if buffered.is_empty() && conditions.is_empty() {
            let _ = done.send(Ok(true));
            return completion;
        }

        let conn = Arc::clone(&self.parent);
        let mut guard = conn.lock_writer().await;
        let Some(writer) = guard.as_mut() else {
            for msg in buffered {
                msg.fail(Error::Shutdown("the connection is closed".to_string()));
            }
            for pending in conditions {
                let _ = pending
                    .verdict
                    .send(Err(Error::Shutdown("the connection is closed".to_string())));
            }
            let _ = done.send(Err(Error::Shutdown(
                "the connection is closed".to_string(),
            )));
            return completion;
        };

        // 1. WATCH plus an existence probe per precondition. The probe
        // replies are awaited before the EXEC/DISCARD decision below.
        let mut pending_probes = Vec::with_capacity(conditions.len());
        for pending in conditions {
            let watch = Message::new(None, "WATCH", vec![pending.condition.key.clone()])
                .expecting(b"OK")
                .must_succeed()
                .with_sink(ResultSink::Discard);
            conn.write_message(writer, watch);

            let (probe_tx, probe_rx) = oneshot::channel();
            let probe = Message::new(None, "EXISTS", vec![pending.condition.key.clone()])
                .with_sink(ResultSink::Boolean(probe_tx));
            conn.write_message(writer, probe);

            pending_probes.push((pending, probe_rx));
        }

        // 2. MULTI.
        let multi = Message::new(None, "MULTI", Vec::new())
            .expecting(b"OK")
            .must_succeed()
            .with_sink(ResultSink::Discard);
        conn.write_message(writer, multi);

        // 3. The buffered messages, each answered with a provisional
        // QUEUED. Database reconciliation happens inside the block, so a
        // synthetic SELECT is wrapped like any other member and its EXEC
        // slot discarded during the fan-out.
        let mut items = Vec::with_capacity(buffered.len());
        for msg in buffered {
            if !msg.try_mark_sent() {
                conn.counters().record_cancelled();
                msg.complete(Reply::Cancelled);
                continue;
            }

            if let Some(db) = msg.db() {
                if writer.current_db != i32::from(db) {
                    let (item, select) = Message::select(db).into_queued();
                    select.try_mark_sent();
                    select.write_to(&mut writer.buffer);
                    conn.counters().record_sent(None);
                    conn.push_sent(select);
                    items.push(item);
                    writer.current_db = i32::from(db);
                }
            }

            let (item, queued) = msg.into_queued();
            let invalidates = queued.invalidates_db();
            queued.write_to(&mut writer.buffer);
            conn.counters().record_sent(queued.db());
            conn.push_sent(queued);
            items.push(item);
            if invalidates {
                writer.current_db = -1;
            }
        }

        // Let the replies flow so the probes can resolve.
        if let Err(err) = writer.flush(true).await {
            drop(guard);
            let _ = done.send(Err(Error::Shutdown(format!(
                "error writing to the server: {}",
                err
            ))));
            conn.handle_write_error(err).await;
            return completion;
        }

        // 4. Await the precondition verdicts, then EXEC or DISCARD.
        let mut all_hold = true;
        let timeout = conn.config().sync_timeout;
        for (pending, probe_rx) in pending_probes {
            let verdict: Result<bool> = match tokio::time::timeout(timeout, probe_rx).await {
                Ok(Ok(Ok(exists))) => Ok(exists == pending.condition.expect_exists),
                Ok(Ok(Err(err))) => Err(err),
                Ok(Err(_)) => Err(Error::Shutdown(
                    "the connection closed before the precondition resolved".to_string(),
                )),
                Err(_) => {
                    conn.counters().record_timeout();
                    Err(Error::Timeout(String::new()))
                }
            };

            match verdict {
                Ok(true) => {
                    let _ = pending.verdict.send(Ok(true));
                }
                Ok(false) => {
                    all_hold = false;
                    let _ = pending.verdict.send(Ok(false));
                }
                Err(err) => {
                    all_hold = false;
                    let _ = pending.verdict.send(Err(err));
                }
            }
        }

        if all_hold {
            let exec = Message::new(None, "EXEC", Vec::new())
                .with_sink(ResultSink::Exec { items, done });
            conn.write_message(writer, exec);
        } else {
            debug!("precondition failed; discarding transaction");
            let discard = Message::new(None, "DISCARD", Vec::new())
                .expecting(b"OK")
                .with_sink(ResultSink::Discard);
            conn.write_message(writer, discard);
            for item in &items {
                item.complete(Reply::Cancelled);
            }
            let _ = done.send(Ok(false));
        }

        if let Err(err) = writer.flush(true).await {
            drop(guard);
            conn.handle_write_error(err).await;
        }

        completion
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An unexecuted transaction behaves like discard(): nothing was
        // written, so everything buffered completes as cancelled.
        self.cancel_all();
    }
}
