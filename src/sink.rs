use std::str;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot::Sender;

use crate::reply::Reply;
use crate::{Error, Result};

/// Converts one reply into the typed value its caller asked for and
/// completes exactly one future. There is one variant per reply shape;
/// the matcher picks the decoder by tag.
///
/// An `Error` reply completes any sink with [`Error::Server`] carrying the
/// server's text; `Cancelled` completes with [`Error::Cancelled`].
pub enum ResultSink {
    /// No caller is listening. Used for synthetic writes such as the
    /// injected `SELECT`.
    Discard,
    /// Expects `Pass` (the expected literal matched) or a status reply.
    Ok(Sender<Result<()>>),
    /// The raw status text.
    Status(Sender<Result<String>>),
    Boolean(Sender<Result<bool>>),
    Integer(Sender<Result<i64>>),
    NullableInteger(Sender<Result<Option<i64>>>),
    Double(Sender<Result<f64>>),
    NullableDouble(Sender<Result<Option<f64>>>),
    Bytes(Sender<Result<Option<Bytes>>>),
    String(Sender<Result<Option<String>>>),
    BytesArray(Sender<Result<Vec<Option<Bytes>>>>),
    StringArray(Sender<Result<Vec<Option<String>>>>),
    /// Alternating member/score pairs, e.g. sorted-set range replies.
    ScorePairs(Sender<Result<Vec<(Bytes, f64)>>>),
    /// Alternating field/value pairs, e.g. hash getall replies.
    FieldPairs(Sender<Result<Vec<(Bytes, Bytes)>>>),
    /// The undecoded reply.
    Raw(Sender<Result<Reply>>),
    /// A transaction member's provisional `QUEUED` acknowledgement. `Pass`
    /// keeps the item alive for the `EXEC` demultiplex; anything else
    /// fails the item immediately.
    QueuedAck(Arc<TxItem>),
    /// The `EXEC` reply: an array fanned out element-wise to the buffered
    /// items, or nil when the transaction aborted.
    Exec {
        items: Vec<Arc<TxItem>>,
        done: Sender<Result<bool>>,
    },
}

impl ResultSink {
    pub(crate) fn complete(self, reply: Reply) {
        // Server errors and cancellations fail every sink kind the same
        // way, except the transaction sinks which fan the failure out.
        let fans_out = matches!(
            self,
            ResultSink::QueuedAck(_) | ResultSink::Exec { .. } | ResultSink::Discard
        );
        if !fans_out {
            match reply {
                Reply::Error(text) => return self.fail(Error::Server(text)),
                Reply::Cancelled => return self.fail(Error::Cancelled),
                reply => return self.complete_value(reply),
            }
        }

        self.complete_value(reply)
    }

    fn complete_value(self, reply: Reply) {
        match self {
            ResultSink::Discard => {}
            ResultSink::Ok(tx) => {
                let _ = tx.send(expect_ack(reply));
            }
            ResultSink::Status(tx) => {
                let _ = tx.send(decode_status(reply));
            }
            ResultSink::Boolean(tx) => {
                let _ = tx.send(decode_boolean(reply));
            }
            ResultSink::Integer(tx) => {
                let _ = tx.send(decode_integer(reply));
            }
            ResultSink::NullableInteger(tx) => {
                let _ = tx.send(decode_nullable_integer(reply));
            }
            ResultSink::Double(tx) => {
                let _ = tx.send(decode_double(reply));
            }
            ResultSink::NullableDouble(tx) => {
                let _ = tx.send(decode_nullable_double(reply));
            }
            ResultSink::Bytes(tx) => {
                let _ = tx.send(decode_bytes(reply));
            }
            ResultSink::String(tx) => {
                let _ = tx.send(decode_string(reply));
            }
            ResultSink::BytesArray(tx) => {
                let _ = tx.send(decode_array(reply, element_bytes));
            }
            ResultSink::StringArray(tx) => {
                let _ = tx.send(decode_array(reply, element_string));
            }
            ResultSink::ScorePairs(tx) => {
                let _ = tx.send(decode_pairs(reply, |field, value| {
                    Ok((field, parse_f64(&value)?))
                }));
            }
            ResultSink::FieldPairs(tx) => {
                let _ = tx.send(decode_pairs(reply, |field, value| Ok((field, value))));
            }
            ResultSink::Raw(tx) => {
                let _ = tx.send(Ok(reply));
            }
            ResultSink::QueuedAck(item) => match reply {
                // The real completion arrives with the EXEC reply.
                Reply::Pass => {}
                Reply::Error(text) => item.complete(Reply::Error(text)),
                Reply::Cancelled => item.complete(Reply::Cancelled),
                other => item.complete_error(Error::Protocol(format!(
                    "expected QUEUED acknowledgement, got {}",
                    other.kind()
                ))),
            },
            ResultSink::Exec { items, done } => match reply {
                Reply::Array(Some(elements)) => {
                    if elements.len() != items.len() {
                        let error = format!(
                            "EXEC returned {} replies for {} queued commands",
                            elements.len(),
                            items.len()
                        );
                        for item in &items {
                            item.complete_error(Error::Protocol(error.clone()));
                        }
                        let _ = done.send(Err(Error::Protocol(error)));
                        return;
                    }
                    for (item, element) in items.iter().zip(elements) {
                        item.complete(element);
                    }
                    let _ = done.send(Ok(true));
                }
                // A nil reply means a watched key changed and the server
                // aborted the transaction.
                Reply::Array(None) | Reply::Bulk(None) => {
                    for item in &items {
                        item.complete(Reply::Cancelled);
                    }
                    let _ = done.send(Ok(false));
                }
                Reply::Error(text) => {
                    for item in &items {
                        item.complete(Reply::Error(text.clone()));
                    }
                    let _ = done.send(Err(Error::Server(text)));
                }
                Reply::Cancelled => {
                    for item in &items {
                        item.complete(Reply::Cancelled);
                    }
                    let _ = done.send(Err(Error::Cancelled));
                }
                other => {
                    let error = format!("expected array or nil from EXEC, got {}", other.kind());
                    for item in &items {
                        item.complete_error(Error::Protocol(error.clone()));
                    }
                    let _ = done.send(Err(Error::Protocol(error)));
                }
            },
        }
    }

    /// Complete the sink with a failure without decoding anything.
    pub(crate) fn fail(self, error: Error) {
        // Send failures mean the caller dropped its completion handle,
        // which is legal at any time.
        match self {
            ResultSink::Discard => {}
            ResultSink::Ok(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::Status(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::Boolean(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::Integer(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::NullableInteger(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::Double(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::NullableDouble(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::Bytes(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::String(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::BytesArray(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::StringArray(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::ScorePairs(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::FieldPairs(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::Raw(tx) => {
                let _ = tx.send(Err(error));
            }
            ResultSink::QueuedAck(item) => item.complete_error(error),
            ResultSink::Exec { items, done } => {
                let text = error.to_string();
                for item in &items {
                    item.complete_error(Error::Shutdown(text.clone()));
                }
                let _ = done.send(Err(error));
            }
        }
    }
}

/// One buffered transaction member. Its sink may be consumed by either
/// the `QUEUED` acknowledgement (on failure) or the `EXEC` demultiplex,
/// whichever fires first; the slot guarantees exactly-once completion.
pub struct TxItem {
    sink: Mutex<Option<ResultSink>>,
}

impl TxItem {
    pub(crate) fn new(sink: ResultSink) -> Self {
        TxItem {
            sink: Mutex::new(Some(sink)),
        }
    }

    pub(crate) fn complete(&self, reply: Reply) {
        if let Some(sink) = self.take() {
            sink.complete(reply);
        }
    }

    pub(crate) fn complete_error(&self, error: Error) {
        if let Some(sink) = self.take() {
            sink.fail(error);
        }
    }

    fn take(&self) -> Option<ResultSink> {
        self.sink
            .lock()
            .expect("transaction item sink lock poisoned")
            .take()
    }
}

fn unexpected(expected: &str, reply: &Reply) -> Error {
    Error::Protocol(format!("expected {}, got {} reply", expected, reply.kind()))
}

fn expect_ack(reply: Reply) -> Result<()> {
    match reply {
        Reply::Pass | Reply::Status(_) => Ok(()),
        other => Err(unexpected("acknowledgement", &other)),
    }
}

fn decode_status(reply: Reply) -> Result<String> {
    match reply {
        Reply::Status(s) => Ok(String::from_utf8_lossy(&s).into_owned()),
        other => Err(unexpected("status", &other)),
    }
}

fn decode_boolean(reply: Reply) -> Result<bool> {
    match reply {
        Reply::Integer(0) => Ok(false),
        Reply::Integer(1) => Ok(true),
        Reply::Pass => Ok(true),
        other => Err(unexpected("boolean integer", &other)),
    }
}

fn decode_integer(reply: Reply) -> Result<i64> {
    match reply {
        Reply::Integer(value) => Ok(value),
        Reply::Bulk(Some(data)) => parse_i64(&data),
        other => Err(unexpected("integer", &other)),
    }
}

fn decode_nullable_integer(reply: Reply) -> Result<Option<i64>> {
    match reply {
        Reply::Bulk(None) => Ok(None),
        other => decode_integer(other).map(Some),
    }
}

fn decode_double(reply: Reply) -> Result<f64> {
    match reply {
        Reply::Integer(value) => Ok(value as f64),
        Reply::Bulk(Some(data)) => parse_f64(&data),
        other => Err(unexpected("double", &other)),
    }
}

fn decode_nullable_double(reply: Reply) -> Result<Option<f64>> {
    match reply {
        Reply::Bulk(None) => Ok(None),
        other => decode_double(other).map(Some),
    }
}

fn decode_bytes(reply: Reply) -> Result<Option<Bytes>> {
    match reply {
        Reply::Bulk(data) => Ok(data),
        Reply::Status(s) => Ok(Some(s)),
        other => Err(unexpected("bulk", &other)),
    }
}

fn decode_string(reply: Reply) -> Result<Option<String>> {
    match decode_bytes(reply)? {
        Some(data) => {
            let text = str::from_utf8(&data)
                .map_err(|_| Error::Protocol("bulk payload is not valid UTF-8".to_string()))?;
            Ok(Some(text.to_string()))
        }
        None => Ok(None),
    }
}

fn decode_array<T>(reply: Reply, element: fn(Reply) -> Result<T>) -> Result<Vec<T>> {
    let elements = match reply {
        Reply::Array(Some(elements)) => elements,
        Reply::Array(None) => Vec::new(),
        other => return Err(unexpected("array", &other)),
    };

    elements.into_iter().map(element).collect()
}

fn decode_pairs<T>(reply: Reply, pair: impl Fn(Bytes, Bytes) -> Result<T>) -> Result<Vec<T>> {
    let elements = match reply {
        Reply::Array(Some(elements)) => elements,
        Reply::Array(None) => Vec::new(),
        other => return Err(unexpected("array", &other)),
    };

    if elements.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "pair reply has odd length {}",
            elements.len()
        )));
    }

    let mut pairs = Vec::with_capacity(elements.len() / 2);
    let mut iter = elements.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let field = element_bytes(field)?
            .ok_or_else(|| Error::Protocol("unexpected nil field in pair reply".to_string()))?;
        let value = element_bytes(value)?
            .ok_or_else(|| Error::Protocol("unexpected nil value in pair reply".to_string()))?;
        pairs.push(pair(field, value)?);
    }

    Ok(pairs)
}

fn element_bytes(reply: Reply) -> Result<Option<Bytes>> {
    decode_bytes(reply)
}

fn element_string(reply: Reply) -> Result<Option<String>> {
    decode_string(reply)
}

fn parse_i64(data: &[u8]) -> Result<i64> {
    str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "cannot decode {:?} as an integer",
                String::from_utf8_lossy(data)
            ))
        })
}

fn parse_f64(data: &[u8]) -> Result<f64> {
    str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "cannot decode {:?} as a double",
                String::from_utf8_lossy(data)
            ))
        })
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn boolean_from_integers() {
        assert!(!decode_boolean(Reply::Integer(0)).unwrap());
        assert!(decode_boolean(Reply::Integer(1)).unwrap());
        assert!(decode_boolean(Reply::Integer(2)).is_err());
    }

    #[test]
    fn nullable_sinks_map_nil_to_absent() {
        assert_eq!(decode_nullable_integer(Reply::Bulk(None)).unwrap(), None);
        assert_eq!(decode_nullable_double(Reply::Bulk(None)).unwrap(), None);
        assert_eq!(decode_bytes(Reply::Bulk(None)).unwrap(), None);
        assert_eq!(decode_string(Reply::Bulk(None)).unwrap(), None);
    }

    #[test]
    fn bulk_decodes() {
        assert_eq!(
            decode_nullable_integer(Reply::Bulk(Some(Bytes::from_static(b"42")))).unwrap(),
            Some(42)
        );
        assert_eq!(
            decode_double(Reply::Bulk(Some(Bytes::from_static(b"1.5")))).unwrap(),
            1.5
        );
        assert!(decode_string(Reply::Bulk(Some(Bytes::from_static(b"\xff\xfe")))).is_err());
    }

    #[test]
    fn array_sinks_reject_non_arrays() {
        assert!(decode_array(Reply::Integer(3), element_bytes).is_err());
        assert!(decode_pairs(Reply::Bulk(None), |f, v| Ok((f, v))).is_err());
    }

    #[test]
    fn pair_decoder_rejects_odd_length() {
        let reply = Reply::Array(Some(vec![
            Reply::Bulk(Some(Bytes::from_static(b"member"))),
            Reply::Bulk(Some(Bytes::from_static(b"1.0"))),
            Reply::Bulk(Some(Bytes::from_static(b"dangling"))),
        ]));
        assert!(decode_pairs(reply, |field, value| Ok((field, value))).is_err());
    }

    #[test]
    fn score_pairs_decode() {
        let reply = Reply::Array(Some(vec![
            Reply::Bulk(Some(Bytes::from_static(b"a"))),
            Reply::Bulk(Some(Bytes::from_static(b"1.5"))),
            Reply::Bulk(Some(Bytes::from_static(b"b"))),
            Reply::Bulk(Some(Bytes::from_static(b"-2"))),
        ]));
        let pairs = decode_pairs(reply, |field, value| Ok((field, parse_f64(&value)?))).unwrap();
        assert_eq!(
            pairs,
            vec![
                (Bytes::from_static(b"a"), 1.5),
                (Bytes::from_static(b"b"), -2.0),
            ]
        );
    }

    #[tokio::test]
    async fn error_reply_fails_the_future() {
        let (tx, rx) = oneshot::channel();
        ResultSink::Integer(tx).complete(Reply::Error("ERR nope".to_string()));

        match rx.await.unwrap() {
            Err(Error::Server(text)) => assert_eq!(text, "ERR nope"),
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_reply_fails_with_cancellation() {
        let (tx, rx) = oneshot::channel();
        ResultSink::Bytes(tx).complete(Reply::Cancelled);

        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn exec_array_fans_out_to_items() {
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let (tx_done, rx_done) = oneshot::channel();

        let items = vec![
            Arc::new(TxItem::new(ResultSink::Ok(tx_a))),
            Arc::new(TxItem::new(ResultSink::Integer(tx_b))),
        ];

        ResultSink::Exec {
            items,
            done: tx_done,
        }
        .complete(Reply::Array(Some(vec![
            Reply::Status(Bytes::from_static(b"OK")),
            Reply::Integer(2),
        ])));

        assert!(rx_a.await.unwrap().is_ok());
        assert_eq!(rx_b.await.unwrap().unwrap(), 2);
        assert!(rx_done.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn exec_nil_cancels_items() {
        let (tx, rx) = oneshot::channel();
        let (tx_done, rx_done) = oneshot::channel();

        let items = vec![Arc::new(TxItem::new(ResultSink::Integer(tx)))];

        ResultSink::Exec {
            items,
            done: tx_done,
        }
        .complete(Reply::Bulk(None));

        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled)));
        assert!(!rx_done.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn queued_ack_failure_consumes_the_item_once() {
        let (tx, rx) = oneshot::channel::<Result<i64>>();
        let item = Arc::new(TxItem::new(ResultSink::Integer(tx)));

        ResultSink::QueuedAck(item.clone()).complete(Reply::Error("ERR bad command".to_string()));
        // The EXEC demultiplex later touching the same item is a no-op.
        item.complete(Reply::Integer(9));

        match rx.await.unwrap() {
            Err(Error::Server(text)) => assert_eq!(text, "ERR bad command"),
            other => panic!("unexpected completion: {:?}", other),
        }
    }
}
