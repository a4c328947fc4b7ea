use std::convert::TryInto;
use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::reply::{ParseError, Reply};
use crate::Error;

/// Initial capacity of the read buffer. Replies whose fields fit this
/// window are sliced out of it directly; larger frames accumulate in the
/// same buffer across socket reads until they parse whole.
pub const READ_BUFFER_CAPACITY: usize = 4096;

pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let reply = match Reply::parse(&mut cursor) {
            Ok(reply) => reply,
            // Not enough data buffered to parse an entire reply.
            Err(ParseError::Incomplete) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let position: usize = cursor
            .position()
            .try_into()
            .expect("cursor position is too large");

        // Remove the parsed reply from the buffer.
        src.advance(position);

        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn decode_across_partial_fills() {
        let mut codec = ReplyCodec;
        let mut buffer = BytesMut::new();

        buffer.extend_from_slice(b"$5\r\nhel");
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"lo\r\n:7\r\n");
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Reply::Bulk(Some(Bytes::from_static(b"hello"))))
        );
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Reply::Integer(7)));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn decode_surfaces_malformed_frames() {
        let mut codec = ReplyCodec;
        let mut buffer = BytesMut::from(&b"?bogus\r\n"[..]);

        assert!(matches!(codec.decode(&mut buffer), Err(Error::Protocol(_))));
    }
}
