use std::io;

use bytes::BytesMut;
use mrpc_proto::{DecodeError, Message, SerializedMessage};
use tokio_util::codec::{Decoder, Encoder};

/// Frames the byte stream into messages on the read side and writes
/// pre-serialized messages verbatim on the write side.
pub(crate) struct RpcCodec {
    read_buffer_size: usize,
}

impl RpcCodec {
    pub(crate) fn new(read_buffer_size: usize) -> Self {
        Self { read_buffer_size }
    }
}

impl Decoder for RpcCodec {
    type Item = Message;

    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Message::decode_from(src) {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                // Governs how much the next underlying read may request.
                src.reserve(self.read_buffer_size);
                Ok(None)
            }
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

impl Encoder<SerializedMessage> for RpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: SerializedMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

/// Whether a read-side failure was a protocol violation rather than a
/// transport failure.
pub(crate) fn is_parse_error(error: &io::Error) -> bool {
    error
        .get_ref()
        .is_some_and(|inner| inner.is::<DecodeError>())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use futures_util::StreamExt as _;
    use mrpc_proto::{IntoParams as _, MessageId};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio_util::codec::FramedRead;

    struct MockAsyncReader {
        raw: Vec<u8>,
    }

    impl AsyncRead for MockAsyncReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if buf.remaining() > 0 {
                let amount = std::cmp::min(buf.remaining(), self.raw.len());
                buf.put_slice(&self.raw[0..amount]);
                self.raw.drain(0..amount);
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }

    #[tokio::test]
    async fn decodes_framed_stream() {
        let first = Message::request(MessageId::from(1), "add", (2, 3).into_params().unwrap());
        let second = Message::notification("log", ("msg",).into_params().unwrap());

        let mut raw = first.serialize().unwrap().as_bytes().to_vec();
        raw.extend_from_slice(second.serialize().unwrap().as_bytes());

        let reader = MockAsyncReader { raw };
        let mut framed = FramedRead::new(reader, RpcCodec::new(4096));

        assert_eq!(framed.next().await.unwrap().unwrap(), first);
        assert_eq!(framed.next().await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn malformed_stream_is_a_parse_error() {
        // [3, "a", []] carries an unknown tag
        let reader = MockAsyncReader {
            raw: vec![0x93, 0x03, 0xa1, 0x61, 0x90],
        };
        let mut framed = FramedRead::new(reader, RpcCodec::new(4096));

        let error = framed.next().await.unwrap().unwrap_err();
        assert!(is_parse_error(&error));
    }
}
