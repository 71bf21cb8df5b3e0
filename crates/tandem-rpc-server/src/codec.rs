//! tokio-util codec over the [`Framer`]

use bytes::BytesMut;
use tandem_json_rpc::{Framer, Message};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Decodes back-to-back JSON-RPC documents and encodes messages as compact JSON
#[derive(Debug, Default)]
pub struct MessageCodec {
    framer: Framer,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete document still waiting for the rest of it
    pub fn buffered_len(&self) -> usize {
        self.framer.buffered_len()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if !src.is_empty() {
            self.framer.extend_from(src);
        }
        Ok(self.framer.next_message())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        let message = self.decode(src)?;
        if message.is_none() && self.framer.is_partial() {
            warn!(
                buffered = self.framer.buffered_len(),
                "Stream ended inside a JSON document"
            );
        }
        Ok(message)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}
