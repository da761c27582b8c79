//! Length-prefixed JSON framing for envelopes over TCP.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Envelope;

/// Combines LengthDelimitedCodec (frame boundaries) with serde_json (the
/// self-describing payload encoding).
pub struct EnvelopeCodec {
    framing: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::new(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.framing.encode(Bytes::from(bytes), dst)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing.decode(src)? {
            Some(frame) => {
                let item = serde_json::from_slice(&frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}
