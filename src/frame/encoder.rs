//! Frame encoder.

use bytes::{BufMut, BytesMut};

use super::{AMQP_FRAME_TYPE, FRAME_HEADER_SIZE, Frame, FrameBody, HEARTBEAT, SASL_FRAME_TYPE};
use crate::codec::AmqpEncode;
use crate::error::{EncodeError, Result};
use crate::types::Performative;

/// Data offset of frames without an extended header, in words.
const DOFF: u8 = 2;

/// Writes frames no larger than the peer's max-frame-size.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl FrameEncoder {
    /// Encoder limited to `max_frame_size` bytes per frame.
    #[must_use]
    pub const fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// Outbound frame limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Change the outbound frame limit once the peer's open is known.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Append `frame` to `out`, returning the encoded size.
    ///
    /// The size field is written as a placeholder and back-patched. A frame
    /// over the limit leaves `out` unchanged.
    pub fn encode(&self, frame: &Frame, out: &mut BytesMut) -> Result<usize> {
        let start = out.len();
        let frame_type = match frame.body {
            FrameBody::Amqp(_) => AMQP_FRAME_TYPE,
            FrameBody::Sasl(_) => SASL_FRAME_TYPE,
        };
        out.put_u32(0);
        out.put_u8(DOFF);
        out.put_u8(frame_type);
        out.put_u16(frame.channel);

        let written = match &frame.body {
            FrameBody::Amqp(performative) => performative.encode_to(out),
            FrameBody::Sasl(sasl) => sasl.encode_to(out),
        };
        if let Err(err) = written {
            out.truncate(start);
            return Err(err.into());
        }
        if let Some(payload) = &frame.payload {
            out.put_slice(payload);
        }

        let size = out.len() - start;
        let fits = u32::try_from(size).is_ok_and(|size| size <= self.max_frame_size);
        if !fits {
            out.truncate(start);
            return Err(EncodeError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }
        out[start..start + 4].copy_from_slice(&(size as u32).to_be_bytes());
        Ok(size)
    }

    /// Append an empty keep-alive frame.
    pub fn encode_heartbeat(out: &mut BytesMut) {
        out.put_slice(&HEARTBEAT);
    }

    /// Payload bytes that fit in one frame after `performative`.
    pub fn payload_capacity(&self, performative: &Performative) -> Result<usize> {
        let mut scratch = BytesMut::new();
        performative.encode_to(&mut scratch)?;
        let overhead = FRAME_HEADER_SIZE + scratch.len();
        Ok((self.max_frame_size as usize).saturating_sub(overhead))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::error::Error;
    use crate::types::{Close, Transfer};

    #[test]
    fn size_is_back_patched() {
        let mut out = BytesMut::new();
        let size = FrameEncoder::default()
            .encode(&Frame::amqp(3, Close::default()), &mut out)
            .unwrap();
        assert_eq!(size, out.len());
        assert_eq!(&out[..8], &[0, 0, 0, size as u8, 2, 0, 0, 3]);
    }

    #[test]
    fn oversized_frame_is_rejected_and_not_written() {
        let encoder = FrameEncoder::new(512);
        let frame = Frame::with_payload(
            0,
            Transfer::default(),
            Bytes::from(vec![0u8; 600]),
        );
        let mut out = BytesMut::from(&b"keep"[..]);
        let err = encoder.encode(&frame, &mut out).unwrap_err();
        assert!(matches!(
            err,
            Error::Encode(EncodeError::FrameTooLarge { max: 512, .. })
        ));
        assert_eq!(&out[..], b"keep");
    }

    #[test]
    fn payload_capacity_accounts_for_performative() {
        let encoder = FrameEncoder::new(512);
        let transfer = Performative::Transfer(Transfer::default());
        let capacity = encoder.payload_capacity(&transfer).unwrap();
        let frame = Frame::with_payload(0, Transfer::default(), Bytes::from(vec![1u8; capacity]));
        let mut out = BytesMut::new();
        assert_eq!(encoder.encode(&frame, &mut out).unwrap(), 512);
    }
}
