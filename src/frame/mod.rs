//! Frame transport codec
//!
//! # Frame Format
//!
//! ```text
//! [SIZE u32] [DOFF u8] [TYPE u8] [CHANNEL u16] [EXT HEADER] [PERFORMATIVE] [PAYLOAD]
//! ```
//!
//! `SIZE` counts the whole frame including itself. `DOFF` is the offset of
//! the body in 4-byte words and is at least 2. A frame with an empty body is
//! a heartbeat.

mod encoder;
mod header;
mod parser;

use bytes::Bytes;

use crate::types::{Performative, SaslPerformative};

pub use encoder::FrameEncoder;
pub use header::{HEADER_SIZE, ProtocolHeader};
pub use parser::{FrameParser, ParserStage, ReadEvent};

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Frame type code of AMQP frames.
pub const AMQP_FRAME_TYPE: u8 = 0x00;

/// Frame type code of SASL frames.
pub const SASL_FRAME_TYPE: u8 = 0x01;

/// An empty AMQP frame on channel 0.
pub const HEARTBEAT: [u8; FRAME_HEADER_SIZE] = [0, 0, 0, 8, 2, AMQP_FRAME_TYPE, 0, 0];

/// Decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// AMQP performative.
    Amqp(Performative),
    /// SASL frame.
    Sasl(SaslPerformative),
}

impl FrameBody {
    /// Name of the carried performative.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Amqp(performative) => performative.name(),
            Self::Sasl(sasl) => sasl.name(),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel number; always 0 for SASL frames.
    pub channel: u16,
    /// Performative.
    pub body: FrameBody,
    /// Bytes after the performative, for transfers.
    pub payload: Option<Bytes>,
}

impl Frame {
    /// AMQP frame without payload.
    pub fn amqp(channel: u16, performative: impl Into<Performative>) -> Self {
        Self {
            channel,
            body: FrameBody::Amqp(performative.into()),
            payload: None,
        }
    }

    /// AMQP frame carrying `payload` after the performative.
    pub fn with_payload(channel: u16, performative: impl Into<Performative>, payload: Bytes) -> Self {
        Self {
            channel,
            body: FrameBody::Amqp(performative.into()),
            payload: Some(payload),
        }
    }

    /// SASL frame.
    pub fn sasl(body: impl Into<SaslPerformative>) -> Self {
        Self {
            channel: 0,
            body: FrameBody::Sasl(body.into()),
            payload: None,
        }
    }

    /// Whether this frame carries SASL.
    #[must_use]
    pub const fn is_sasl(&self) -> bool {
        matches!(self.body, FrameBody::Sasl(_))
    }
}
