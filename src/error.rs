//! Engine error types
//!
//! Every error is `Clone` so that a failure can be kept sticky by the frame
//! parser and by the engine and handed back on each later call.

use thiserror::Error;

use crate::types::conditions;

/// Malformed or short AMQP type encodings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes remain for the value being decoded.
    #[error("truncated encoding: need {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// Constructor byte does not name any AMQP encoding.
    #[error("unknown encoding code {0:#04x}")]
    UnknownEncoding(u8),

    /// Constructor is valid but not acceptable at this position.
    #[error("expected {expected}, found encoding code {found:#04x}")]
    UnexpectedEncoding {
        /// What the decoder was looking for.
        expected: &'static str,
        /// Constructor byte encountered.
        found: u8,
    },

    /// String payload is not valid UTF-8.
    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    /// Symbol payload contains non-ASCII bytes.
    #[error("invalid symbol: contains non-ASCII bytes")]
    InvalidSymbol,

    /// Char payload is not a Unicode scalar value.
    #[error("invalid char code point {0:#x}")]
    InvalidChar(u32),

    /// Described list carries fewer or more fields than its type allows.
    #[error("{type_name} has {count} fields, allowed {min}..={max}")]
    FieldCount {
        /// Described type being decoded.
        type_name: &'static str,
        /// Count found on the wire.
        count: usize,
        /// Minimum (mandatory) field count.
        min: usize,
        /// Maximum field count.
        max: usize,
    },

    /// Compound size claims more bytes than the stream holds.
    #[error("compound size {size} exceeds the {remaining} bytes remaining")]
    SizeExceedsStream {
        /// Declared size.
        size: usize,
        /// Bytes available.
        remaining: usize,
    },

    /// Compound count cannot possibly fit in its declared size.
    #[error("compound count {count} cannot fit in {size} bytes")]
    CountExceedsSize {
        /// Declared element count.
        count: usize,
        /// Declared byte size.
        size: usize,
    },

    /// A map compound carries an odd number of elements.
    #[error("map has an odd element count {0}")]
    OddMapCount(usize),

    /// Compound or described values nest deeper than the decoder accepts.
    #[error("values nested deeper than {max} levels")]
    NestingTooDeep {
        /// Deepest accepted nesting.
        max: usize,
    },

    /// Mandatory field encoded as null or absent.
    #[error("mandatory field {field} of {type_name} is missing")]
    MissingField {
        /// Described type being decoded.
        type_name: &'static str,
        /// Field name.
        field: &'static str,
    },

    /// Descriptor not present in the registry where a typed value is required.
    #[error("unknown descriptor {0}")]
    UnknownDescriptor(String),

    /// Field decoded but its value is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Values that cannot be represented on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Array elements do not share one constructor.
    #[error("array elements are not homogeneous: {first} vs {other}")]
    HeterogeneousArray {
        /// Type of the first element.
        first: &'static str,
        /// Type of the offending element.
        other: &'static str,
    },

    /// Variable-width value longer than a 32-bit length prefix allows.
    #[error("value of {0} bytes exceeds the 32-bit size limit")]
    ValueTooLarge(usize),

    /// Encoded frame exceeds the peer's max-frame-size.
    #[error("encoded frame of {size} bytes exceeds max frame size {max}")]
    FrameTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Negotiated limit.
        max: u32,
    },
}

/// Misuse of a [`crate::buffer::ProtonBuffer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Mutation attempted on a read-only buffer.
    #[error("buffer is read-only")]
    ReadOnly,

    /// Buffer handle was transferred or closed.
    #[error("buffer has been closed")]
    Closed,

    /// Growth would exceed the configured maximum capacity.
    #[error("capacity {requested} exceeds maximum {max}")]
    CapacityExceeded {
        /// Capacity that would be required.
        requested: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Offset moved backwards or past the allowed limit.
    #[error("offset {offset} out of bounds (limit {limit})")]
    OffsetOutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Permitted limit.
        limit: usize,
    },

    /// Read past the write offset.
    #[error("need {needed} readable bytes, {available} available")]
    Underflow {
        /// Bytes requested.
        needed: usize,
        /// Readable bytes.
        available: usize,
    },
}

/// SASL negotiation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaslError {
    /// None of the configured mechanisms were offered by the server.
    #[error("no matching SASL mechanism, server offered {offered:?}")]
    NoMatchingMechanism {
        /// Mechanisms the server advertised.
        offered: Vec<String>,
    },

    /// Outcome carried a non-ok code.
    #[error("SASL authentication failed with outcome code {code}")]
    AuthenticationFailed {
        /// SASL outcome code.
        code: u8,
    },

    /// Mechanism implementation rejected a step.
    #[error("SASL mechanism {mechanism} failed: {reason}")]
    Mechanism {
        /// Mechanism name.
        mechanism: String,
        /// Failure detail.
        reason: String,
    },

    /// SASL frame arrived in a stage that does not expect it.
    #[error("unexpected SASL frame {frame} in state {state}")]
    UnexpectedFrame {
        /// Frame name.
        frame: &'static str,
        /// Negotiation state name.
        state: &'static str,
    },
}

/// Synchronous API misuse; never changes engine state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// Operation not allowed in the endpoint's current state.
    #[error("{entity} cannot {operation} in state {state}")]
    InvalidState {
        /// Connection, session or link.
        entity: &'static str,
        /// Attempted operation.
        operation: &'static str,
        /// Current state name.
        state: &'static str,
    },

    /// Session id does not name a live session.
    #[error("unknown session on channel {0}")]
    UnknownSession(u16),

    /// Link id does not name a live link.
    #[error("unknown link handle {handle} on channel {channel}")]
    UnknownLink {
        /// Session channel.
        channel: u16,
        /// Local link handle.
        handle: u32,
    },

    /// Delivery id not tracked by the link.
    #[error("unknown delivery {0}")]
    UnknownDelivery(u32),

    /// Operation requires a sender link.
    #[error("link is not a sender")]
    NotSender,

    /// Operation requires a receiver link.
    #[error("link is not a receiver")]
    NotReceiver,

    /// A drain request is already outstanding on the link.
    #[error("a drain request is already outstanding")]
    DrainPending,

    /// Manual credit was requested on a link with a credit window.
    #[error("cannot add credit manually while a credit window of {0} is configured")]
    CreditWindowConfigured(u32),

    /// Sender has no credit for another delivery.
    #[error("sender has no link credit")]
    NoCredit,

    /// Link name already used in the session with the same role.
    #[error("link name {0} already in use")]
    DuplicateLinkName(String),

    /// No free channel below channel-max.
    #[error("no free channel below channel-max {0}")]
    ChannelsExhausted(u16),

    /// No free handle below handle-max.
    #[error("no free handle below handle-max {0}")]
    HandlesExhausted(u32),

    /// Delivery tags must be at most 32 bytes.
    #[error("delivery tag of {0} bytes exceeds 32 bytes")]
    DeliveryTagTooLong(usize),

    /// Pre-settled send on a link whose sender settle mode is unsettled.
    #[error("link only sends unsettled deliveries")]
    SettledSendNotAllowed,
}

/// Unified engine error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Type codec decode failure.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Type codec encode failure.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Buffer misuse.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Eight header bytes are not a recognised AMQP or SASL header.
    #[error("invalid protocol header {0:02x?}")]
    InvalidHeader([u8; 8]),

    /// Frame size below the 8-byte header size.
    #[error("frame size {size} is smaller than minimum frame size 8")]
    FrameTooSmall {
        /// Declared frame size.
        size: u32,
    },

    /// Frame size above the inbound maximum.
    #[error("frame size {size} exceeds maximum frame size {max}")]
    FrameTooLarge {
        /// Declared frame size.
        size: u32,
        /// Configured maximum.
        max: u32,
    },

    /// Data offset below 2 words or past the end of the frame.
    #[error("invalid data offset {doff} for frame size {size}")]
    InvalidDataOffset {
        /// Data offset in 4-byte words.
        doff: u8,
        /// Frame size.
        size: u32,
    },

    /// Frame type byte is neither AMQP nor SASL.
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    /// Performative sequencing or flow-control violation.
    #[error("protocol violation ({condition}): {description}")]
    Protocol {
        /// AMQP error condition symbol.
        condition: &'static str,
        /// Human readable detail.
        description: String,
    },

    /// SASL negotiation failure.
    #[error("SASL error: {0}")]
    Sasl(#[from] SaslError),

    /// API misuse.
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// I/O failure reported by the transport collaborator.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A pending operation missed its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Engine already failed; carries the original cause.
    #[error("engine failed: {0}")]
    EngineFailed(Box<Error>),
}

impl Error {
    /// Build a protocol violation with the given condition.
    pub fn protocol(condition: &'static str, description: impl Into<String>) -> Self {
        Self::Protocol {
            condition,
            description: description.into(),
        }
    }

    /// AMQP error condition reported to the peer when this error closes the connection.
    #[must_use]
    pub fn condition(&self) -> &'static str {
        match self {
            Self::Decode(_) => conditions::DECODE_ERROR,
            Self::InvalidHeader(_)
            | Self::FrameTooSmall { .. }
            | Self::FrameTooLarge { .. }
            | Self::InvalidDataOffset { .. }
            | Self::UnknownFrameType(_) => conditions::FRAMING_ERROR,
            Self::Protocol { condition, .. } => condition,
            Self::Sasl(_) => conditions::UNAUTHORIZED_ACCESS,
            Self::Timeout(_) => conditions::RESOURCE_LIMIT_EXCEEDED,
            Self::EngineFailed(inner) => inner.condition(),
            _ => conditions::INTERNAL_ERROR,
        }
    }

    /// Strip any `EngineFailed` wrapping and return the root cause.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::EngineFailed(inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
