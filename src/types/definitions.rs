//! Restricted types and the `error` composite shared by all performatives.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::codec::{AmqpDecode, AmqpEncode, DescribedType, FieldReader, FieldWriter, Map, Symbol};
use crate::error::{DecodeError, EncodeError, Error};

/// Smallest max-frame-size a peer may advertise.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// `fields`: a symbol-keyed map of extension properties.
pub type Fields = Map;

/// Link role. Encoded as a boolean, `false` for sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sending end of a link.
    Sender,
    /// Receiving end of a link.
    Receiver,
}

impl Role {
    /// The opposite end.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }

    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
        }
    }
}

impl AmqpEncode for Role {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        matches!(self, Self::Receiver).encode_to(buf)
    }
}

impl AmqpDecode for Role {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(if bool::decode_with(code, buf)? {
            Self::Receiver
        } else {
            Self::Sender
        })
    }
}

/// Settlement policy of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled.
    Unsettled,
    /// Deliveries are sent settled.
    Settled,
    /// The sender chooses per delivery.
    #[default]
    Mixed,
}

impl SenderSettleMode {
    const fn code(self) -> u8 {
        match self {
            Self::Unsettled => 0,
            Self::Settled => 1,
            Self::Mixed => 2,
        }
    }
}

impl AmqpEncode for SenderSettleMode {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.code().encode_to(buf)
    }
}

impl AmqpDecode for SenderSettleMode {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode_with(code, buf)? {
            0 => Ok(Self::Unsettled),
            1 => Ok(Self::Settled),
            2 => Ok(Self::Mixed),
            other => Err(DecodeError::InvalidField {
                field: "snd-settle-mode",
                reason: format!("unknown mode {other}"),
            }),
        }
    }
}

/// Settlement policy of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReceiverSettleMode {
    /// Receiver settles first.
    #[default]
    First,
    /// Receiver settles only after the sender settles.
    Second,
}

impl AmqpEncode for ReceiverSettleMode {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        u8::from(matches!(self, Self::Second)).encode_to(buf)
    }
}

impl AmqpDecode for ReceiverSettleMode {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode_with(code, buf)? {
            0 => Ok(Self::First),
            1 => Ok(Self::Second),
            other => Err(DecodeError::InvalidField {
                field: "rcv-settle-mode",
                reason: format!("unknown mode {other}"),
            }),
        }
    }
}

/// 32-bit serial number with wrapping arithmetic (RFC 1982 comparison).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The value after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Advance by `n`, wrapping.
    #[must_use]
    pub const fn add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Wrapping distance from `earlier` to `self`.
    #[must_use]
    pub const fn distance_from(self, earlier: Self) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// Whether `self` lies in the inclusive wrapping range `first..=last`.
    #[must_use]
    pub const fn within(self, first: Self, last: Self) -> bool {
        self.distance_from(first) <= last.distance_from(first)
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let diff = self.0.wrapping_sub(other.0);
        match diff {
            0 => Some(Ordering::Equal),
            0x8000_0000 => None,
            d if d < 0x8000_0000 => Some(Ordering::Greater),
            _ => Some(Ordering::Less),
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl AmqpEncode for SequenceNumber {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.0.encode_to(buf)
    }
}

impl AmqpDecode for SequenceNumber {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        u32::decode_with(code, buf).map(Self)
    }
}

/// The `error` composite carried by detach, end, close and rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorCondition {
    /// Error condition symbol.
    pub condition: Symbol,
    /// Human readable detail.
    pub description: Option<String>,
    /// Extension information.
    pub info: Option<Fields>,
}

impl ErrorCondition {
    /// Build an error with a condition and description.
    pub fn new(condition: impl Into<Symbol>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
            info: None,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.condition),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl From<&Error> for ErrorCondition {
    fn from(err: &Error) -> Self {
        Self::new(err.condition(), err.root_cause().to_string())
    }
}

impl DescribedType for ErrorCondition {
    const CODE: u64 = 0x1d;
    const NAME: &'static str = "amqp:error:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 3;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            condition: fields.required("condition")?,
            description: fields.read()?,
            info: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.condition)?;
        fields.write_opt(self.description.as_ref())?;
        fields.write_opt(self.info.as_ref())
    }
}

/// Write a symbol-multiple field: absent and empty both go out as null.
pub(crate) fn write_symbols(
    fields: &mut FieldWriter<'_>,
    symbols: &[Symbol],
) -> Result<(), EncodeError> {
    if symbols.is_empty() {
        fields.write_null();
        Ok(())
    } else {
        fields.write(&symbols.to_vec())
    }
}

/// Read a symbol-multiple field; null reads as empty.
pub(crate) fn read_symbols(fields: &mut FieldReader) -> Result<Vec<Symbol>, DecodeError> {
    Ok(fields.read::<Vec<Symbol>>()?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::constants;

    #[test]
    fn serial_comparison_wraps() {
        let max = SequenceNumber(u32::MAX);
        let zero = SequenceNumber(0);
        assert!(max < zero);
        assert!(zero > max);
        assert_eq!(max.next(), zero);
        assert_eq!(zero.distance_from(max), 1);
        assert_eq!(
            SequenceNumber(0).partial_cmp(&SequenceNumber(0x8000_0000)),
            None
        );
    }

    #[test]
    fn wrapping_range_membership() {
        let first = SequenceNumber(u32::MAX - 1);
        let last = SequenceNumber(1);
        assert!(SequenceNumber(u32::MAX).within(first, last));
        assert!(SequenceNumber(0).within(first, last));
        assert!(!SequenceNumber(2).within(first, last));
    }

    #[test]
    fn role_is_encoded_as_boolean() {
        let mut buf = BytesMut::new();
        Role::Receiver.encode_to(&mut buf).unwrap();
        Role::Sender.encode_to(&mut buf).unwrap();
        assert_eq!(&buf[..], &[constants::BOOLEAN_TRUE, constants::BOOLEAN_FALSE]);
    }
}
