//! Deliveries: unsettled bookkeeping and multi-frame assembly.

use bytes::Bytes;

use crate::buffer::{DEFAULT_MAX_CAPACITY, ProtonBuffer};
use crate::error::{BufferError, DecodeError, Error, Result};
use crate::types::{DeliveryState, Section, SequenceNumber, Transfer, conditions};

/// A delivery tracked until both sides have settled it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    id: SequenceNumber,
    tag: Bytes,
    settled: bool,
    remote_settled: bool,
    state: Option<DeliveryState>,
    remote_state: Option<DeliveryState>,
}

impl Delivery {
    pub(crate) fn new(id: SequenceNumber, tag: Bytes) -> Self {
        Self {
            id,
            tag,
            settled: false,
            remote_settled: false,
            state: None,
            remote_state: None,
        }
    }

    /// Session-scoped delivery id.
    #[must_use]
    pub const fn id(&self) -> SequenceNumber {
        self.id
    }

    /// Delivery tag.
    #[must_use]
    pub fn tag(&self) -> &Bytes {
        &self.tag
    }

    /// Settled locally.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.settled
    }

    /// Settled by the peer.
    #[must_use]
    pub const fn is_remote_settled(&self) -> bool {
        self.remote_settled
    }

    /// State we last sent.
    #[must_use]
    pub const fn state(&self) -> Option<&DeliveryState> {
        self.state.as_ref()
    }

    /// State the peer last sent.
    #[must_use]
    pub const fn remote_state(&self) -> Option<&DeliveryState> {
        self.remote_state.as_ref()
    }

    pub(crate) fn update_local(&mut self, state: Option<DeliveryState>, settled: bool) {
        if state.is_some() {
            self.state = state;
        }
        self.settled |= settled;
    }

    pub(crate) fn update_remote(&mut self, state: Option<DeliveryState>, settled: bool) {
        if state.is_some() {
            self.remote_state = state;
        }
        self.remote_settled |= settled;
    }
}

/// A complete message received on a link.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingDelivery {
    /// Session-scoped delivery id.
    pub delivery_id: SequenceNumber,
    /// Delivery tag.
    pub tag: Bytes,
    /// Message format code.
    pub message_format: u32,
    /// Sender settled the delivery before sending.
    pub settled: bool,
    /// Delivery state announced by the sender.
    pub state: Option<DeliveryState>,
    /// Encoded message sections.
    pub payload: Bytes,
}

impl IncomingDelivery {
    /// Decode the payload into message sections.
    pub fn sections(&self) -> std::result::Result<Vec<Section>, DecodeError> {
        Section::decode_all(self.payload.clone())
    }
}

#[derive(Debug)]
enum Payload {
    Single(Bytes),
    Assembled(ProtonBuffer),
}

/// Incoming delivery whose final transfer has not arrived yet.
#[derive(Debug)]
pub(crate) struct PartialDelivery {
    delivery_id: SequenceNumber,
    tag: Bytes,
    message_format: u32,
    settled: bool,
    state: Option<DeliveryState>,
    payload: Payload,
    max_size: usize,
}

impl PartialDelivery {
    /// Start assembly from the first transfer of a delivery.
    pub(crate) fn start(transfer: &Transfer, payload: Bytes, max_size: Option<u64>) -> Result<Self> {
        let delivery_id = transfer.delivery_id.ok_or_else(|| {
            Error::protocol(conditions::INVALID_FIELD, "first transfer lacks a delivery-id")
        })?;
        let tag = transfer.delivery_tag.clone().ok_or_else(|| {
            Error::protocol(conditions::INVALID_FIELD, "first transfer lacks a delivery-tag")
        })?;
        let max_size = max_size
            .and_then(|max| usize::try_from(max).ok())
            .unwrap_or(DEFAULT_MAX_CAPACITY);
        if payload.len() > max_size {
            return Err(size_exceeded(payload.len(), max_size));
        }
        Ok(Self {
            delivery_id,
            tag,
            message_format: transfer.message_format.unwrap_or(0),
            settled: transfer.settled.unwrap_or(false),
            state: transfer.state.clone(),
            payload: Payload::Single(payload),
            max_size,
        })
    }

    pub(crate) const fn delivery_id(&self) -> SequenceNumber {
        self.delivery_id
    }

    /// Add a continuation transfer.
    pub(crate) fn append(&mut self, transfer: &Transfer, payload: &[u8]) -> Result<()> {
        if let Some(id) = transfer.delivery_id {
            if id != self.delivery_id {
                return Err(Error::protocol(
                    conditions::INVALID_FIELD,
                    format!("continuation for delivery {id} while {} is partial", self.delivery_id),
                ));
            }
        }
        self.settled |= transfer.settled.unwrap_or(false);
        if transfer.state.is_some() {
            self.state.clone_from(&transfer.state);
        }
        if payload.is_empty() {
            return Ok(());
        }
        let max_size = self.max_size;
        if let Payload::Single(first) = &self.payload {
            let mut buffer = ProtonBuffer::allocate_bounded(first.len() + payload.len(), max_size);
            buffer
                .write_bytes(first)
                .map_err(|err| capacity_error(&err, max_size))?;
            self.payload = Payload::Assembled(buffer);
        }
        if let Payload::Assembled(buffer) = &mut self.payload {
            buffer
                .write_bytes(payload)
                .map_err(|err| capacity_error(&err, max_size))?;
        }
        Ok(())
    }

    /// Finish assembly.
    pub(crate) fn complete(self) -> Result<IncomingDelivery> {
        let payload = match self.payload {
            Payload::Single(bytes) => bytes,
            Payload::Assembled(buffer) => buffer.into_bytes()?,
        };
        Ok(IncomingDelivery {
            delivery_id: self.delivery_id,
            tag: self.tag,
            message_format: self.message_format,
            settled: self.settled,
            state: self.state,
            payload,
        })
    }
}

fn capacity_error(err: &BufferError, max: usize) -> Error {
    match err {
        BufferError::CapacityExceeded { requested, .. } => size_exceeded(*requested, max),
        other => Error::Buffer(other.clone()),
    }
}

fn size_exceeded(size: usize, max: usize) -> Error {
    Error::protocol(
        conditions::MESSAGE_SIZE_EXCEEDED,
        format!("delivery of {size} bytes exceeds max-message-size {max}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_transfer(more: bool) -> Transfer {
        Transfer {
            delivery_id: Some(SequenceNumber(3)),
            delivery_tag: Some(Bytes::from_static(b"tag")),
            more,
            ..Transfer::default()
        }
    }

    #[test]
    fn single_frame_keeps_payload_storage() {
        let payload = Bytes::from_static(b"hello");
        let delivery = PartialDelivery::start(&first_transfer(false), payload.clone(), None)
            .unwrap()
            .complete()
            .unwrap();
        assert_eq!(delivery.payload.as_ptr(), payload.as_ptr());
        assert_eq!(delivery.delivery_id, SequenceNumber(3));
    }

    #[test]
    fn frames_are_concatenated() {
        let mut partial =
            PartialDelivery::start(&first_transfer(true), Bytes::from_static(b"ab"), None).unwrap();
        let next = Transfer {
            more: true,
            ..Transfer::default()
        };
        partial.append(&next, b"cd").unwrap();
        let last = Transfer {
            settled: Some(true),
            ..Transfer::default()
        };
        partial.append(&last, b"e").unwrap();
        let delivery = partial.complete().unwrap();
        assert_eq!(&delivery.payload[..], b"abcde");
        assert!(delivery.settled);
    }

    #[test]
    fn max_message_size_is_enforced() {
        let mut partial =
            PartialDelivery::start(&first_transfer(true), Bytes::from_static(b"abc"), Some(4)).unwrap();
        let err = partial.append(&Transfer::default(), b"de").unwrap_err();
        assert_eq!(err.condition(), conditions::MESSAGE_SIZE_EXCEEDED);
    }

    #[test]
    fn first_transfer_needs_id_and_tag() {
        let err = PartialDelivery::start(&Transfer::default(), Bytes::new(), None).unwrap_err();
        assert_eq!(err.condition(), conditions::INVALID_FIELD);
    }

    #[test]
    fn delivery_settlement_is_sticky() {
        let mut delivery = Delivery::new(SequenceNumber(1), Bytes::from_static(b"t"));
        delivery.update_remote(Some(DeliveryState::Accepted), true);
        delivery.update_remote(None, false);
        assert!(delivery.is_remote_settled());
        assert_eq!(delivery.remote_state(), Some(&DeliveryState::Accepted));
    }
}
