//! Transaction wire types. Only the encodings live here; coordinator
//! behaviour belongs to the application.

use bytes::Bytes;

use super::definitions::{read_symbols, write_symbols};
use super::messaging::DeliveryState;
use crate::codec::{DescribedType, FieldReader, FieldWriter, Symbol, Value};
use crate::error::{DecodeError, EncodeError};

/// Target used to attach to a transaction coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Coordinator {
    /// Supported transaction capabilities.
    pub capabilities: Vec<Symbol>,
}

impl DescribedType for Coordinator {
    const CODE: u64 = 0x30;
    const NAME: &'static str = "amqp:coordinator:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            capabilities: read_symbols(fields)?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        write_symbols(fields, &self.capabilities)
    }
}

/// Request to declare a transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Declare {
    /// Global transaction id (not supported by most coordinators).
    pub global_id: Option<Value>,
}

impl DescribedType for Declare {
    const CODE: u64 = 0x31;
    const NAME: &'static str = "amqp:declare:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            global_id: fields.read_value()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_opt(self.global_id.as_ref())
    }
}

/// Request to end a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discharge {
    /// Transaction being discharged.
    pub txn_id: Bytes,
    /// Roll back instead of committing.
    pub fail: bool,
}

impl DescribedType for Discharge {
    const CODE: u64 = 0x32;
    const NAME: &'static str = "amqp:discharge:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 2;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            txn_id: fields.required("txn-id")?,
            fail: fields.flag()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.txn_id)?;
        fields.flag(self.fail)
    }
}

/// Outcome of a successful declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declared {
    /// Allocated transaction id.
    pub txn_id: Bytes,
}

impl DescribedType for Declared {
    const CODE: u64 = 0x33;
    const NAME: &'static str = "amqp:declared:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            txn_id: fields.required("txn-id")?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.txn_id)
    }
}

/// Delivery state of work performed inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionalState {
    /// Owning transaction.
    pub txn_id: Bytes,
    /// Provisional outcome.
    pub outcome: Option<DeliveryState>,
}

impl DescribedType for TransactionalState {
    const CODE: u64 = 0x34;
    const NAME: &'static str = "amqp:transactional-state:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 2;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            txn_id: fields.required("txn-id")?,
            outcome: fields.read_union()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.txn_id)?;
        fields.write_opt(self.outcome.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_described, encode_described_to_bytes};

    #[test]
    fn transactional_state_nests_outcome() {
        let state = TransactionalState {
            txn_id: Bytes::from_static(b"tx-1"),
            outcome: Some(DeliveryState::Accepted),
        };
        let mut bytes = encode_described_to_bytes(&state).unwrap();
        assert_eq!(decode_described::<TransactionalState>(&mut bytes).unwrap(), state);
    }

    #[test]
    fn discharge_requires_txn_id() {
        let mut bytes = encode_described_to_bytes(&Declare::default()).unwrap();
        assert!(decode_described::<Discharge>(&mut bytes).is_err());
    }
}
