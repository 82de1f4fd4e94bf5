//! AMQP described types: performatives, SASL frames, messaging and
//! transaction types.

pub mod conditions;
mod definitions;
mod messaging;
mod performatives;
mod registry;
mod sasl;
mod transactions;

pub use definitions::{
    ErrorCondition, Fields, MIN_MAX_FRAME_SIZE, ReceiverSettleMode, Role, SenderSettleMode,
    SequenceNumber,
};
pub use messaging::{
    Accepted, DeliveryState, Header, Modified, Properties, Received, Rejected, Released, Section,
    Source, Target, TargetKind,
};
pub use performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
pub use registry::{BodyDecoder, DescribedTypeRegistry, performatives, sasl_performatives};
pub use sasl::{
    SaslChallenge, SaslCode, SaslInit, SaslMechanisms, SaslOutcome, SaslPerformative, SaslResponse,
};
pub use transactions::{Coordinator, Declare, Declared, Discharge, TransactionalState};
