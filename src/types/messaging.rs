//! Messaging layer types: delivery states, terminus and message sections.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::definitions::{ErrorCondition, Fields, read_symbols, write_symbols};
use super::transactions::{Coordinator, Declared, TransactionalState};
use crate::codec::{
    self, AmqpDecode, AmqpEncode, DescribedType, Descriptor, FieldReader, FieldWriter,
    FromDescribed, Map, Symbol, Timestamp, Value, constants, read_descriptor, take_u8, write_ulong,
};
use crate::error::{DecodeError, EncodeError};

/// `received` delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Section the receiver has reached.
    pub section_number: u32,
    /// Offset within that section.
    pub section_offset: u64,
}

impl DescribedType for Received {
    const CODE: u64 = 0x23;
    const NAME: &'static str = "amqp:received:list";
    const MIN_FIELDS: usize = 2;
    const MAX_FIELDS: usize = 2;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            section_number: fields.required("section-number")?,
            section_offset: fields.required("section-offset")?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.section_number)?;
        fields.write(&self.section_offset)
    }
}

/// `accepted` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Accepted;

impl DescribedType for Accepted {
    const CODE: u64 = 0x24;
    const NAME: &'static str = "amqp:accepted:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 0;

    fn decode_fields(_: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self)
    }

    fn encode_fields(&self, _: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        Ok(())
    }
}

/// `rejected` outcome.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rejected {
    /// Why the message was rejected.
    pub error: Option<ErrorCondition>,
}

impl DescribedType for Rejected {
    const CODE: u64 = 0x25;
    const NAME: &'static str = "amqp:rejected:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            error: fields.read_described()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_described(self.error.as_ref())
    }
}

/// `released` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Released;

impl DescribedType for Released {
    const CODE: u64 = 0x26;
    const NAME: &'static str = "amqp:released:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 0;

    fn decode_fields(_: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self)
    }

    fn encode_fields(&self, _: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        Ok(())
    }
}

/// `modified` outcome.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modified {
    /// Count the failure against the delivery.
    pub delivery_failed: bool,
    /// Do not redeliver to this link.
    pub undeliverable_here: bool,
    /// Annotations to merge into the message.
    pub message_annotations: Option<Fields>,
}

impl DescribedType for Modified {
    const CODE: u64 = 0x27;
    const NAME: &'static str = "amqp:modified:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 3;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            delivery_failed: fields.flag()?,
            undeliverable_here: fields.flag()?,
            message_annotations: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.flag(self.delivery_failed)?;
        fields.flag(self.undeliverable_here)?;
        fields.write_opt(self.message_annotations.as_ref())
    }
}

/// Any delivery state a transfer or disposition may carry.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    /// Partial progress on a resumed delivery.
    Received(Received),
    /// Processed successfully.
    Accepted,
    /// Invalid and not processable.
    Rejected(Rejected),
    /// Not processed; may be redelivered.
    Released,
    /// Not processed; redeliver with modifications.
    Modified(Modified),
    /// Transaction declared by a coordinator.
    Declared(Declared),
    /// Work done under a transaction.
    Transactional(Box<TransactionalState>),
}

impl DeliveryState {
    /// Whether the state is a terminal outcome.
    #[must_use]
    pub const fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Rejected(_) | Self::Released | Self::Modified(_) | Self::Declared(_)
        )
    }

    /// Descriptor name of the state.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Received(_) => Received::NAME,
            Self::Accepted => Accepted::NAME,
            Self::Rejected(_) => Rejected::NAME,
            Self::Released => Released::NAME,
            Self::Modified(_) => Modified::NAME,
            Self::Declared(_) => Declared::NAME,
            Self::Transactional(_) => TransactionalState::NAME,
        }
    }
}

impl FromDescribed for DeliveryState {
    fn from_described(descriptor: &Descriptor, buf: &mut Bytes) -> Result<Self, DecodeError> {
        if Accepted::matches(descriptor) {
            Accepted::decode_body(buf).map(|_| Self::Accepted)
        } else if Released::matches(descriptor) {
            Released::decode_body(buf).map(|_| Self::Released)
        } else if Rejected::matches(descriptor) {
            Rejected::decode_body(buf).map(Self::Rejected)
        } else if Modified::matches(descriptor) {
            Modified::decode_body(buf).map(Self::Modified)
        } else if Received::matches(descriptor) {
            Received::decode_body(buf).map(Self::Received)
        } else if Declared::matches(descriptor) {
            Declared::decode_body(buf).map(Self::Declared)
        } else if TransactionalState::matches(descriptor) {
            TransactionalState::decode_body(buf).map(|s| Self::Transactional(Box::new(s)))
        } else {
            Err(DecodeError::UnknownDescriptor(descriptor.to_string()))
        }
    }
}

impl AmqpEncode for DeliveryState {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Received(state) => state.encode_described(buf),
            Self::Accepted => Accepted.encode_described(buf),
            Self::Rejected(state) => state.encode_described(buf),
            Self::Released => Released.encode_described(buf),
            Self::Modified(state) => state.encode_described(buf),
            Self::Declared(state) => state.encode_described(buf),
            Self::Transactional(state) => state.encode_described(buf),
        }
    }
}

/// Source terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    /// Node address.
    pub address: Option<String>,
    /// Terminus durability (0 none, 1 configuration, 2 unsettled state).
    pub durable: Option<u32>,
    /// When the terminus expires.
    pub expiry_policy: Option<Symbol>,
    /// Expiry timeout in seconds.
    pub timeout: Option<u32>,
    /// Ask the peer to create the node.
    pub dynamic: bool,
    /// Properties of a dynamically created node.
    pub dynamic_node_properties: Option<Fields>,
    /// `move` or `copy`.
    pub distribution_mode: Option<Symbol>,
    /// Message filters.
    pub filter: Option<Map>,
    /// Outcome applied to unsettled deliveries at link recovery.
    pub default_outcome: Option<DeliveryState>,
    /// Outcomes the source supports.
    pub outcomes: Vec<Symbol>,
    /// Extension capabilities.
    pub capabilities: Vec<Symbol>,
}

impl Source {
    /// Source naming `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }
}

impl DescribedType for Source {
    const CODE: u64 = 0x28;
    const NAME: &'static str = "amqp:source:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 11;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            address: fields.read()?,
            durable: fields.read()?,
            expiry_policy: fields.read()?,
            timeout: fields.read()?,
            dynamic: fields.flag()?,
            dynamic_node_properties: fields.read()?,
            distribution_mode: fields.read()?,
            filter: fields.read()?,
            default_outcome: fields.read_union()?,
            outcomes: read_symbols(fields)?,
            capabilities: read_symbols(fields)?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_opt(self.address.as_ref())?;
        fields.write_opt(self.durable.as_ref())?;
        fields.write_opt(self.expiry_policy.as_ref())?;
        fields.write_opt(self.timeout.as_ref())?;
        fields.flag(self.dynamic)?;
        fields.write_opt(self.dynamic_node_properties.as_ref())?;
        fields.write_opt(self.distribution_mode.as_ref())?;
        fields.write_opt(self.filter.as_ref())?;
        fields.write_opt(self.default_outcome.as_ref())?;
        write_symbols(fields, &self.outcomes)?;
        write_symbols(fields, &self.capabilities)
    }
}

/// Target terminus of a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Target {
    /// Node address.
    pub address: Option<String>,
    /// Terminus durability.
    pub durable: Option<u32>,
    /// When the terminus expires.
    pub expiry_policy: Option<Symbol>,
    /// Expiry timeout in seconds.
    pub timeout: Option<u32>,
    /// Ask the peer to create the node.
    pub dynamic: bool,
    /// Properties of a dynamically created node.
    pub dynamic_node_properties: Option<Fields>,
    /// Extension capabilities.
    pub capabilities: Vec<Symbol>,
}

impl Target {
    /// Target naming `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }
}

impl DescribedType for Target {
    const CODE: u64 = 0x29;
    const NAME: &'static str = "amqp:target:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 7;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            address: fields.read()?,
            durable: fields.read()?,
            expiry_policy: fields.read()?,
            timeout: fields.read()?,
            dynamic: fields.flag()?,
            dynamic_node_properties: fields.read()?,
            capabilities: read_symbols(fields)?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_opt(self.address.as_ref())?;
        fields.write_opt(self.durable.as_ref())?;
        fields.write_opt(self.expiry_policy.as_ref())?;
        fields.write_opt(self.timeout.as_ref())?;
        fields.flag(self.dynamic)?;
        fields.write_opt(self.dynamic_node_properties.as_ref())?;
        write_symbols(fields, &self.capabilities)
    }
}

/// The attach `target` field: a regular target or a transaction coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetKind {
    /// Message target.
    Target(Target),
    /// Transaction coordinator.
    Coordinator(Coordinator),
}

impl FromDescribed for TargetKind {
    fn from_described(descriptor: &Descriptor, buf: &mut Bytes) -> Result<Self, DecodeError> {
        if Target::matches(descriptor) {
            Target::decode_body(buf).map(Self::Target)
        } else if Coordinator::matches(descriptor) {
            Coordinator::decode_body(buf).map(Self::Coordinator)
        } else {
            Err(DecodeError::UnknownDescriptor(descriptor.to_string()))
        }
    }
}

impl AmqpEncode for TargetKind {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Target(target) => target.encode_described(buf),
            Self::Coordinator(coordinator) => coordinator.encode_described(buf),
        }
    }
}

/// Standard message header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// Durability requirement.
    pub durable: bool,
    /// Relative priority.
    pub priority: Option<u8>,
    /// Time to live in milliseconds.
    pub ttl: Option<u32>,
    /// Whether this is the first acquirer.
    pub first_acquirer: bool,
    /// Prior unsuccessful delivery attempts.
    pub delivery_count: Option<u32>,
}

impl DescribedType for Header {
    const CODE: u64 = HEADER;
    const NAME: &'static str = "amqp:header:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 5;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            durable: fields.flag()?,
            priority: fields.read()?,
            ttl: fields.read()?,
            first_acquirer: fields.flag()?,
            delivery_count: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.flag(self.durable)?;
        fields.write_opt(self.priority.as_ref())?;
        fields.write_opt(self.ttl.as_ref())?;
        fields.flag(self.first_acquirer)?;
        fields.write_opt(self.delivery_count.as_ref())
    }
}

/// Immutable message properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Properties {
    /// Application message id (ulong, uuid, binary or string).
    pub message_id: Option<Value>,
    /// Identity of the producing user.
    pub user_id: Option<Bytes>,
    /// Destination address.
    pub to: Option<String>,
    /// Application subject.
    pub subject: Option<String>,
    /// Address for replies.
    pub reply_to: Option<String>,
    /// Message this one relates to.
    pub correlation_id: Option<Value>,
    /// MIME type of the body.
    pub content_type: Option<Symbol>,
    /// Content encoding of the body.
    pub content_encoding: Option<Symbol>,
    /// Absolute expiry time.
    pub absolute_expiry_time: Option<Timestamp>,
    /// Creation time.
    pub creation_time: Option<Timestamp>,
    /// Message group.
    pub group_id: Option<String>,
    /// Position within the group.
    pub group_sequence: Option<u32>,
    /// Group for replies.
    pub reply_to_group_id: Option<String>,
}

impl DescribedType for Properties {
    const CODE: u64 = PROPERTIES;
    const NAME: &'static str = "amqp:properties:list";
    const MIN_FIELDS: usize = 0;
    const MAX_FIELDS: usize = 13;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            message_id: fields.read_value()?,
            user_id: fields.read()?,
            to: fields.read()?,
            subject: fields.read()?,
            reply_to: fields.read()?,
            correlation_id: fields.read_value()?,
            content_type: fields.read()?,
            content_encoding: fields.read()?,
            absolute_expiry_time: fields.read()?,
            creation_time: fields.read()?,
            group_id: fields.read()?,
            group_sequence: fields.read()?,
            reply_to_group_id: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_opt(self.message_id.as_ref())?;
        fields.write_opt(self.user_id.as_ref())?;
        fields.write_opt(self.to.as_ref())?;
        fields.write_opt(self.subject.as_ref())?;
        fields.write_opt(self.reply_to.as_ref())?;
        fields.write_opt(self.correlation_id.as_ref())?;
        fields.write_opt(self.content_type.as_ref())?;
        fields.write_opt(self.content_encoding.as_ref())?;
        fields.write_opt(self.absolute_expiry_time.as_ref())?;
        fields.write_opt(self.creation_time.as_ref())?;
        fields.write_opt(self.group_id.as_ref())?;
        fields.write_opt(self.group_sequence.as_ref())?;
        fields.write_opt(self.reply_to_group_id.as_ref())
    }
}

const HEADER: u64 = 0x70;
const DELIVERY_ANNOTATIONS: u64 = 0x71;
const MESSAGE_ANNOTATIONS: u64 = 0x72;
const PROPERTIES: u64 = 0x73;
const APPLICATION_PROPERTIES: u64 = 0x74;
const DATA: u64 = 0x75;
const AMQP_SEQUENCE: u64 = 0x76;
const AMQP_VALUE: u64 = 0x77;
const FOOTER: u64 = 0x78;

/// One section of an encoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// Transport headers.
    Header(Header),
    /// Annotations for the next hop.
    DeliveryAnnotations(Map),
    /// Annotations for the message.
    MessageAnnotations(Map),
    /// Immutable properties.
    Properties(Properties),
    /// Application-defined properties.
    ApplicationProperties(Map),
    /// Opaque binary body.
    Data(Bytes),
    /// Body as a list of values.
    AmqpSequence(Vec<Value>),
    /// Body as a single value.
    AmqpValue(Value),
    /// Trailing annotations.
    Footer(Map),
}

fn section_code(descriptor: &Descriptor) -> Option<u64> {
    const NAMES: [(&str, u64); 9] = [
        ("amqp:header:list", HEADER),
        ("amqp:delivery-annotations:map", DELIVERY_ANNOTATIONS),
        ("amqp:message-annotations:map", MESSAGE_ANNOTATIONS),
        ("amqp:properties:list", PROPERTIES),
        ("amqp:application-properties:map", APPLICATION_PROPERTIES),
        ("amqp:data:binary", DATA),
        ("amqp:amqp-sequence:list", AMQP_SEQUENCE),
        ("amqp:amqp-value:*", AMQP_VALUE),
        ("amqp:footer:map", FOOTER),
    ];
    match descriptor {
        Descriptor::Code(code) => Some(*code),
        Descriptor::Symbol(name) => NAMES
            .iter()
            .find(|(n, _)| name.as_str() == *n)
            .map(|(_, code)| *code),
    }
}

impl Section {
    /// Decode one section, constructor included.
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let code = take_u8(buf)?;
        if code != constants::DESCRIBED_TYPE_INDICATOR {
            return Err(DecodeError::UnexpectedEncoding {
                expected: "message section",
                found: code,
            });
        }
        let descriptor = read_descriptor(buf)?;
        match section_code(&descriptor) {
            Some(HEADER) => Header::decode_body(buf).map(Self::Header),
            Some(DELIVERY_ANNOTATIONS) => Map::decode_from(buf).map(Self::DeliveryAnnotations),
            Some(MESSAGE_ANNOTATIONS) => Map::decode_from(buf).map(Self::MessageAnnotations),
            Some(PROPERTIES) => Properties::decode_body(buf).map(Self::Properties),
            Some(APPLICATION_PROPERTIES) => {
                Map::decode_from(buf).map(Self::ApplicationProperties)
            }
            Some(DATA) => Bytes::decode_from(buf).map(Self::Data),
            Some(AMQP_SEQUENCE) => match codec::decode_value(buf)? {
                Value::List(items) => Ok(Self::AmqpSequence(items)),
                other => Err(DecodeError::InvalidField {
                    field: "amqp-sequence",
                    reason: format!("expected list, found {}", other.type_name()),
                }),
            },
            Some(AMQP_VALUE) => codec::decode_value(buf).map(Self::AmqpValue),
            Some(FOOTER) => Map::decode_from(buf).map(Self::Footer),
            _ => Err(DecodeError::UnknownDescriptor(descriptor.to_string())),
        }
    }

    /// Decode every section of a message payload.
    pub fn decode_all(mut payload: Bytes) -> Result<Vec<Self>, DecodeError> {
        let mut sections = Vec::new();
        while payload.has_remaining() {
            sections.push(Self::decode(&mut payload)?);
        }
        Ok(sections)
    }

    fn encode_tagged<T: AmqpEncode + ?Sized>(
        code: u64,
        body: &T,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(constants::DESCRIBED_TYPE_INDICATOR);
        write_ulong(code, buf);
        body.encode_to(buf)
    }
}

impl AmqpEncode for Section {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Header(header) => header.encode_described(buf),
            Self::DeliveryAnnotations(map) => Self::encode_tagged(DELIVERY_ANNOTATIONS, map, buf),
            Self::MessageAnnotations(map) => Self::encode_tagged(MESSAGE_ANNOTATIONS, map, buf),
            Self::Properties(properties) => properties.encode_described(buf),
            Self::ApplicationProperties(map) => {
                Self::encode_tagged(APPLICATION_PROPERTIES, map, buf)
            }
            Self::Data(data) => Self::encode_tagged(DATA, data, buf),
            Self::AmqpSequence(items) => {
                Self::encode_tagged(AMQP_SEQUENCE, &Value::List(items.clone()), buf)
            }
            Self::AmqpValue(value) => Self::encode_tagged(AMQP_VALUE, value, buf),
            Self::Footer(map) => Self::encode_tagged(FOOTER, map, buf),
        }
    }
}
