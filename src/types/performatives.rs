//! Transport performatives: the bodies of AMQP frames.

use bytes::{Bytes, BytesMut};

use super::definitions::{
    ErrorCondition, Fields, ReceiverSettleMode, Role, SenderSettleMode, SequenceNumber,
    read_symbols, write_symbols,
};
use super::messaging::{DeliveryState, Source, TargetKind};
use crate::codec::{AmqpEncode, DescribedType, FieldReader, FieldWriter, Map, Symbol};
use crate::error::{DecodeError, EncodeError};

/// Connection negotiation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Open {
    /// Identity of the container.
    pub container_id: String,
    /// Virtual host name.
    pub hostname: Option<String>,
    /// Largest frame the sender will accept; absent means `u32::MAX`.
    pub max_frame_size: Option<u32>,
    /// Highest channel number the sender will use; absent means `u16::MAX`.
    pub channel_max: Option<u16>,
    /// Idle timeout in milliseconds.
    pub idle_time_out: Option<u32>,
    /// Locales the sender may use.
    pub outgoing_locales: Vec<Symbol>,
    /// Locales the sender can accept.
    pub incoming_locales: Vec<Symbol>,
    /// Extensions the sender supports.
    pub offered_capabilities: Vec<Symbol>,
    /// Extensions the sender may use if the peer supports them.
    pub desired_capabilities: Vec<Symbol>,
    /// Connection properties.
    pub properties: Option<Fields>,
}

impl Open {
    /// Effective max-frame-size.
    #[must_use]
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(u32::MAX)
    }

    /// Effective channel-max.
    #[must_use]
    pub fn channel_max(&self) -> u16 {
        self.channel_max.unwrap_or(u16::MAX)
    }
}

impl DescribedType for Open {
    const CODE: u64 = 0x10;
    const NAME: &'static str = "amqp:open:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 10;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            container_id: fields.required("container-id")?,
            hostname: fields.read()?,
            max_frame_size: fields.read()?,
            channel_max: fields.read()?,
            idle_time_out: fields.read()?,
            outgoing_locales: read_symbols(fields)?,
            incoming_locales: read_symbols(fields)?,
            offered_capabilities: read_symbols(fields)?,
            desired_capabilities: read_symbols(fields)?,
            properties: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.container_id)?;
        fields.write_opt(self.hostname.as_ref())?;
        fields.write_opt(self.max_frame_size.as_ref())?;
        fields.write_opt(self.channel_max.as_ref())?;
        fields.write_opt(self.idle_time_out.as_ref())?;
        write_symbols(fields, &self.outgoing_locales)?;
        write_symbols(fields, &self.incoming_locales)?;
        write_symbols(fields, &self.offered_capabilities)?;
        write_symbols(fields, &self.desired_capabilities)?;
        fields.write_opt(self.properties.as_ref())
    }
}

/// Session negotiation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Begin {
    /// Channel of the peer's session when answering a remote begin.
    pub remote_channel: Option<u16>,
    /// First transfer id the sender will use.
    pub next_outgoing_id: SequenceNumber,
    /// Initial incoming window.
    pub incoming_window: u32,
    /// Initial outgoing window.
    pub outgoing_window: u32,
    /// Highest link handle the sender will use; absent means `u32::MAX`.
    pub handle_max: Option<u32>,
    /// Extensions the sender supports.
    pub offered_capabilities: Vec<Symbol>,
    /// Extensions the sender may use.
    pub desired_capabilities: Vec<Symbol>,
    /// Session properties.
    pub properties: Option<Fields>,
}

impl Begin {
    /// Effective handle-max.
    #[must_use]
    pub fn handle_max(&self) -> u32 {
        self.handle_max.unwrap_or(u32::MAX)
    }
}

impl DescribedType for Begin {
    const CODE: u64 = 0x11;
    const NAME: &'static str = "amqp:begin:list";
    const MIN_FIELDS: usize = 4;
    const MAX_FIELDS: usize = 8;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            remote_channel: fields.read()?,
            next_outgoing_id: fields.required("next-outgoing-id")?,
            incoming_window: fields.required("incoming-window")?,
            outgoing_window: fields.required("outgoing-window")?,
            handle_max: fields.read()?,
            offered_capabilities: read_symbols(fields)?,
            desired_capabilities: read_symbols(fields)?,
            properties: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_opt(self.remote_channel.as_ref())?;
        fields.write(&self.next_outgoing_id)?;
        fields.write(&self.incoming_window)?;
        fields.write(&self.outgoing_window)?;
        fields.write_opt(self.handle_max.as_ref())?;
        write_symbols(fields, &self.offered_capabilities)?;
        write_symbols(fields, &self.desired_capabilities)?;
        fields.write_opt(self.properties.as_ref())
    }
}

/// Link attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct Attach {
    /// Link name, unique per container pair and role.
    pub name: String,
    /// Handle the sender uses for the link.
    pub handle: u32,
    /// Role of the sender of this frame.
    pub role: Role,
    /// Sender settlement mode.
    pub snd_settle_mode: SenderSettleMode,
    /// Receiver settlement mode.
    pub rcv_settle_mode: ReceiverSettleMode,
    /// Source terminus.
    pub source: Option<Source>,
    /// Target terminus or coordinator.
    pub target: Option<TargetKind>,
    /// Unsettled delivery state by tag.
    pub unsettled: Option<Map>,
    /// Whether `unsettled` is incomplete.
    pub incomplete_unsettled: bool,
    /// Sender's initial delivery-count.
    pub initial_delivery_count: Option<SequenceNumber>,
    /// Largest message the link accepts.
    pub max_message_size: Option<u64>,
    /// Extensions the sender supports.
    pub offered_capabilities: Vec<Symbol>,
    /// Extensions the sender may use.
    pub desired_capabilities: Vec<Symbol>,
    /// Link properties.
    pub properties: Option<Fields>,
}

impl Attach {
    /// Minimal attach for `name` on `handle`.
    pub fn new(name: impl Into<String>, handle: u32, role: Role) -> Self {
        Self {
            name: name.into(),
            handle,
            role,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        }
    }
}

impl DescribedType for Attach {
    const CODE: u64 = 0x12;
    const NAME: &'static str = "amqp:attach:list";
    const MIN_FIELDS: usize = 3;
    const MAX_FIELDS: usize = 14;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            name: fields.required("name")?,
            handle: fields.required("handle")?,
            role: fields.required("role")?,
            snd_settle_mode: fields.read()?.unwrap_or_default(),
            rcv_settle_mode: fields.read()?.unwrap_or_default(),
            source: fields.read_described()?,
            target: fields.read_union()?,
            unsettled: fields.read()?,
            incomplete_unsettled: fields.flag()?,
            initial_delivery_count: fields.read()?,
            max_message_size: fields.read()?,
            offered_capabilities: read_symbols(fields)?,
            desired_capabilities: read_symbols(fields)?,
            properties: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.name)?;
        fields.write(&self.handle)?;
        fields.write(&self.role)?;
        if self.snd_settle_mode == SenderSettleMode::default() {
            fields.write_null();
        } else {
            fields.write(&self.snd_settle_mode)?;
        }
        if self.rcv_settle_mode == ReceiverSettleMode::default() {
            fields.write_null();
        } else {
            fields.write(&self.rcv_settle_mode)?;
        }
        fields.write_described(self.source.as_ref())?;
        fields.write_opt(self.target.as_ref())?;
        fields.write_opt(self.unsettled.as_ref())?;
        fields.flag(self.incomplete_unsettled)?;
        fields.write_opt(self.initial_delivery_count.as_ref())?;
        fields.write_opt(self.max_message_size.as_ref())?;
        write_symbols(fields, &self.offered_capabilities)?;
        write_symbols(fields, &self.desired_capabilities)?;
        fields.write_opt(self.properties.as_ref())
    }
}

/// Session and link flow state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    /// Expected next incoming transfer id; absent before the remote begin.
    pub next_incoming_id: Option<SequenceNumber>,
    /// Session incoming window.
    pub incoming_window: u32,
    /// Next outgoing transfer id.
    pub next_outgoing_id: SequenceNumber,
    /// Session outgoing window.
    pub outgoing_window: u32,
    /// Link handle; absent for a session-only flow.
    pub handle: Option<u32>,
    /// Link delivery-count.
    pub delivery_count: Option<SequenceNumber>,
    /// Link credit.
    pub link_credit: Option<u32>,
    /// Messages available at the sender.
    pub available: Option<u32>,
    /// Drain mode requested.
    pub drain: bool,
    /// Ask the peer to reply with its own flow state.
    pub echo: bool,
    /// Link state properties.
    pub properties: Option<Fields>,
}

impl DescribedType for Flow {
    const CODE: u64 = 0x13;
    const NAME: &'static str = "amqp:flow:list";
    const MIN_FIELDS: usize = 4;
    const MAX_FIELDS: usize = 11;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            next_incoming_id: fields.read()?,
            incoming_window: fields.required("incoming-window")?,
            next_outgoing_id: fields.required("next-outgoing-id")?,
            outgoing_window: fields.required("outgoing-window")?,
            handle: fields.read()?,
            delivery_count: fields.read()?,
            link_credit: fields.read()?,
            available: fields.read()?,
            drain: fields.flag()?,
            echo: fields.flag()?,
            properties: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write_opt(self.next_incoming_id.as_ref())?;
        fields.write(&self.incoming_window)?;
        fields.write(&self.next_outgoing_id)?;
        fields.write(&self.outgoing_window)?;
        fields.write_opt(self.handle.as_ref())?;
        fields.write_opt(self.delivery_count.as_ref())?;
        fields.write_opt(self.link_credit.as_ref())?;
        fields.write_opt(self.available.as_ref())?;
        fields.flag(self.drain)?;
        fields.flag(self.echo)?;
        fields.write_opt(self.properties.as_ref())
    }
}

/// Message transfer; the payload follows the performative in the frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    /// Link handle.
    pub handle: u32,
    /// Delivery id; required on the first frame of a delivery.
    pub delivery_id: Option<SequenceNumber>,
    /// Delivery tag; required on the first frame of a delivery.
    pub delivery_tag: Option<Bytes>,
    /// Message format code.
    pub message_format: Option<u32>,
    /// Settled by the sender.
    pub settled: Option<bool>,
    /// More frames follow for this delivery.
    pub more: bool,
    /// Per-delivery receiver settle mode.
    pub rcv_settle_mode: Option<ReceiverSettleMode>,
    /// Delivery state at the sender.
    pub state: Option<DeliveryState>,
    /// Resumed delivery.
    pub resume: bool,
    /// Delivery aborted by the sender.
    pub aborted: bool,
    /// Batchable hint.
    pub batchable: bool,
}

impl DescribedType for Transfer {
    const CODE: u64 = 0x14;
    const NAME: &'static str = "amqp:transfer:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 11;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            handle: fields.required("handle")?,
            delivery_id: fields.read()?,
            delivery_tag: fields.read()?,
            message_format: fields.read()?,
            settled: fields.read()?,
            more: fields.flag()?,
            rcv_settle_mode: fields.read()?,
            state: fields.read_union()?,
            resume: fields.flag()?,
            aborted: fields.flag()?,
            batchable: fields.flag()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.handle)?;
        fields.write_opt(self.delivery_id.as_ref())?;
        fields.write_opt(self.delivery_tag.as_ref())?;
        fields.write_opt(self.message_format.as_ref())?;
        fields.write_opt(self.settled.as_ref())?;
        fields.flag(self.more)?;
        fields.write_opt(self.rcv_settle_mode.as_ref())?;
        fields.write_opt(self.state.as_ref())?;
        fields.flag(self.resume)?;
        fields.flag(self.aborted)?;
        fields.flag(self.batchable)
    }
}

/// Settlement or state change for a range of deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    /// Role of the sender of this frame.
    pub role: Role,
    /// First delivery id in the range.
    pub first: SequenceNumber,
    /// Last delivery id; absent means `first`.
    pub last: Option<SequenceNumber>,
    /// Deliveries are settled.
    pub settled: bool,
    /// New delivery state.
    pub state: Option<DeliveryState>,
    /// Batchable hint.
    pub batchable: bool,
}

impl Disposition {
    /// Last delivery id of the range.
    #[must_use]
    pub fn last(&self) -> SequenceNumber {
        self.last.unwrap_or(self.first)
    }
}

impl DescribedType for Disposition {
    const CODE: u64 = 0x15;
    const NAME: &'static str = "amqp:disposition:list";
    const MIN_FIELDS: usize = 2;
    const MAX_FIELDS: usize = 6;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            role: fields.required("role")?,
            first: fields.required("first")?,
            last: fields.read()?,
            settled: fields.flag()?,
            state: fields.read_union()?,
            batchable: fields.flag()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.role)?;
        fields.write(&self.first)?;
        fields.write_opt(self.last.as_ref())?;
        fields.flag(self.settled)?;
        fields.write_opt(self.state.as_ref())?;
        fields.flag(self.batchable)
    }
}

/// Link detachment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Detach {
    /// Link handle.
    pub handle: u32,
    /// The link is closed rather than suspended.
    pub closed: bool,
    /// Error that caused the detach.
    pub error: Option<ErrorCondition>,
}

impl DescribedType for Detach {
    const CODE: u64 = 0x16;
    const NAME: &'static str = "amqp:detach:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 3;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            handle: fields.required("handle")?,
            closed: fields.flag()?,
            error: fields.read_described()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.handle)?;
        fields.flag(self.closed)?;
        fields.write_described(self.error.as_ref())
    }
}

/// Session end.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct End {
    /// Error that caused the end.
    pub error: Option<ErrorCondition>,
}

impl DescribedType for End {
    const CODE: u64 = 0x17;
    const NAME: &'static str = "amqp:end:list";
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

/// Connection close.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    /// Error that caused the close.
    pub error: Option<ErrorCondition>,
}

impl DescribedType for Close {
    const CODE: u64 = 0x18;
    const NAME: &'static str = "amqp:close:list";
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

/// Body of an AMQP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    /// `open`
    Open(Open),
    /// `begin`
    Begin(Begin),
    /// `attach`
    Attach(Box<Attach>),
    /// `flow`
    Flow(Flow),
    /// `transfer`
    Transfer(Transfer),
    /// `disposition`
    Disposition(Disposition),
    /// `detach`
    Detach(Detach),
    /// `end`
    End(End),
    /// `close`
    Close(Close),
}

impl Performative {
    /// Performative name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Begin(_) => "begin",
            Self::Attach(_) => "attach",
            Self::Flow(_) => "flow",
            Self::Transfer(_) => "transfer",
            Self::Disposition(_) => "disposition",
            Self::Detach(_) => "detach",
            Self::End(_) => "end",
            Self::Close(_) => "close",
        }
    }
}

impl AmqpEncode for Performative {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Open(body) => body.encode_described(buf),
            Self::Begin(body) => body.encode_described(buf),
            Self::Attach(body) => body.encode_described(buf),
            Self::Flow(body) => body.encode_described(buf),
            Self::Transfer(body) => body.encode_described(buf),
            Self::Disposition(body) => body.encode_described(buf),
            Self::Detach(body) => body.encode_described(buf),
            Self::End(body) => body.encode_described(buf),
            Self::Close(body) => body.encode_described(buf),
        }
    }
}

macro_rules! performative_from {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Performative {
                fn from(body: $ty) -> Self {
                    Self::$ty(body)
                }
            }
        )*
    };
}

performative_from!(Open, Begin, Flow, Transfer, Disposition, Detach, End, Close);

impl From<Attach> for Performative {
    fn from(body: Attach) -> Self {
        Self::Attach(Box::new(body))
    }
}
