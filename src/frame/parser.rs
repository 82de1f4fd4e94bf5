//! Incremental frame parser.
//!
//! Input arrives in arbitrary chunks. Frames that are wholly contained in one
//! chunk are decoded in place from the input `Bytes`; a frame split across
//! reads is gathered into a [`ProtonBuffer`] sized to exactly the rest of the
//! frame. Any failure parks the parser in a sticky error stage.
//!
//! A SASL frame other than the outcome needs an answer before the peer's
//! next bytes can be classified: after an init the client may pipeline its
//! AMQP header, which is only legal once our outcome is out. The parser
//! therefore stops after such a frame and leaves the rest of the input
//! unread until [`FrameParser::resume_frames`] or
//! [`FrameParser::reset_to_header`] is called.

use bytes::{Buf, Bytes};
use tracing::{debug, trace};

use super::header::{HEADER_SIZE, ProtocolHeader};
use super::{AMQP_FRAME_TYPE, FRAME_HEADER_SIZE, Frame, FrameBody, SASL_FRAME_TYPE};
use crate::buffer::ProtonBuffer;
use crate::error::{Error, Result};
use crate::types::{SaslPerformative, performatives, sasl_performatives};

/// Something the parser produced from the input.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    /// Protocol header from the peer.
    Header(ProtocolHeader),
    /// Decoded frame.
    Frame(Frame),
    /// Empty frame.
    Heartbeat,
}

/// Externally visible parser stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserStage {
    /// Waiting for the eight protocol header bytes.
    HeaderParsing,
    /// Waiting for the four frame size bytes.
    FrameSizeParsing,
    /// Gathering a frame that spans reads.
    FrameBuffering,
    /// A whole frame is available and being decoded.
    FrameBodyParsing,
    /// Holding input until our reply to a SASL frame is written.
    SaslReplyPending,
    /// A previous call failed; the parser accepts nothing more.
    Error,
}

#[derive(Debug)]
enum Stage {
    HeaderParsing {
        raw: [u8; HEADER_SIZE],
        filled: usize,
    },
    FrameSizeParsing {
        raw: [u8; 4],
        filled: usize,
    },
    FrameBuffering {
        size: u32,
        buffer: ProtonBuffer,
    },
    FrameBodyParsing {
        size: u32,
        body: Bytes,
    },
    SaslReplyPending,
    Error(Error),
}

impl Stage {
    const fn header() -> Self {
        Self::HeaderParsing {
            raw: [0; HEADER_SIZE],
            filled: 0,
        }
    }

    const fn size() -> Self {
        Self::FrameSizeParsing {
            raw: [0; 4],
            filled: 0,
        }
    }
}

/// Copy as much of `input` as fits into `raw`; true once `raw` is full.
fn fill<const N: usize>(raw: &mut [u8; N], filled: &mut usize, input: &mut Bytes) -> bool {
    let take = (N - *filled).min(input.len());
    raw[*filled..*filled + take].copy_from_slice(&input[..take]);
    input.advance(take);
    *filled += take;
    *filled == N
}

/// Frame parser state machine.
#[derive(Debug)]
pub struct FrameParser {
    stage: Stage,
    max_frame_size: u32,
}

impl FrameParser {
    /// Parser expecting a protocol header, accepting frames up to `max_frame_size`.
    #[must_use]
    pub const fn new(max_frame_size: u32) -> Self {
        Self {
            stage: Stage::header(),
            max_frame_size,
        }
    }

    /// Largest inbound frame accepted.
    #[must_use]
    pub const fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Change the inbound frame limit.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> ParserStage {
        match self.stage {
            Stage::HeaderParsing { .. } => ParserStage::HeaderParsing,
            Stage::FrameSizeParsing { .. } => ParserStage::FrameSizeParsing,
            Stage::FrameBuffering { .. } => ParserStage::FrameBuffering,
            Stage::FrameBodyParsing { .. } => ParserStage::FrameBodyParsing,
            Stage::SaslReplyPending => ParserStage::SaslReplyPending,
            Stage::Error(_) => ParserStage::Error,
        }
    }

    /// Whether the parser is in its error stage.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.stage, Stage::Error(_))
    }

    /// Expect a protocol header next. Used once the SASL layer completes.
    pub fn reset_to_header(&mut self) {
        if !self.is_failed() {
            self.stage = Stage::header();
        }
    }

    /// Continue with frames after a paused SASL exchange step.
    pub fn resume_frames(&mut self) {
        if matches!(self.stage, Stage::SaslReplyPending) {
            self.stage = Stage::size();
        }
    }

    /// Whether input is being held back for a SASL reply.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        matches!(self.stage, Stage::SaslReplyPending)
    }

    /// Park the parser in its error stage.
    pub fn fail(&mut self, err: Error) {
        self.stage = Stage::Error(err);
    }

    /// Consume `input`, appending every complete event to `events`.
    ///
    /// Events decoded before a failure are still appended. After a failure
    /// every call returns the same error and leaves `input` untouched.
    pub fn parse(&mut self, input: &mut Bytes, events: &mut Vec<ReadEvent>) -> Result<()> {
        if let Stage::Error(err) = &self.stage {
            return Err(err.clone());
        }
        self.run(input, events).inspect_err(|err| {
            self.stage = Stage::Error(err.clone());
        })
    }

    fn run(&mut self, input: &mut Bytes, events: &mut Vec<ReadEvent>) -> Result<()> {
        loop {
            match &mut self.stage {
                Stage::HeaderParsing { raw, filled } => {
                    if !fill(raw, filled, input) {
                        return Ok(());
                    }
                    let header = ProtocolHeader::parse(*raw)?;
                    trace!(%header, "read protocol header");
                    events.push(ReadEvent::Header(header));
                    self.stage = Stage::size();
                }
                Stage::FrameSizeParsing { raw, filled } => {
                    if !fill(raw, filled, input) {
                        return Ok(());
                    }
                    let size = u32::from_be_bytes(*raw);
                    self.check_size(size)?;
                    let rest = size as usize - 4;
                    if input.len() >= rest {
                        let body = input.split_to(rest);
                        self.stage = Stage::FrameBodyParsing { size, body };
                    } else {
                        let mut buffer = ProtonBuffer::allocate_bounded(rest, rest);
                        buffer.write_bytes(&input[..])?;
                        input.advance(input.len());
                        self.stage = Stage::FrameBuffering { size, buffer };
                        return Ok(());
                    }
                }
                Stage::FrameBuffering { size, buffer } => {
                    let take = buffer.writable_bytes().min(input.len());
                    buffer.write_bytes(&input[..take])?;
                    input.advance(take);
                    if buffer.writable_bytes() > 0 {
                        return Ok(());
                    }
                    let size = *size;
                    let body = std::mem::take(buffer).into_bytes()?;
                    self.stage = Stage::FrameBodyParsing { size, body };
                }
                Stage::FrameBodyParsing { size, body } => {
                    let size = *size;
                    let body = std::mem::take(body);
                    self.stage = Stage::size();
                    let event = Self::decode_body(size, body)?;
                    let next = match &event {
                        ReadEvent::Frame(Frame {
                            body: FrameBody::Sasl(SaslPerformative::Outcome(_)),
                            ..
                        }) => Some(Stage::header()),
                        ReadEvent::Frame(Frame {
                            body: FrameBody::Sasl(_),
                            ..
                        }) => Some(Stage::SaslReplyPending),
                        _ => None,
                    };
                    events.push(event);
                    if let Some(next) = next {
                        self.stage = next;
                    }
                }
                Stage::SaslReplyPending => return Ok(()),
                Stage::Error(err) => return Err(err.clone()),
            }
        }
    }

    fn check_size(&self, size: u32) -> Result<()> {
        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(Error::FrameTooSmall { size });
        }
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Decode everything after the size field.
    fn decode_body(size: u32, mut body: Bytes) -> Result<ReadEvent> {
        let doff = body.get_u8();
        let frame_type = body.get_u8();
        let channel = body.get_u16();
        let offset = u32::from(doff) * 4;
        if doff < 2 || offset > size {
            return Err(Error::InvalidDataOffset { doff, size });
        }
        body.advance(offset as usize - FRAME_HEADER_SIZE);

        match frame_type {
            AMQP_FRAME_TYPE => {
                if body.is_empty() {
                    trace!(channel, "read heartbeat");
                    return Ok(ReadEvent::Heartbeat);
                }
                let performative = performatives().decode(&mut body)?;
                let payload = (!body.is_empty()).then_some(body);
                Ok(ReadEvent::Frame(Frame {
                    channel,
                    body: FrameBody::Amqp(performative),
                    payload,
                }))
            }
            SASL_FRAME_TYPE => {
                let sasl = sasl_performatives().decode(&mut body)?;
                if !body.is_empty() {
                    debug!(
                        frame = sasl.name(),
                        trailing = body.len(),
                        "ignoring bytes after SASL performative"
                    );
                }
                Ok(ReadEvent::Frame(Frame {
                    channel,
                    body: FrameBody::Sasl(sasl),
                    payload: None,
                }))
            }
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::error::DecodeError;
    use crate::frame::{FrameEncoder, HEARTBEAT};
    use crate::types::{
        Begin, Close, Open, Performative, SaslCode, SaslInit, SaslOutcome, SequenceNumber,
        Transfer,
    };
    use crate::codec::Symbol;

    fn wire() -> (Bytes, Vec<ReadEvent>) {
        let encoder = FrameEncoder::new(u32::MAX);
        let mut buf = BytesMut::new();
        buf.put_slice(&ProtocolHeader::Amqp.to_bytes());
        let open = Frame::amqp(
            0,
            Open {
                container_id: "peer".into(),
                ..Open::default()
            },
        );
        let begin = Frame::amqp(
            1,
            Begin {
                next_outgoing_id: SequenceNumber(0),
                incoming_window: 100,
                outgoing_window: 100,
                ..Begin::default()
            },
        );
        let transfer = Frame::with_payload(
            1,
            Transfer {
                handle: 0,
                delivery_id: Some(SequenceNumber(0)),
                delivery_tag: Some(Bytes::from_static(b"t")),
                ..Transfer::default()
            },
            Bytes::from_static(b"hello world"),
        );
        encoder.encode(&open, &mut buf).unwrap();
        encoder.encode(&begin, &mut buf).unwrap();
        buf.put_slice(&HEARTBEAT);
        encoder.encode(&transfer, &mut buf).unwrap();
        let expected = vec![
            ReadEvent::Header(ProtocolHeader::Amqp),
            ReadEvent::Frame(open),
            ReadEvent::Frame(begin),
            ReadEvent::Heartbeat,
            ReadEvent::Frame(transfer),
        ];
        (buf.freeze(), expected)
    }

    fn feed(chunks: &[Bytes]) -> Vec<ReadEvent> {
        let mut parser = FrameParser::new(u32::MAX);
        let mut events = Vec::new();
        for chunk in chunks {
            let mut chunk = chunk.clone();
            parser.parse(&mut chunk, &mut events).unwrap();
            assert!(chunk.is_empty());
        }
        events
    }

    #[test]
    fn whole_input_in_one_read() {
        let (bytes, expected) = wire();
        assert_eq!(feed(&[bytes]), expected);
    }

    #[test]
    fn one_byte_at_a_time() {
        let (bytes, expected) = wire();
        let chunks: Vec<Bytes> = (0..bytes.len()).map(|i| bytes.slice(i..=i)).collect();
        assert_eq!(feed(&chunks), expected);
    }

    #[test]
    fn every_two_and_three_read_split() {
        let (bytes, expected) = wire();
        let len = bytes.len();
        for a in 1..len {
            assert_eq!(feed(&[bytes.slice(..a), bytes.slice(a..)]), expected);
        }
        for a in (1..len).step_by(3) {
            for b in (a + 1..len).step_by(5) {
                let chunks = [bytes.slice(..a), bytes.slice(a..b), bytes.slice(b..)];
                assert_eq!(feed(&chunks), expected, "split at {a}/{b}");
            }
        }
    }

    #[test]
    fn payload_shares_input_storage() {
        let (bytes, _) = wire();
        let mut parser = FrameParser::new(u32::MAX);
        let mut events = Vec::new();
        parser.parse(&mut bytes.clone(), &mut events).unwrap();
        let Some(ReadEvent::Frame(Frame {
            payload: Some(payload),
            ..
        })) = events.last()
        else {
            panic!("expected transfer with payload");
        };
        let range = bytes.as_ptr_range();
        assert!(range.contains(&payload.as_ptr()));
    }

    #[test]
    fn heartbeat_is_reported() {
        let mut parser = FrameParser::new(512);
        let mut input = BytesMut::new();
        input.put_slice(&ProtocolHeader::Amqp.to_bytes());
        input.put_slice(&HEARTBEAT);
        let mut events = Vec::new();
        parser.parse(&mut input.freeze(), &mut events).unwrap();
        assert_eq!(events[1], ReadEvent::Heartbeat);
    }

    #[test]
    fn frame_size_below_header_is_sticky() {
        let mut parser = FrameParser::new(512);
        let mut input = Bytes::from_static(b"AMQP\x00\x01\x00\x00\x00\x00\x00\x07");
        let mut events = Vec::new();
        let err = parser.parse(&mut input, &mut events).unwrap_err();
        assert_eq!(err, Error::FrameTooSmall { size: 7 });
        assert_eq!(
            err.to_string(),
            "frame size 7 is smaller than minimum frame size 8"
        );
        assert_eq!(parser.stage(), ParserStage::Error);

        let mut more = Bytes::from_static(&HEARTBEAT);
        assert_eq!(parser.parse(&mut more, &mut events), Err(err));
        assert_eq!(more.len(), HEARTBEAT.len());
        assert_eq!(events, vec![ReadEvent::Header(ProtocolHeader::Amqp)]);
    }

    #[test]
    fn oversized_frame_rejected_before_body() {
        let mut parser = FrameParser::new(512);
        let mut events = Vec::new();
        let mut input = Bytes::from_static(b"AMQP\x00\x01\x00\x00\x00\x00\x04\x00");
        assert_eq!(
            parser.parse(&mut input, &mut events),
            Err(Error::FrameTooLarge { size: 1024, max: 512 })
        );
    }

    #[test]
    fn bad_data_offset_is_rejected() {
        let mut parser = FrameParser::new(512);
        let mut events = Vec::new();
        let mut input = Bytes::from_static(b"AMQP\x00\x01\x00\x00\x00\x00\x00\x08\x01\x00\x00\x00");
        assert_eq!(
            parser.parse(&mut input, &mut events),
            Err(Error::InvalidDataOffset { doff: 1, size: 8 })
        );
    }

    #[test]
    fn undecodable_body_is_a_decode_error() {
        let mut parser = FrameParser::new(512);
        let mut events = Vec::new();
        let mut input =
            Bytes::from_static(b"AMQP\x00\x01\x00\x00\x00\x00\x00\x0c\x02\x00\x00\x00\x00\x53\x01\x45");
        let err = parser.parse(&mut input, &mut events).unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::UnknownDescriptor(_))));
    }

    #[test]
    fn sasl_outcome_rearms_header_parsing() {
        let encoder = FrameEncoder::new(u32::MAX);
        let mut buf = BytesMut::new();
        buf.put_slice(&ProtocolHeader::Sasl.to_bytes());
        let outcome = Frame::sasl(SaslOutcome {
            code: SaslCode::Ok,
            additional_data: None,
        });
        encoder.encode(&outcome, &mut buf).unwrap();
        buf.put_slice(&ProtocolHeader::Amqp.to_bytes());
        let close = Frame::amqp(0, Close::default());
        encoder.encode(&close, &mut buf).unwrap();

        let events = feed(&[buf.freeze()]);
        assert_eq!(
            events,
            vec![
                ReadEvent::Header(ProtocolHeader::Sasl),
                ReadEvent::Frame(outcome),
                ReadEvent::Header(ProtocolHeader::Amqp),
                ReadEvent::Frame(Frame {
                    channel: 0,
                    body: FrameBody::Amqp(Performative::Close(Close::default())),
                    payload: None,
                }),
            ]
        );
    }

    fn init_frame() -> Frame {
        Frame::sasl(SaslInit {
            mechanism: Symbol::new("ANONYMOUS"),
            initial_response: None,
            hostname: None,
        })
    }

    #[test]
    fn sasl_init_holds_pipelined_header() {
        let encoder = FrameEncoder::new(u32::MAX);
        let mut buf = BytesMut::new();
        buf.put_slice(&ProtocolHeader::Sasl.to_bytes());
        encoder.encode(&init_frame(), &mut buf).unwrap();
        buf.put_slice(&ProtocolHeader::Amqp.to_bytes());

        let mut parser = FrameParser::new(u32::MAX);
        let mut events = Vec::new();
        let mut input = buf.freeze();
        parser.parse(&mut input, &mut events).unwrap();
        assert_eq!(
            events,
            vec![ReadEvent::Header(ProtocolHeader::Sasl), ReadEvent::Frame(init_frame())]
        );
        assert_eq!(parser.stage(), ParserStage::SaslReplyPending);
        assert_eq!(&input[..], &ProtocolHeader::Amqp.to_bytes());

        parser.parse(&mut input, &mut events).unwrap();
        assert_eq!(input.len(), HEADER_SIZE);

        parser.reset_to_header();
        events.clear();
        parser.parse(&mut input, &mut events).unwrap();
        assert_eq!(events, vec![ReadEvent::Header(ProtocolHeader::Amqp)]);
        assert!(input.is_empty());
    }

    #[test]
    fn resume_continues_with_frames() {
        let mut parser = FrameParser::new(u32::MAX);
        let mut buf = BytesMut::new();
        buf.put_slice(&ProtocolHeader::Sasl.to_bytes());
        FrameEncoder::default().encode(&init_frame(), &mut buf).unwrap();
        let mut events = Vec::new();
        parser.parse(&mut buf.freeze(), &mut events).unwrap();
        assert!(parser.is_paused());
        parser.resume_frames();
        assert_eq!(parser.stage(), ParserStage::FrameSizeParsing);
    }

    #[test]
    fn sasl_frame_trailing_bytes_are_ignored() {
        let mut frame = BytesMut::new();
        FrameEncoder::default().encode(&init_frame(), &mut frame).unwrap();
        frame.put_slice(&[1, 2, 3]);
        let size = u32::try_from(frame.len()).unwrap();
        frame[..4].copy_from_slice(&size.to_be_bytes());

        let mut buf = BytesMut::new();
        buf.put_slice(&ProtocolHeader::Sasl.to_bytes());
        buf.put_slice(&frame);
        let events = feed(&[buf.freeze()]);
        assert_eq!(events[1], ReadEvent::Frame(init_frame()));
    }
}
