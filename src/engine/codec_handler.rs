//! Byte-level handlers: the frame codec and the frame logger.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use super::pipeline::{EngineHandler, HandlerContext, Inbound, Outbound, TransportLimits};
use crate::error::{Error, Result};
use crate::frame::{FrameBody, FrameEncoder, FrameParser, HEADER_SIZE, ReadEvent};
use crate::metrics::{FrameDirection, Metrics};
use crate::types::{SaslCode, SaslPerformative, conditions};

/// Name of [`FrameCodecHandler`] in the pipeline.
pub const FRAME_CODEC: &str = "frame-codec";
/// Name of [`FrameLoggerHandler`] in the pipeline.
pub const FRAME_LOGGER: &str = "frame-logger";

/// Turns transport bytes into frames and frames into bytes.
///
/// Bytes arriving while the parser waits for a SASL reply are held and
/// replayed once that reply has been encoded.
#[derive(Debug)]
pub struct FrameCodecHandler {
    parser: FrameParser,
    encoder: FrameEncoder,
    events: Vec<ReadEvent>,
    held: BytesMut,
}

impl FrameCodecHandler {
    /// Codec accepting inbound frames up to `max_inbound_frame_size`.
    #[must_use]
    pub fn new(max_inbound_frame_size: u32) -> Self {
        Self {
            parser: FrameParser::new(max_inbound_frame_size),
            encoder: FrameEncoder::default(),
            events: Vec::new(),
            held: BytesMut::new(),
        }
    }

    fn parse(&mut self, ctx: &mut HandlerContext, mut input: Bytes) -> Result<()> {
        let result = self.parser.parse(&mut input, &mut self.events);
        for event in self.events.drain(..) {
            let item = match event {
                ReadEvent::Header(header) => Inbound::Header(header),
                ReadEvent::Frame(frame) => {
                    Metrics::record_frame(FrameDirection::Inbound, &frame.body);
                    Inbound::Frame(frame)
                }
                ReadEvent::Heartbeat => {
                    Metrics::record_heartbeat(FrameDirection::Inbound);
                    Inbound::Heartbeat
                }
            };
            ctx.fire_read(item);
        }
        result?;
        if !input.is_empty() {
            self.hold(&input)?;
        }
        Ok(())
    }

    fn hold(&mut self, input: &[u8]) -> Result<()> {
        let limit = self.parser.max_frame_size() as usize + HEADER_SIZE;
        if self.held.len() + input.len() > limit {
            let err = Error::protocol(
                conditions::FRAMING_ERROR,
                "too much input before SASL reply",
            );
            self.parser.fail(err.clone());
            return Err(err);
        }
        trace!(held = self.held.len() + input.len(), "holding input for SASL reply");
        self.held.extend_from_slice(input);
        Ok(())
    }

    fn replay(&mut self, ctx: &mut HandlerContext) -> Result<()> {
        if self.held.is_empty() || self.parser.is_paused() {
            return Ok(());
        }
        let input = self.held.split().freeze();
        debug!(bytes = input.len(), "replaying input held for SASL reply");
        self.parse(ctx, input)
    }
}

impl EngineHandler for FrameCodecHandler {
    fn name(&self) -> &'static str {
        FRAME_CODEC
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext, item: Inbound) -> Result<()> {
        let Inbound::Bytes(input) = item else {
            ctx.fire_read(item);
            return Ok(());
        };
        Metrics::record_bytes(FrameDirection::Inbound, input.len());
        if self.parser.is_paused() {
            return self.hold(&input);
        }
        self.parse(ctx, input)
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext, item: Outbound) -> Result<()> {
        let mut out = BytesMut::new();
        let mut sasl_reply = false;
        match item {
            Outbound::Bytes(_) => {
                ctx.fire_write(item);
                return Ok(());
            }
            Outbound::Header(header) => {
                out.reserve(HEADER_SIZE);
                out.extend_from_slice(&header.to_bytes());
            }
            Outbound::Heartbeat => {
                FrameEncoder::encode_heartbeat(&mut out);
                Metrics::record_heartbeat(FrameDirection::Outbound);
            }
            Outbound::Frame(frame) => {
                let size = self.encoder.encode(&frame, &mut out)?;
                Metrics::record_frame(FrameDirection::Outbound, &frame.body);
                Metrics::record_frame_size(u32::try_from(size).unwrap_or(u32::MAX));
                match &frame.body {
                    FrameBody::Sasl(SaslPerformative::Outcome(outcome)) => {
                        self.parser.reset_to_header();
                        if outcome.code == SaslCode::Ok {
                            sasl_reply = true;
                        } else {
                            self.held.clear();
                        }
                    }
                    FrameBody::Sasl(
                        SaslPerformative::Init(_)
                        | SaslPerformative::Challenge(_)
                        | SaslPerformative::Response(_),
                    ) => {
                        self.parser.resume_frames();
                        sasl_reply = true;
                    }
                    FrameBody::Sasl(SaslPerformative::Mechanisms(_)) | FrameBody::Amqp(_) => {}
                }
            }
        }
        Metrics::record_bytes(FrameDirection::Outbound, out.len());
        ctx.fire_write(Outbound::Bytes(out.freeze()));
        if sasl_reply {
            self.replay(ctx)?;
        }
        Ok(())
    }

    fn configure(&mut self, limits: TransportLimits) {
        debug!(
            inbound = limits.max_inbound_frame_size,
            outbound = limits.max_outbound_frame_size,
            "frame limits"
        );
        self.parser.set_max_frame_size(limits.max_inbound_frame_size);
        self.encoder.set_max_frame_size(limits.max_outbound_frame_size);
    }
}

/// Traces every frame passing between the codec and the engine.
#[derive(Debug, Default)]
pub struct FrameLoggerHandler;

impl EngineHandler for FrameLoggerHandler {
    fn name(&self) -> &'static str {
        FRAME_LOGGER
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext, item: Inbound) -> Result<()> {
        match &item {
            Inbound::Header(header) => trace!(target: "amqp_engine::frames", %header, "RECV"),
            Inbound::Frame(frame) => trace!(
                target: "amqp_engine::frames",
                channel = frame.channel,
                body = ?frame.body,
                payload = frame.payload.as_ref().map_or(0, bytes::Bytes::len),
                "RECV"
            ),
            Inbound::Heartbeat => trace!(target: "amqp_engine::frames", "RECV heartbeat"),
            Inbound::Bytes(_) | Inbound::SaslOutcome(_) => {}
        }
        ctx.fire_read(item);
        Ok(())
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext, item: Outbound) -> Result<()> {
        match &item {
            Outbound::Header(header) => trace!(target: "amqp_engine::frames", %header, "SENT"),
            Outbound::Frame(frame) => trace!(
                target: "amqp_engine::frames",
                channel = frame.channel,
                body = ?frame.body,
                payload = frame.payload.as_ref().map_or(0, bytes::Bytes::len),
                "SENT"
            ),
            Outbound::Heartbeat => trace!(target: "amqp_engine::frames", "SENT heartbeat"),
            Outbound::Bytes(_) => {}
        }
        ctx.fire_write(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::frame::{Frame, ProtocolHeader};
    use crate::codec::Symbol;
    use crate::frame::FrameEncoder;
    use crate::types::{Close, Open, SaslInit, SaslMechanisms, SaslOutcome};

    fn run_write(codec: &mut FrameCodecHandler, item: Outbound) -> Bytes {
        let mut ctx = HandlerContext::default();
        codec.handle_write(&mut ctx, item).unwrap();
        match ctx.into_parts().1.pop() {
            Some(Outbound::Bytes(bytes)) => bytes,
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn written_frames_parse_back() {
        let mut codec = FrameCodecHandler::new(u32::MAX);
        let mut wire = Vec::new();
        wire.extend_from_slice(&run_write(&mut codec, Outbound::Header(ProtocolHeader::Amqp)));
        wire.extend_from_slice(&run_write(
            &mut codec,
            Outbound::Frame(Frame::amqp(0, Open {
                container_id: "c".into(),
                ..Open::default()
            })),
        ));
        wire.extend_from_slice(&run_write(&mut codec, Outbound::Heartbeat));

        let mut ctx = HandlerContext::default();
        codec.handle_read(&mut ctx, Inbound::Bytes(Bytes::from(wire))).unwrap();
        let reads = ctx.into_parts().0;
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[0], Inbound::Header(ProtocolHeader::Amqp));
        assert!(matches!(reads[1], Inbound::Frame(_)));
        assert_eq!(reads[2], Inbound::Heartbeat);
    }

    #[test]
    fn writing_an_outcome_rearms_the_header() {
        let mut codec = FrameCodecHandler::new(u32::MAX);
        let mut ctx = HandlerContext::default();
        codec
            .handle_read(&mut ctx, Inbound::Bytes(Bytes::copy_from_slice(&ProtocolHeader::Sasl.to_bytes())))
            .unwrap();
        run_write(
            &mut codec,
            Outbound::Frame(Frame::sasl(SaslOutcome {
                code: SaslCode::Ok,
                additional_data: None,
            })),
        );
        let mut ctx = HandlerContext::default();
        codec
            .handle_read(&mut ctx, Inbound::Bytes(Bytes::copy_from_slice(&ProtocolHeader::Amqp.to_bytes())))
            .unwrap();
        assert_eq!(ctx.into_parts().0, vec![Inbound::Header(ProtocolHeader::Amqp)]);
    }

    fn pipelined_client_input() -> Bytes {
        let encoder = FrameEncoder::new(u32::MAX);
        let mut wire = BytesMut::from(&ProtocolHeader::Sasl.to_bytes()[..]);
        let init = Frame::sasl(SaslInit {
            mechanism: Symbol::new("ANONYMOUS"),
            initial_response: None,
            hostname: None,
        });
        encoder.encode(&init, &mut wire).unwrap();
        wire.extend_from_slice(&ProtocolHeader::Amqp.to_bytes());
        let open = Frame::amqp(0, Open {
            container_id: "client".into(),
            ..Open::default()
        });
        encoder.encode(&open, &mut wire).unwrap();
        wire.freeze()
    }

    fn outcome(code: SaslCode) -> Outbound {
        Outbound::Frame(Frame::sasl(SaslOutcome {
            code,
            additional_data: None,
        }))
    }

    #[test]
    fn input_after_sasl_init_waits_for_the_outcome() {
        let mut codec = FrameCodecHandler::new(u32::MAX);
        let mut ctx = HandlerContext::default();
        codec.handle_read(&mut ctx, Inbound::Bytes(pipelined_client_input())).unwrap();
        let reads = ctx.into_parts().0;
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0], Inbound::Header(ProtocolHeader::Sasl));
        assert!(matches!(
            &reads[1],
            Inbound::Frame(Frame { body: FrameBody::Sasl(SaslPerformative::Init(_)), .. })
        ));

        let mechanisms = Outbound::Frame(Frame::sasl(SaslMechanisms {
            mechanisms: vec![Symbol::new("ANONYMOUS")],
        }));
        let mut ctx = HandlerContext::default();
        codec.handle_write(&mut ctx, mechanisms).unwrap();
        assert!(ctx.into_parts().0.is_empty());

        let mut ctx = HandlerContext::default();
        codec.handle_write(&mut ctx, outcome(SaslCode::Ok)).unwrap();
        let (reads, writes) = ctx.into_parts();
        assert_eq!(writes.len(), 1);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0], Inbound::Header(ProtocolHeader::Amqp));
        assert!(matches!(
            &reads[1],
            Inbound::Frame(Frame { body: FrameBody::Amqp(_), .. })
        ));
    }

    #[test]
    fn rejected_client_input_is_not_replayed() {
        let mut codec = FrameCodecHandler::new(u32::MAX);
        let mut ctx = HandlerContext::default();
        codec.handle_read(&mut ctx, Inbound::Bytes(pipelined_client_input())).unwrap();

        let mut ctx = HandlerContext::default();
        codec.handle_write(&mut ctx, outcome(SaslCode::Auth)).unwrap();
        assert!(ctx.into_parts().0.is_empty());
    }

    #[test]
    fn held_input_is_bounded() {
        let mut codec = FrameCodecHandler::new(512);
        let mut ctx = HandlerContext::default();
        codec.handle_read(&mut ctx, Inbound::Bytes(pipelined_client_input())).unwrap();
        let mut ctx = HandlerContext::default();
        let flood = Inbound::Bytes(Bytes::from(vec![0u8; 1024]));
        let err = codec.handle_read(&mut ctx, flood).unwrap_err();
        assert_eq!(err.condition(), conditions::FRAMING_ERROR);
    }

    #[test]
    fn outbound_limit_is_applied() {
        let mut codec = FrameCodecHandler::new(u32::MAX);
        codec.configure(TransportLimits {
            max_inbound_frame_size: 512,
            max_outbound_frame_size: 512,
        });
        let frame = Frame::with_payload(0, Close::default(), Bytes::from(vec![0u8; 600]));
        let mut ctx = HandlerContext::default();
        assert!(codec.handle_write(&mut ctx, Outbound::Frame(frame)).is_err());
    }
}
