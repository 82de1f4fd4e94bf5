//! Property tests for the type codec and the frame parser.

use amqp_engine::codec::{self, MAX_NESTING_DEPTH, Map, Symbol, Value};
use amqp_engine::error::DecodeError;
use amqp_engine::frame::{Frame, FrameEncoder, FrameParser, ReadEvent};
use amqp_engine::types::{SequenceNumber, Transfer};
use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

const AMQP_HEADER: &[u8; 8] = b"AMQP\x00\x01\x00\x00";

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<u8>().prop_map(Value::Ubyte),
        any::<u16>().prop_map(Value::Ushort),
        any::<u32>().prop_map(Value::Uint),
        any::<u64>().prop_map(Value::Ulong),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        any::<char>().prop_map(Value::Char),
        prop::collection::vec(any::<u8>(), 0..300).prop_map(|v| Value::Binary(v.into())),
        ".{0,40}".prop_map(Value::String),
        "[a-z:]{0,20}".prop_map(|s| Value::Symbol(Symbol::new(s))),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
            prop::collection::vec((any::<u32>(), inner), 0..6).prop_map(|entries| {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(Value::Uint(key), value);
                }
                Value::Map(map)
            }),
        ]
    })
}

fn encode(value: &Value) -> BytesMut {
    let mut buf = BytesMut::new();
    codec::encode(value, &mut buf).unwrap();
    buf
}

const DESCRIBED: u8 = 0;
const LIST: u8 = 1;

/// Nest a null inside one described, list32 or map32 wrapper per level,
/// outermost first.
fn nested(levels: &[u8]) -> Bytes {
    let header_len = |level: u8| match level {
        DESCRIBED => 2,
        LIST => 9,
        _ => 10,
    };
    let mut lengths = vec![1usize; levels.len() + 1];
    for (i, level) in levels.iter().enumerate().rev() {
        lengths[i] = header_len(*level) + lengths[i + 1];
    }
    let mut out = BytesMut::with_capacity(lengths[0]);
    for (i, level) in levels.iter().enumerate() {
        let size = lengths[i].saturating_sub(5) as u32;
        match *level {
            DESCRIBED => out.extend_from_slice(&[0x00, 0x44]),
            LIST => {
                out.extend_from_slice(&[0xd0]);
                out.extend_from_slice(&size.to_be_bytes());
                out.extend_from_slice(&1u32.to_be_bytes());
            }
            _ => {
                out.extend_from_slice(&[0xd1]);
                out.extend_from_slice(&size.to_be_bytes());
                out.extend_from_slice(&2u32.to_be_bytes());
                out.extend_from_slice(&[0x40]);
            }
        }
    }
    out.extend_from_slice(&[0x40]);
    out.freeze()
}

fn transfer_stream(payloads: &[Vec<u8>]) -> Bytes {
    let encoder = FrameEncoder::new(u32::MAX);
    let mut out = BytesMut::from(&AMQP_HEADER[..]);
    for (id, payload) in payloads.iter().enumerate() {
        let transfer = Transfer {
            handle: 0,
            delivery_id: Some(SequenceNumber(id as u32)),
            delivery_tag: Some(Bytes::from(id.to_be_bytes().to_vec())),
            ..Transfer::default()
        };
        let frame = Frame::with_payload(1, transfer, Bytes::from(payload.clone()));
        encoder.encode(&frame, &mut out).unwrap();
    }
    out.freeze()
}

proptest! {
    #[test]
    fn values_survive_encoding(value in value()) {
        let mut bytes = encode(&value).freeze();
        prop_assert_eq!(codec::decode_value(&mut bytes).unwrap(), value);
        prop_assert!(bytes.is_empty());
    }

    #[test]
    fn skip_consumes_exactly_one_value(value in value(), trailer in any::<u8>()) {
        let mut buf = encode(&value);
        buf.extend_from_slice(&[trailer]);
        let mut bytes = buf.freeze();
        codec::skip(&mut bytes).unwrap();
        prop_assert_eq!(&bytes[..], &[trailer]);
    }

    #[test]
    fn uint_uses_narrowest_constructor(n in any::<u32>()) {
        let expected = match n {
            0 => 1,
            1..=255 => 2,
            _ => 5,
        };
        prop_assert_eq!(encode(&Value::Uint(n)).len(), expected);
    }

    #[test]
    fn decoder_rejects_garbage_without_panicking(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut bytes = Bytes::from(data);
        let _ = codec::decode_value(&mut bytes);
    }

    #[test]
    fn deep_nesting_is_rejected_without_overflowing(
        extra in 1usize..30_000,
        pattern in prop::collection::vec(0u8..3, 1..6),
    ) {
        let levels: Vec<u8> = pattern.iter().copied().cycle().take(MAX_NESTING_DEPTH + extra).collect();
        let wire = nested(&levels);
        let too_deep = DecodeError::NestingTooDeep { max: MAX_NESTING_DEPTH };
        prop_assert_eq!(codec::decode_value(&mut wire.clone()).err(), Some(too_deep.clone()));
        if levels.iter().all(|level| *level == DESCRIBED) {
            prop_assert_eq!(codec::skip(&mut wire.clone()).err(), Some(too_deep));
        }
    }

    #[test]
    fn parser_rejects_garbage_without_panicking(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut input = BytesMut::from(&AMQP_HEADER[..]);
        input.extend_from_slice(&data);
        let mut parser = FrameParser::new(4096);
        let mut events = Vec::new();
        let mut input = input.freeze();
        if parser.parse(&mut input, &mut events).is_err() {
            prop_assert!(parser.is_failed());
            prop_assert!(parser.parse(&mut Bytes::from_static(b"more"), &mut events).is_err());
        }
    }

    #[test]
    fn frame_boundaries_do_not_depend_on_read_sizes(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..200), 1..6),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let stream = transfer_stream(&payloads);

        let mut whole = Vec::new();
        FrameParser::new(u32::MAX).parse(&mut stream.clone(), &mut whole).unwrap();
        prop_assert_eq!(whole.len(), payloads.len() + 1);

        let mut offsets: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len())).collect();
        offsets.push(stream.len());
        offsets.sort_unstable();
        let mut parser = FrameParser::new(u32::MAX);
        let mut pieces = Vec::new();
        let mut start = 0;
        for end in offsets {
            let mut chunk = stream.slice(start..end);
            parser.parse(&mut chunk, &mut pieces).unwrap();
            prop_assert!(chunk.is_empty());
            start = end;
        }
        prop_assert_eq!(&pieces, &whole);
        for (event, payload) in whole.iter().skip(1).zip(&payloads) {
            let ReadEvent::Frame(frame) = event else {
                return Err(TestCaseError::fail("expected a frame"));
            };
            prop_assert_eq!(frame.payload.as_deref(), Some(&payload[..]));
        }
    }

    #[test]
    fn sequence_numbers_order_across_wrap(start in any::<u32>(), step in 1u32..0x8000_0000) {
        let a = SequenceNumber(start);
        let b = a.add(step);
        prop_assert!(b > a);
        prop_assert!(a < b);
        prop_assert_eq!(b.distance_from(a), step);
        prop_assert!(a.add(step / 2).within(a, b));
    }
}
