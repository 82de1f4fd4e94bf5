//! AMQP 1.0 type system codec
//!
//! Values are decoded straight out of a [`bytes::Bytes`] cursor, so binary and
//! string payloads share storage with the frame they came from.
//!
//! ```rust
//! use amqp_engine::codec::{self, Value};
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! codec::encode(&Value::Uint(7), &mut buf)?;
//! assert_eq!(&buf[..], &[0x52, 7]);
//!
//! let value = codec::decode_value(&mut buf.freeze())?;
//! assert_eq!(value, Value::Uint(7));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod constants;
mod decoder;
mod described;
mod encoder;
mod value;

pub use decoder::{
    AmqpDecode, MAX_NESTING_DEPTH, MAX_ZERO_WIDTH_ARRAY, TypeDecoder, decode, decode_value,
    read_type_decoder, skip,
};
pub use described::{
    DescribedType, FieldReader, FieldWriter, FromDescribed, decode_described,
    encode_described_to_bytes,
};
pub use encoder::{AmqpEncode, encode};
pub use value::{
    Array, Decimal32, Decimal64, Decimal128, Described, Descriptor, Map, Symbol, Timestamp, Value,
};

pub(crate) use decoder::{read_descriptor, take_u8};
pub(crate) use encoder::{write_symbol, write_ulong};
