//! AMQP value encoder.
//!
//! Scalars use the narrowest constructor the value fits. Compound sizes are
//! written as 32-bit placeholders and back-patched once the body is known,
//! then compacted into the 8-bit form when it fits.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants as codes;
use super::value::{Array, Descriptor, Map, Symbol, Timestamp, Value};
use crate::error::EncodeError;

/// Encode `value` at the end of `buf`, returning the number of bytes written.
pub fn encode(value: &Value, buf: &mut BytesMut) -> Result<usize, EncodeError> {
    let start = buf.len();
    write_value(value, buf)?;
    Ok(buf.len() - start)
}

/// Types that can write themselves, constructor included.
pub trait AmqpEncode {
    /// Append the encoded value to `buf`.
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

pub(crate) fn write_value(value: &Value, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match value {
        Value::Null => buf.put_u8(codes::NULL),
        Value::Bool(v) => write_bool(*v, buf),
        Value::Ubyte(v) => {
            buf.put_u8(codes::UBYTE);
            buf.put_u8(*v);
        }
        Value::Ushort(v) => {
            buf.put_u8(codes::USHORT);
            buf.put_u16(*v);
        }
        Value::Uint(v) => write_uint(*v, buf),
        Value::Ulong(v) => write_ulong(*v, buf),
        Value::Byte(v) => {
            buf.put_u8(codes::BYTE);
            buf.put_i8(*v);
        }
        Value::Short(v) => {
            buf.put_u8(codes::SHORT);
            buf.put_i16(*v);
        }
        Value::Int(v) => write_int(*v, buf),
        Value::Long(v) => write_long(*v, buf),
        Value::Float(v) => {
            buf.put_u8(codes::FLOAT);
            buf.put_f32(*v);
        }
        Value::Double(v) => {
            buf.put_u8(codes::DOUBLE);
            buf.put_f64(*v);
        }
        Value::Decimal32(v) => {
            buf.put_u8(codes::DECIMAL32);
            buf.put_slice(&v.0);
        }
        Value::Decimal64(v) => {
            buf.put_u8(codes::DECIMAL64);
            buf.put_slice(&v.0);
        }
        Value::Decimal128(v) => {
            buf.put_u8(codes::DECIMAL128);
            buf.put_slice(&v.0);
        }
        Value::Char(v) => {
            buf.put_u8(codes::CHAR);
            buf.put_u32(u32::from(*v));
        }
        Value::Timestamp(v) => write_timestamp(*v, buf),
        Value::Uuid(v) => {
            buf.put_u8(codes::UUID);
            buf.put_slice(v.as_bytes());
        }
        Value::Binary(v) => write_binary(v, buf)?,
        Value::String(v) => write_string(v, buf)?,
        Value::Symbol(v) => write_symbol(v.as_str(), buf)?,
        Value::List(items) => write_list(items, buf)?,
        Value::Map(map) => write_map(map, buf)?,
        Value::Array(array) => write_array(array, buf)?,
        Value::Described(described) => {
            buf.put_u8(codes::DESCRIBED_TYPE_INDICATOR);
            write_descriptor(&described.descriptor, buf)?;
            write_value(&described.value, buf)?;
        }
    }
    Ok(())
}

pub(crate) fn write_bool(value: bool, buf: &mut BytesMut) {
    buf.put_u8(if value {
        codes::BOOLEAN_TRUE
    } else {
        codes::BOOLEAN_FALSE
    });
}

pub(crate) fn write_uint(value: u32, buf: &mut BytesMut) {
    match value {
        0 => buf.put_u8(codes::UINT0),
        1..=255 => {
            buf.put_u8(codes::SMALLUINT);
            buf.put_u8(value as u8);
        }
        _ => {
            buf.put_u8(codes::UINT);
            buf.put_u32(value);
        }
    }
}

pub(crate) fn write_ulong(value: u64, buf: &mut BytesMut) {
    match value {
        0 => buf.put_u8(codes::ULONG0),
        1..=255 => {
            buf.put_u8(codes::SMALLULONG);
            buf.put_u8(value as u8);
        }
        _ => {
            buf.put_u8(codes::ULONG);
            buf.put_u64(value);
        }
    }
}

pub(crate) fn write_int(value: i32, buf: &mut BytesMut) {
    if let Ok(small) = i8::try_from(value) {
        buf.put_u8(codes::SMALLINT);
        buf.put_i8(small);
    } else {
        buf.put_u8(codes::INT);
        buf.put_i32(value);
    }
}

pub(crate) fn write_long(value: i64, buf: &mut BytesMut) {
    if let Ok(small) = i8::try_from(value) {
        buf.put_u8(codes::SMALLLONG);
        buf.put_i8(small);
    } else {
        buf.put_u8(codes::LONG);
        buf.put_i64(value);
    }
}

pub(crate) fn write_timestamp(value: Timestamp, buf: &mut BytesMut) {
    buf.put_u8(codes::TIMESTAMP);
    buf.put_i64(value.0);
}

fn write_variable(code8: u8, code32: u8, data: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    if let Ok(len) = u8::try_from(data.len()) {
        buf.put_u8(code8);
        buf.put_u8(len);
    } else {
        let len = u32::try_from(data.len()).map_err(|_| EncodeError::ValueTooLarge(data.len()))?;
        buf.put_u8(code32);
        buf.put_u32(len);
    }
    buf.put_slice(data);
    Ok(())
}

pub(crate) fn write_binary(value: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_variable(codes::VBIN8, codes::VBIN32, value, buf)
}

pub(crate) fn write_string(value: &str, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_variable(codes::STR8, codes::STR32, value.as_bytes(), buf)
}

pub(crate) fn write_symbol(value: &str, buf: &mut BytesMut) -> Result<(), EncodeError> {
    write_variable(codes::SYM8, codes::SYM32, value.as_bytes(), buf)
}

pub(crate) fn write_descriptor(descriptor: &Descriptor, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match descriptor {
        Descriptor::Code(code) => {
            write_ulong(*code, buf);
            Ok(())
        }
        Descriptor::Symbol(name) => write_symbol(name.as_str(), buf),
    }
}

/// Write a compound header with 32-bit placeholders and return its start offset.
pub(crate) fn begin_compound(code32: u8, buf: &mut BytesMut) -> usize {
    let start = buf.len();
    buf.put_u8(code32);
    buf.put_u32(0);
    buf.put_u32(0);
    start
}

/// Back-patch size and count of a compound started with [`begin_compound`].
///
/// `code8` is the short form to compact into; `empty` is the zero-width code
/// used when `count` is zero (only lists have one).
pub(crate) fn finish_compound(
    start: usize,
    count: usize,
    code8: u8,
    empty: Option<u8>,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if count == 0 {
        if let Some(code) = empty {
            buf.truncate(start);
            buf.put_u8(code);
            return Ok(());
        }
    }
    let body_len = buf.len() - start - 9;
    if body_len < 255 && count <= 255 {
        buf[start] = code8;
        buf[start + 1] = (body_len + 1) as u8;
        buf[start + 2] = count as u8;
        let end = buf.len();
        buf.copy_within(start + 9..end, start + 3);
        buf.truncate(end - 6);
        return Ok(());
    }
    let size = u32::try_from(body_len + 4).map_err(|_| EncodeError::ValueTooLarge(body_len))?;
    let count = u32::try_from(count).map_err(|_| EncodeError::ValueTooLarge(count))?;
    buf[start + 1..start + 5].copy_from_slice(&size.to_be_bytes());
    buf[start + 5..start + 9].copy_from_slice(&count.to_be_bytes());
    Ok(())
}

pub(crate) fn write_list(items: &[Value], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let start = begin_compound(codes::LIST32, buf);
    for item in items {
        write_value(item, buf)?;
    }
    finish_compound(start, items.len(), codes::LIST8, Some(codes::LIST0), buf)
}

pub(crate) fn write_map(map: &Map, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let start = begin_compound(codes::MAP32, buf);
    for (key, value) in map.iter() {
        write_value(key, buf)?;
        write_value(value, buf)?;
    }
    finish_compound(start, map.len() * 2, codes::MAP8, None, buf)
}

/// Shared array element constructor.
#[derive(Debug, Clone, PartialEq)]
enum ArrayConstructor {
    Primitive(u8),
    Described(Descriptor, Box<ArrayConstructor>),
}

/// Width rank within one type family; larger wins when elements are merged.
const fn width_rank(code: u8) -> u8 {
    match code {
        codes::UINT0 | codes::ULONG0 => 0,
        codes::SMALLUINT | codes::SMALLULONG | codes::SMALLINT | codes::SMALLLONG => 1,
        codes::VBIN8 | codes::STR8 | codes::SYM8 => 1,
        _ => 2,
    }
}

fn narrowest_element(value: &Value) -> ArrayConstructor {
    let code = match value {
        Value::Null => codes::NULL,
        Value::Bool(_) => codes::BOOLEAN,
        Value::Ubyte(_) => codes::UBYTE,
        Value::Ushort(_) => codes::USHORT,
        Value::Uint(0) => codes::UINT0,
        Value::Uint(v) if *v <= 255 => codes::SMALLUINT,
        Value::Uint(_) => codes::UINT,
        Value::Ulong(0) => codes::ULONG0,
        Value::Ulong(v) if *v <= 255 => codes::SMALLULONG,
        Value::Ulong(_) => codes::ULONG,
        Value::Byte(_) => codes::BYTE,
        Value::Short(_) => codes::SHORT,
        Value::Int(v) if i8::try_from(*v).is_ok() => codes::SMALLINT,
        Value::Int(_) => codes::INT,
        Value::Long(v) if i8::try_from(*v).is_ok() => codes::SMALLLONG,
        Value::Long(_) => codes::LONG,
        Value::Float(_) => codes::FLOAT,
        Value::Double(_) => codes::DOUBLE,
        Value::Decimal32(_) => codes::DECIMAL32,
        Value::Decimal64(_) => codes::DECIMAL64,
        Value::Decimal128(_) => codes::DECIMAL128,
        Value::Char(_) => codes::CHAR,
        Value::Timestamp(_) => codes::TIMESTAMP,
        Value::Uuid(_) => codes::UUID,
        Value::Binary(b) if b.len() <= 255 => codes::VBIN8,
        Value::Binary(_) => codes::VBIN32,
        Value::String(s) if s.len() <= 255 => codes::STR8,
        Value::String(_) => codes::STR32,
        Value::Symbol(s) if s.as_str().len() <= 255 => codes::SYM8,
        Value::Symbol(_) => codes::SYM32,
        Value::List(_) => codes::LIST32,
        Value::Map(_) => codes::MAP32,
        Value::Array(_) => codes::ARRAY32,
        Value::Described(described) => {
            return ArrayConstructor::Described(
                described.descriptor.clone(),
                Box::new(narrowest_element(&described.value)),
            );
        }
    };
    ArrayConstructor::Primitive(code)
}

fn constructor_name(ctor: &ArrayConstructor) -> &'static str {
    match ctor {
        ArrayConstructor::Primitive(code) => codes::name(*code),
        ArrayConstructor::Described(..) => "described",
    }
}

fn widen(
    current: ArrayConstructor,
    next: ArrayConstructor,
) -> Result<ArrayConstructor, EncodeError> {
    match (current, next) {
        (ArrayConstructor::Primitive(a), ArrayConstructor::Primitive(b)) => {
            if codes::name(a) != codes::name(b) {
                return Err(EncodeError::HeterogeneousArray {
                    first: codes::name(a),
                    other: codes::name(b),
                });
            }
            Ok(ArrayConstructor::Primitive(if width_rank(b) > width_rank(a) {
                b
            } else {
                a
            }))
        }
        (ArrayConstructor::Described(d1, inner1), ArrayConstructor::Described(d2, inner2))
            if d1 == d2 =>
        {
            Ok(ArrayConstructor::Described(d1, Box::new(widen(*inner1, *inner2)?)))
        }
        (first, other) => Err(EncodeError::HeterogeneousArray {
            first: constructor_name(&first),
            other: constructor_name(&other),
        }),
    }
}

/// First pass over every element so that width promotion covers elements
/// already seen as well as later ones.
fn array_constructor(items: &[Value]) -> Result<ArrayConstructor, EncodeError> {
    let mut iter = items.iter();
    let Some(first) = iter.next() else {
        return Ok(ArrayConstructor::Primitive(codes::SYM8));
    };
    iter.try_fold(narrowest_element(first), |ctor, item| {
        widen(ctor, narrowest_element(item))
    })
}

fn write_constructor(ctor: &ArrayConstructor, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match ctor {
        ArrayConstructor::Primitive(code) => buf.put_u8(*code),
        ArrayConstructor::Described(descriptor, inner) => {
            buf.put_u8(codes::DESCRIBED_TYPE_INDICATOR);
            write_descriptor(descriptor, buf)?;
            write_constructor(inner, buf)?;
        }
    }
    Ok(())
}

fn put_sized(code: u8, data: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    if width_rank(code) == 1 {
        buf.put_u8(data.len() as u8);
    } else {
        let len = u32::try_from(data.len()).map_err(|_| EncodeError::ValueTooLarge(data.len()))?;
        buf.put_u32(len);
    }
    buf.put_slice(data);
    Ok(())
}

/// Write a 32-bit sized compound body (no constructor byte) for array elements.
fn write_compound_body<F>(count: usize, buf: &mut BytesMut, body: F) -> Result<(), EncodeError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), EncodeError>,
{
    let start = buf.len();
    buf.put_u32(0);
    let count = u32::try_from(count).map_err(|_| EncodeError::ValueTooLarge(count))?;
    buf.put_u32(count);
    body(buf)?;
    let size = buf.len() - start - 4;
    let size = u32::try_from(size).map_err(|_| EncodeError::ValueTooLarge(size))?;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

fn write_element(
    value: &Value,
    ctor: &ArrayConstructor,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    let code = match ctor {
        ArrayConstructor::Described(_, inner) => {
            let Value::Described(described) = value else {
                return Err(EncodeError::HeterogeneousArray {
                    first: "described",
                    other: value.type_name(),
                });
            };
            return write_element(&described.value, inner, buf);
        }
        ArrayConstructor::Primitive(code) => *code,
    };
    match (code, value) {
        (codes::NULL | codes::UINT0 | codes::ULONG0, _) => {}
        (codes::BOOLEAN, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
        (codes::UBYTE, Value::Ubyte(v)) => buf.put_u8(*v),
        (codes::USHORT, Value::Ushort(v)) => buf.put_u16(*v),
        (codes::SMALLUINT, Value::Uint(v)) => buf.put_u8(*v as u8),
        (codes::UINT, Value::Uint(v)) => buf.put_u32(*v),
        (codes::SMALLULONG, Value::Ulong(v)) => buf.put_u8(*v as u8),
        (codes::ULONG, Value::Ulong(v)) => buf.put_u64(*v),
        (codes::BYTE, Value::Byte(v)) => buf.put_i8(*v),
        (codes::SHORT, Value::Short(v)) => buf.put_i16(*v),
        (codes::SMALLINT, Value::Int(v)) => buf.put_i8(*v as i8),
        (codes::INT, Value::Int(v)) => buf.put_i32(*v),
        (codes::SMALLLONG, Value::Long(v)) => buf.put_i8(*v as i8),
        (codes::LONG, Value::Long(v)) => buf.put_i64(*v),
        (codes::FLOAT, Value::Float(v)) => buf.put_f32(*v),
        (codes::DOUBLE, Value::Double(v)) => buf.put_f64(*v),
        (codes::DECIMAL32, Value::Decimal32(v)) => buf.put_slice(&v.0),
        (codes::DECIMAL64, Value::Decimal64(v)) => buf.put_slice(&v.0),
        (codes::DECIMAL128, Value::Decimal128(v)) => buf.put_slice(&v.0),
        (codes::CHAR, Value::Char(v)) => buf.put_u32(u32::from(*v)),
        (codes::TIMESTAMP, Value::Timestamp(v)) => buf.put_i64(v.0),
        (codes::UUID, Value::Uuid(v)) => buf.put_slice(v.as_bytes()),
        (codes::VBIN8 | codes::VBIN32, Value::Binary(v)) => put_sized(code, v, buf)?,
        (codes::STR8 | codes::STR32, Value::String(v)) => put_sized(code, v.as_bytes(), buf)?,
        (codes::SYM8 | codes::SYM32, Value::Symbol(v)) => {
            put_sized(code, v.as_str().as_bytes(), buf)?;
        }
        (codes::LIST32, Value::List(items)) => write_compound_body(items.len(), buf, |buf| {
            items.iter().try_for_each(|item| write_value(item, buf))
        })?,
        (codes::MAP32, Value::Map(map)) => write_compound_body(map.len() * 2, buf, |buf| {
            map.iter().try_for_each(|(k, v)| {
                write_value(k, buf)?;
                write_value(v, buf)
            })
        })?,
        (codes::ARRAY32, Value::Array(array)) => {
            let inner = array_constructor(array.items())?;
            write_compound_body(array.len(), buf, |buf| {
                write_constructor(&inner, buf)?;
                array
                    .items()
                    .iter()
                    .try_for_each(|item| write_element(item, &inner, buf))
            })?;
        }
        (_, other) => {
            return Err(EncodeError::HeterogeneousArray {
                first: codes::name(code),
                other: other.type_name(),
            });
        }
    }
    Ok(())
}

pub(crate) fn write_array(array: &Array, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let ctor = array_constructor(array.items())?;
    let start = begin_compound(codes::ARRAY32, buf);
    write_constructor(&ctor, buf)?;
    for item in array.items() {
        write_element(item, &ctor, buf)?;
    }
    finish_compound(start, array.len(), codes::ARRAY8, None, buf)
}

/// Symbol arrays are the common "multiple symbol" field encoding.
pub(crate) fn write_symbol_array(symbols: &[Symbol], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let start = begin_compound(codes::ARRAY32, buf);
    let wide = symbols.iter().any(|s| s.as_str().len() > 255);
    let code = if wide { codes::SYM32 } else { codes::SYM8 };
    buf.put_u8(code);
    for symbol in symbols {
        put_sized(code, symbol.as_str().as_bytes(), buf)?;
    }
    finish_compound(start, symbols.len(), codes::ARRAY8, None, buf)
}

impl AmqpEncode for Value {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_value(self, buf)
    }
}

impl AmqpEncode for bool {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_bool(*self, buf);
        Ok(())
    }
}

impl AmqpEncode for u8 {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codes::UBYTE);
        buf.put_u8(*self);
        Ok(())
    }
}

impl AmqpEncode for u16 {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codes::USHORT);
        buf.put_u16(*self);
        Ok(())
    }
}

impl AmqpEncode for u32 {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_uint(*self, buf);
        Ok(())
    }
}

impl AmqpEncode for u64 {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_ulong(*self, buf);
        Ok(())
    }
}

impl AmqpEncode for Timestamp {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_timestamp(*self, buf);
        Ok(())
    }
}

impl AmqpEncode for String {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(self, buf)
    }
}

impl AmqpEncode for Symbol {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_symbol(self.as_str(), buf)
    }
}

impl AmqpEncode for Bytes {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_binary(self, buf)
    }
}

impl AmqpEncode for Vec<Symbol> {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_symbol_array(self, buf)
    }
}

impl AmqpEncode for Map {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_map(self, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &Value) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(value, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn integers_use_narrowest_form() {
        assert_eq!(encoded(&Value::Uint(0)), vec![codes::UINT0]);
        assert_eq!(encoded(&Value::Uint(255)), vec![codes::SMALLUINT, 0xff]);
        assert_eq!(encoded(&Value::Uint(256)), vec![codes::UINT, 0, 0, 1, 0]);
        assert_eq!(encoded(&Value::Ulong(0)), vec![codes::ULONG0]);
        assert_eq!(encoded(&Value::Ulong(7)), vec![codes::SMALLULONG, 7]);
        assert_eq!(encoded(&Value::Int(-128)), vec![codes::SMALLINT, 0x80]);
        assert_eq!(encoded(&Value::Int(127)), vec![codes::SMALLINT, 0x7f]);
        assert_eq!(encoded(&Value::Int(128)), vec![codes::INT, 0, 0, 0, 0x80]);
        assert_eq!(
            encoded(&Value::Long(-129)),
            vec![codes::LONG, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f]
        );
        assert_eq!(encoded(&Value::Bool(true)), vec![codes::BOOLEAN_TRUE]);
    }

    #[test]
    fn empty_list_is_list0() {
        assert_eq!(encoded(&Value::List(Vec::new())), vec![codes::LIST0]);
    }

    #[test]
    fn short_list_is_compacted_to_list8() {
        let bytes = encoded(&Value::List(vec![Value::Uint(1), Value::Null]));
        assert_eq!(bytes, vec![codes::LIST8, 4, 2, codes::SMALLUINT, 1, codes::NULL]);
    }

    #[test]
    fn long_list_keeps_list32_header() {
        let items: Vec<Value> = (0..300).map(|_| Value::Null).collect();
        let bytes = encoded(&Value::List(items));
        assert_eq!(bytes[0], codes::LIST32);
        assert_eq!(u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]), 304);
        assert_eq!(u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]), 300);
        assert_eq!(bytes.len(), 9 + 300);
    }

    #[test]
    fn array_width_promotion_is_retroactive() {
        let array = Array::new(vec![Value::Ulong(0), Value::Ulong(5), Value::Ulong(1000)]);
        let bytes = encoded(&Value::Array(array));
        assert_eq!(bytes[0], codes::ARRAY8);
        assert_eq!(bytes[2], 3);
        assert_eq!(bytes[3], codes::ULONG);
        assert_eq!(bytes.len(), 4 + 3 * 8);

        let array = Array::new(vec![Value::Ulong(0), Value::Ulong(5)]);
        let bytes = encoded(&Value::Array(array));
        assert_eq!(bytes[3], codes::SMALLULONG);
        assert_eq!(&bytes[4..], &[0, 5]);
    }

    #[test]
    fn heterogeneous_array_is_rejected() {
        let array = Array::new(vec![Value::Uint(1), Value::String("x".into())]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode(&Value::Array(array), &mut buf),
            Err(EncodeError::HeterogeneousArray { .. })
        ));
    }

    #[test]
    fn strings_switch_to_32_bit_length() {
        let long = "a".repeat(256);
        let bytes = encoded(&Value::String(long));
        assert_eq!(bytes[0], codes::STR32);
        assert_eq!(&bytes[1..5], &256u32.to_be_bytes());
    }
}
