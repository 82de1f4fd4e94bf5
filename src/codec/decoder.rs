//! AMQP value decoder.
//!
//! Two static tables of 256 slots, indexed by constructor byte, hold the
//! decode and skip functions. A missing slot is an unknown encoding.
//!
//! Lists, maps, arrays and described values recurse. Every recursive step
//! holds a [`Nesting`] level, and the decoder gives up past
//! [`MAX_NESTING_DEPTH`] levels on the current thread.

use std::cell::Cell;

use bytes::{Buf, Bytes};
use uuid::Uuid;

use super::constants as codes;
use super::value::{
    Array, Decimal32, Decimal64, Decimal128, Descriptor, Map, Symbol, Timestamp, Value,
};
use crate::error::DecodeError;

type DecodeFn = fn(&mut Bytes) -> Result<Value, DecodeError>;
type SkipFn = fn(&mut Bytes) -> Result<(), DecodeError>;

/// Arrays of zero-width elements (nulls, `uint0`, `true`) carry no bytes per
/// element, so their count is capped separately.
pub const MAX_ZERO_WIDTH_ARRAY: usize = 65_536;

/// Deepest nesting of compound and described values the decoder accepts.
pub const MAX_NESTING_DEPTH: usize = 128;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One level of nesting, released on drop.
pub(crate) struct Nesting(());

impl Nesting {
    pub(crate) fn enter() -> Result<Self, DecodeError> {
        DEPTH.with(|depth| {
            let level = depth.get() + 1;
            if level > MAX_NESTING_DEPTH {
                return Err(DecodeError::NestingTooDeep {
                    max: MAX_NESTING_DEPTH,
                });
            }
            depth.set(level);
            Ok(Self(()))
        })
    }
}

impl Drop for Nesting {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

static DECODERS: [Option<DecodeFn>; 256] = decode_table();
static SKIPPERS: [Option<SkipFn>; 256] = skip_table();

const fn decode_table() -> [Option<DecodeFn>; 256] {
    let mut t: [Option<DecodeFn>; 256] = [None; 256];
    t[codes::DESCRIBED_TYPE_INDICATOR as usize] = Some(read_described);
    t[codes::NULL as usize] = Some(read_null);
    t[codes::BOOLEAN as usize] = Some(read_boolean);
    t[codes::BOOLEAN_TRUE as usize] = Some(read_true);
    t[codes::BOOLEAN_FALSE as usize] = Some(read_false);
    t[codes::UBYTE as usize] = Some(read_ubyte);
    t[codes::USHORT as usize] = Some(read_ushort);
    t[codes::UINT as usize] = Some(read_uint);
    t[codes::SMALLUINT as usize] = Some(read_smalluint);
    t[codes::UINT0 as usize] = Some(read_uint0);
    t[codes::ULONG as usize] = Some(read_ulong);
    t[codes::SMALLULONG as usize] = Some(read_smallulong);
    t[codes::ULONG0 as usize] = Some(read_ulong0);
    t[codes::BYTE as usize] = Some(read_byte);
    t[codes::SHORT as usize] = Some(read_short);
    t[codes::INT as usize] = Some(read_int);
    t[codes::SMALLINT as usize] = Some(read_smallint);
    t[codes::LONG as usize] = Some(read_long);
    t[codes::SMALLLONG as usize] = Some(read_smalllong);
    t[codes::FLOAT as usize] = Some(read_float);
    t[codes::DOUBLE as usize] = Some(read_double);
    t[codes::DECIMAL32 as usize] = Some(read_decimal32);
    t[codes::DECIMAL64 as usize] = Some(read_decimal64);
    t[codes::DECIMAL128 as usize] = Some(read_decimal128);
    t[codes::CHAR as usize] = Some(read_char);
    t[codes::TIMESTAMP as usize] = Some(read_timestamp);
    t[codes::UUID as usize] = Some(read_uuid);
    t[codes::VBIN8 as usize] = Some(read_vbin8);
    t[codes::VBIN32 as usize] = Some(read_vbin32);
    t[codes::STR8 as usize] = Some(read_str8);
    t[codes::STR32 as usize] = Some(read_str32);
    t[codes::SYM8 as usize] = Some(read_sym8);
    t[codes::SYM32 as usize] = Some(read_sym32);
    t[codes::LIST0 as usize] = Some(read_list0);
    t[codes::LIST8 as usize] = Some(read_list8);
    t[codes::LIST32 as usize] = Some(read_list32);
    t[codes::MAP8 as usize] = Some(read_map8);
    t[codes::MAP32 as usize] = Some(read_map32);
    t[codes::ARRAY8 as usize] = Some(read_array8);
    t[codes::ARRAY32 as usize] = Some(read_array32);
    t
}

const fn skip_table() -> [Option<SkipFn>; 256] {
    let mut t: [Option<SkipFn>; 256] = [None; 256];
    t[codes::DESCRIBED_TYPE_INDICATOR as usize] = Some(skip_described);
    t[codes::NULL as usize] = Some(skip_fixed::<0>);
    t[codes::BOOLEAN as usize] = Some(skip_fixed::<1>);
    t[codes::BOOLEAN_TRUE as usize] = Some(skip_fixed::<0>);
    t[codes::BOOLEAN_FALSE as usize] = Some(skip_fixed::<0>);
    t[codes::UBYTE as usize] = Some(skip_fixed::<1>);
    t[codes::USHORT as usize] = Some(skip_fixed::<2>);
    t[codes::UINT as usize] = Some(skip_fixed::<4>);
    t[codes::SMALLUINT as usize] = Some(skip_fixed::<1>);
    t[codes::UINT0 as usize] = Some(skip_fixed::<0>);
    t[codes::ULONG as usize] = Some(skip_fixed::<8>);
    t[codes::SMALLULONG as usize] = Some(skip_fixed::<1>);
    t[codes::ULONG0 as usize] = Some(skip_fixed::<0>);
    t[codes::BYTE as usize] = Some(skip_fixed::<1>);
    t[codes::SHORT as usize] = Some(skip_fixed::<2>);
    t[codes::INT as usize] = Some(skip_fixed::<4>);
    t[codes::SMALLINT as usize] = Some(skip_fixed::<1>);
    t[codes::LONG as usize] = Some(skip_fixed::<8>);
    t[codes::SMALLLONG as usize] = Some(skip_fixed::<1>);
    t[codes::FLOAT as usize] = Some(skip_fixed::<4>);
    t[codes::DOUBLE as usize] = Some(skip_fixed::<8>);
    t[codes::DECIMAL32 as usize] = Some(skip_fixed::<4>);
    t[codes::DECIMAL64 as usize] = Some(skip_fixed::<8>);
    t[codes::DECIMAL128 as usize] = Some(skip_fixed::<16>);
    t[codes::CHAR as usize] = Some(skip_fixed::<4>);
    t[codes::TIMESTAMP as usize] = Some(skip_fixed::<8>);
    t[codes::UUID as usize] = Some(skip_fixed::<16>);
    t[codes::VBIN8 as usize] = Some(skip_sized8);
    t[codes::VBIN32 as usize] = Some(skip_sized32);
    t[codes::STR8 as usize] = Some(skip_sized8);
    t[codes::STR32 as usize] = Some(skip_sized32);
    t[codes::SYM8 as usize] = Some(skip_sized8);
    t[codes::SYM32 as usize] = Some(skip_sized32);
    t[codes::LIST0 as usize] = Some(skip_fixed::<0>);
    t[codes::LIST8 as usize] = Some(skip_sized8);
    t[codes::LIST32 as usize] = Some(skip_sized32);
    t[codes::MAP8 as usize] = Some(skip_sized8);
    t[codes::MAP32 as usize] = Some(skip_sized32);
    t[codes::ARRAY8 as usize] = Some(skip_sized8);
    t[codes::ARRAY32 as usize] = Some(skip_sized32);
    t
}

/// Handle for the encoding found at a constructor byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDecoder {
    code: u8,
}

impl TypeDecoder {
    /// Look up the decoder for a constructor byte.
    pub fn for_code(code: u8) -> Result<Self, DecodeError> {
        if DECODERS[code as usize].is_some() {
            Ok(Self { code })
        } else {
            Err(DecodeError::UnknownEncoding(code))
        }
    }

    /// Constructor byte this decoder handles.
    #[must_use]
    pub const fn encoding_code(&self) -> u8 {
        self.code
    }

    /// AMQP type family name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        codes::name(self.code)
    }

    /// Whether the encoding is `null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.code == codes::NULL
    }

    /// Decode the value that follows the constructor.
    pub fn read_value(&self, buf: &mut Bytes) -> Result<Value, DecodeError> {
        match DECODERS[self.code as usize] {
            Some(decode) => decode(buf),
            None => Err(DecodeError::UnknownEncoding(self.code)),
        }
    }

    /// Advance past the value that follows the constructor without decoding it.
    pub fn skip_value(&self, buf: &mut Bytes) -> Result<(), DecodeError> {
        match SKIPPERS[self.code as usize] {
            Some(skip) => skip(buf),
            None => Err(DecodeError::UnknownEncoding(self.code)),
        }
    }
}

/// Read the next constructor byte and return its decoder.
pub fn read_type_decoder(buf: &mut Bytes) -> Result<TypeDecoder, DecodeError> {
    let code = take_u8(buf)?;
    TypeDecoder::for_code(code)
}

/// Decode one value, returning the decoder that was selected for it.
pub fn decode(buf: &mut Bytes) -> Result<(TypeDecoder, Value), DecodeError> {
    let decoder = read_type_decoder(buf)?;
    let value = decoder.read_value(buf)?;
    Ok((decoder, value))
}

/// Decode one value.
pub fn decode_value(buf: &mut Bytes) -> Result<Value, DecodeError> {
    decode(buf).map(|(_, value)| value)
}

/// Advance past one encoded value.
pub fn skip(buf: &mut Bytes) -> Result<(), DecodeError> {
    read_type_decoder(buf)?.skip_value(buf)
}

/// Types that can be read from an already consumed constructor byte.
pub trait AmqpDecode: Sized {
    /// Decode a value whose constructor `code` has been read.
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Read the constructor and decode the value after it.
    fn decode_from(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let code = take_u8(buf)?;
        Self::decode_with(code, buf)
    }
}

pub(crate) fn ensure(buf: &Bytes, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn take_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_array<const N: usize>(buf: &mut Bytes) -> Result<[u8; N], DecodeError> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn take_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, DecodeError> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

fn unexpected(expected: &'static str, found: u8) -> DecodeError {
    DecodeError::UnexpectedEncoding { expected, found }
}

fn read_null(_: &mut Bytes) -> Result<Value, DecodeError> {
    Ok(Value::Null)
}

fn read_boolean(buf: &mut Bytes) -> Result<Value, DecodeError> {
    match take_u8(buf)? {
        0 => Ok(Value::Bool(false)),
        1 => Ok(Value::Bool(true)),
        other => Err(DecodeError::InvalidField {
            field: "boolean",
            reason: format!("byte {other:#04x} is neither 0 nor 1"),
        }),
    }
}

fn read_true(_: &mut Bytes) -> Result<Value, DecodeError> {
    Ok(Value::Bool(true))
}

fn read_false(_: &mut Bytes) -> Result<Value, DecodeError> {
    Ok(Value::Bool(false))
}

fn read_ubyte(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_u8(buf).map(Value::Ubyte)
}

fn read_ushort(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<2>(buf).map(|b| Value::Ushort(u16::from_be_bytes(b)))
}

fn read_uint(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_u32(buf).map(Value::Uint)
}

fn read_smalluint(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_u8(buf).map(|v| Value::Uint(u32::from(v)))
}

fn read_uint0(_: &mut Bytes) -> Result<Value, DecodeError> {
    Ok(Value::Uint(0))
}

fn read_ulong(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<8>(buf).map(|b| Value::Ulong(u64::from_be_bytes(b)))
}

fn read_smallulong(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_u8(buf).map(|v| Value::Ulong(u64::from(v)))
}

fn read_ulong0(_: &mut Bytes) -> Result<Value, DecodeError> {
    Ok(Value::Ulong(0))
}

fn read_byte(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<1>(buf).map(|b| Value::Byte(i8::from_be_bytes(b)))
}

fn read_short(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<2>(buf).map(|b| Value::Short(i16::from_be_bytes(b)))
}

fn read_int(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<4>(buf).map(|b| Value::Int(i32::from_be_bytes(b)))
}

fn read_smallint(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<1>(buf).map(|b| Value::Int(i32::from(i8::from_be_bytes(b))))
}

fn read_long(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<8>(buf).map(|b| Value::Long(i64::from_be_bytes(b)))
}

fn read_smalllong(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<1>(buf).map(|b| Value::Long(i64::from(i8::from_be_bytes(b))))
}

fn read_float(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<4>(buf).map(|b| Value::Float(f32::from_be_bytes(b)))
}

fn read_double(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<8>(buf).map(|b| Value::Double(f64::from_be_bytes(b)))
}

fn read_decimal32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<4>(buf).map(|b| Value::Decimal32(Decimal32(b)))
}

fn read_decimal64(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<8>(buf).map(|b| Value::Decimal64(Decimal64(b)))
}

fn read_decimal128(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<16>(buf).map(|b| Value::Decimal128(Decimal128(b)))
}

fn read_char(buf: &mut Bytes) -> Result<Value, DecodeError> {
    let raw = take_u32(buf)?;
    char::from_u32(raw)
        .map(Value::Char)
        .ok_or(DecodeError::InvalidChar(raw))
}

fn read_timestamp(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<8>(buf).map(|b| Value::Timestamp(Timestamp(i64::from_be_bytes(b))))
}

fn read_uuid(buf: &mut Bytes) -> Result<Value, DecodeError> {
    take_array::<16>(buf).map(|b| Value::Uuid(Uuid::from_bytes(b)))
}

fn sized8(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = usize::from(take_u8(buf)?);
    take_bytes(buf, len)
}

fn sized32(buf: &mut Bytes) -> Result<Bytes, DecodeError> {
    let len = take_u32(buf)? as usize;
    take_bytes(buf, len)
}

fn read_vbin8(buf: &mut Bytes) -> Result<Value, DecodeError> {
    sized8(buf).map(Value::Binary)
}

fn read_vbin32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    sized32(buf).map(Value::Binary)
}

fn utf8(raw: &Bytes) -> Result<String, DecodeError> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8)
}

fn ascii(raw: &Bytes) -> Result<Symbol, DecodeError> {
    if !raw.is_ascii() {
        return Err(DecodeError::InvalidSymbol);
    }
    utf8(raw).map(Symbol::from)
}

fn read_str8(buf: &mut Bytes) -> Result<Value, DecodeError> {
    utf8(&sized8(buf)?).map(Value::String)
}

fn read_str32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    utf8(&sized32(buf)?).map(Value::String)
}

fn read_sym8(buf: &mut Bytes) -> Result<Value, DecodeError> {
    ascii(&sized8(buf)?).map(Value::Symbol)
}

fn read_sym32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    ascii(&sized32(buf)?).map(Value::Symbol)
}

/// Size, element count and body of a list, map or array.
pub(crate) struct Compound {
    pub count: usize,
    pub body: Bytes,
}

/// Read a compound header and split its body off the stream.
///
/// The declared size is checked against the stream before anything else, and
/// the count against the body for list and map encodings.
pub(crate) fn read_compound(code: u8, buf: &mut Bytes) -> Result<Compound, DecodeError> {
    let wide = matches!(code, codes::LIST32 | codes::MAP32 | codes::ARRAY32);
    let (size, width) = if wide {
        (take_u32(buf)? as usize, 4)
    } else {
        (usize::from(take_u8(buf)?), 1)
    };
    if size > buf.remaining() {
        return Err(DecodeError::SizeExceedsStream {
            size,
            remaining: buf.remaining(),
        });
    }
    if size < width {
        return Err(DecodeError::Truncated {
            needed: width,
            remaining: size,
        });
    }
    let mut body = buf.split_to(size);
    let count = if wide {
        body.get_u32() as usize
    } else {
        usize::from(body.get_u8())
    };
    let is_array = matches!(code, codes::ARRAY8 | codes::ARRAY32);
    if !is_array && count > body.remaining() {
        return Err(DecodeError::CountExceedsSize {
            count,
            size: body.remaining(),
        });
    }
    if matches!(code, codes::MAP8 | codes::MAP32) && count % 2 != 0 {
        return Err(DecodeError::OddMapCount(count));
    }
    Ok(Compound { count, body })
}

fn read_list0(_: &mut Bytes) -> Result<Value, DecodeError> {
    Ok(Value::List(Vec::new()))
}

fn read_list_items(mut compound: Compound) -> Result<Value, DecodeError> {
    let _level = Nesting::enter()?;
    let mut items = Vec::with_capacity(compound.count);
    for _ in 0..compound.count {
        items.push(decode_value(&mut compound.body)?);
    }
    Ok(Value::List(items))
}

fn read_list8(buf: &mut Bytes) -> Result<Value, DecodeError> {
    read_list_items(read_compound(codes::LIST8, buf)?)
}

fn read_list32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    read_list_items(read_compound(codes::LIST32, buf)?)
}

pub(crate) fn read_map_entries(mut compound: Compound) -> Result<Map, DecodeError> {
    let _level = Nesting::enter()?;
    let mut map = Map::new();
    for _ in 0..compound.count / 2 {
        let key = decode_value(&mut compound.body)?;
        let value = decode_value(&mut compound.body)?;
        map.push_unchecked(key, value);
    }
    Ok(map)
}

fn read_map8(buf: &mut Bytes) -> Result<Value, DecodeError> {
    read_map_entries(read_compound(codes::MAP8, buf)?).map(Value::Map)
}

fn read_map32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    read_map_entries(read_compound(codes::MAP32, buf)?).map(Value::Map)
}

/// Element constructor shared by every array element.
enum ElementDecoder {
    Primitive(TypeDecoder),
    Described(Descriptor, Box<ElementDecoder>),
}

impl ElementDecoder {
    fn read(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let code = take_u8(buf)?;
        if code == codes::DESCRIBED_TYPE_INDICATOR {
            let _level = Nesting::enter()?;
            let descriptor = read_descriptor(buf)?;
            let inner = Self::read(buf)?;
            return Ok(Self::Described(descriptor, Box::new(inner)));
        }
        TypeDecoder::for_code(code).map(Self::Primitive)
    }

    fn is_zero_width(&self) -> bool {
        match self {
            Self::Primitive(decoder) => matches!(
                decoder.encoding_code(),
                codes::NULL
                    | codes::BOOLEAN_TRUE
                    | codes::BOOLEAN_FALSE
                    | codes::UINT0
                    | codes::ULONG0
                    | codes::LIST0
            ),
            Self::Described(_, inner) => inner.is_zero_width(),
        }
    }

    fn read_element(&self, buf: &mut Bytes) -> Result<Value, DecodeError> {
        match self {
            Self::Primitive(decoder) => decoder.read_value(buf),
            Self::Described(descriptor, inner) => {
                let value = inner.read_element(buf)?;
                Ok(Value::described(descriptor.clone(), value))
            }
        }
    }
}

pub(crate) fn read_array_items<F, T>(
    mut compound: Compound,
    mut element: F,
) -> Result<Vec<T>, DecodeError>
where
    F: FnMut(&mut Bytes) -> Result<T, DecodeError>,
{
    let mut items = Vec::new();
    for _ in 0..compound.count {
        items.push(element(&mut compound.body)?);
    }
    Ok(items)
}

fn read_array(code: u8, buf: &mut Bytes) -> Result<Value, DecodeError> {
    let _level = Nesting::enter()?;
    let mut compound = read_compound(code, buf)?;
    let decoder = ElementDecoder::read(&mut compound.body)?;
    let limit = if decoder.is_zero_width() {
        MAX_ZERO_WIDTH_ARRAY
    } else {
        compound.body.remaining()
    };
    if compound.count > limit {
        return Err(DecodeError::CountExceedsSize {
            count: compound.count,
            size: limit,
        });
    }
    let items = read_array_items(compound, |body| decoder.read_element(body))?;
    Ok(Value::Array(Array::new(items)))
}

fn read_array8(buf: &mut Bytes) -> Result<Value, DecodeError> {
    read_array(codes::ARRAY8, buf)
}

fn read_array32(buf: &mut Bytes) -> Result<Value, DecodeError> {
    read_array(codes::ARRAY32, buf)
}

/// Read a descriptor: a `ulong` code or a symbol.
pub(crate) fn read_descriptor(buf: &mut Bytes) -> Result<Descriptor, DecodeError> {
    let code = take_u8(buf)?;
    match code {
        codes::ULONG | codes::SMALLULONG | codes::ULONG0 => {
            u64::decode_with(code, buf).map(Descriptor::Code)
        }
        codes::SYM8 | codes::SYM32 => Symbol::decode_with(code, buf).map(Descriptor::Symbol),
        other => Err(unexpected("descriptor", other)),
    }
}

fn read_described(buf: &mut Bytes) -> Result<Value, DecodeError> {
    let _level = Nesting::enter()?;
    let descriptor = read_descriptor(buf)?;
    let value = decode_value(buf)?;
    Ok(Value::described(descriptor, value))
}

fn skip_fixed<const N: usize>(buf: &mut Bytes) -> Result<(), DecodeError> {
    ensure(buf, N)?;
    buf.advance(N);
    Ok(())
}

fn skip_sized8(buf: &mut Bytes) -> Result<(), DecodeError> {
    let len = usize::from(take_u8(buf)?);
    ensure(buf, len)?;
    buf.advance(len);
    Ok(())
}

fn skip_sized32(buf: &mut Bytes) -> Result<(), DecodeError> {
    let len = take_u32(buf)? as usize;
    ensure(buf, len)?;
    buf.advance(len);
    Ok(())
}

fn skip_described(buf: &mut Bytes) -> Result<(), DecodeError> {
    let _level = Nesting::enter()?;
    skip(buf)?;
    skip(buf)
}

impl AmqpDecode for Value {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        TypeDecoder::for_code(code)?.read_value(buf)
    }
}

impl AmqpDecode for bool {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::BOOLEAN_TRUE => Ok(true),
            codes::BOOLEAN_FALSE => Ok(false),
            codes::BOOLEAN => match read_boolean(buf)? {
                Value::Bool(v) => Ok(v),
                _ => Err(unexpected("boolean", code)),
            },
            other => Err(unexpected("boolean", other)),
        }
    }
}

impl AmqpDecode for u8 {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::UBYTE => take_u8(buf),
            other => Err(unexpected("ubyte", other)),
        }
    }
}

impl AmqpDecode for u16 {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::USHORT => take_array::<2>(buf).map(u16::from_be_bytes),
            other => Err(unexpected("ushort", other)),
        }
    }
}

impl AmqpDecode for u32 {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::UINT0 => Ok(0),
            codes::SMALLUINT => take_u8(buf).map(u32::from),
            codes::UINT => take_u32(buf),
            other => Err(unexpected("uint", other)),
        }
    }
}

impl AmqpDecode for u64 {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::ULONG0 => Ok(0),
            codes::SMALLULONG => take_u8(buf).map(u64::from),
            codes::ULONG => take_array::<8>(buf).map(u64::from_be_bytes),
            other => Err(unexpected("ulong", other)),
        }
    }
}

impl AmqpDecode for i32 {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::SMALLINT => take_array::<1>(buf).map(|b| i32::from(i8::from_be_bytes(b))),
            codes::INT => take_array::<4>(buf).map(i32::from_be_bytes),
            other => Err(unexpected("int", other)),
        }
    }
}

impl AmqpDecode for i64 {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::SMALLLONG => take_array::<1>(buf).map(|b| i64::from(i8::from_be_bytes(b))),
            codes::LONG => take_array::<8>(buf).map(i64::from_be_bytes),
            other => Err(unexpected("long", other)),
        }
    }
}

impl AmqpDecode for Timestamp {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::TIMESTAMP => take_array::<8>(buf).map(|b| Timestamp(i64::from_be_bytes(b))),
            other => Err(unexpected("timestamp", other)),
        }
    }
}

impl AmqpDecode for String {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::STR8 => utf8(&sized8(buf)?),
            codes::STR32 => utf8(&sized32(buf)?),
            other => Err(unexpected("string", other)),
        }
    }
}

impl AmqpDecode for Symbol {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::SYM8 => ascii(&sized8(buf)?),
            codes::SYM32 => ascii(&sized32(buf)?),
            other => Err(unexpected("symbol", other)),
        }
    }
}

impl AmqpDecode for Bytes {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::VBIN8 => sized8(buf),
            codes::VBIN32 => sized32(buf),
            other => Err(unexpected("binary", other)),
        }
    }
}

impl AmqpDecode for Map {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::MAP8 | codes::MAP32 => read_map_entries(read_compound(code, buf)?),
            other => Err(unexpected("map", other)),
        }
    }
}

/// Multiple-symbol fields: either an array of symbols or a single symbol.
impl AmqpDecode for Vec<Symbol> {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match code {
            codes::SYM8 | codes::SYM32 => Ok(vec![Symbol::decode_with(code, buf)?]),
            codes::ARRAY8 | codes::ARRAY32 => {
                let mut compound = read_compound(code, buf)?;
                let element = take_u8(&mut compound.body)?;
                if !matches!(element, codes::SYM8 | codes::SYM32) {
                    return Err(unexpected("symbol array", element));
                }
                if compound.count > compound.body.remaining() {
                    return Err(DecodeError::CountExceedsSize {
                        count: compound.count,
                        size: compound.body.remaining(),
                    });
                }
                read_array_items(compound, |body| Symbol::decode_with(element, body))
            }
            other => Err(unexpected("symbol array", other)),
        }
    }
}
