//! Described list types.
//!
//! A [`DescribedType`] is a descriptor followed by a list whose fields are in
//! a fixed order. Fields are read through a [`FieldReader`] that enforces the
//! type's field-count bounds, and written through a [`FieldWriter`] that
//! drops trailing nulls before the list size is back-patched.

use bytes::{BufMut, Bytes, BytesMut};

use super::constants as codes;
use super::decoder::{AmqpDecode, Nesting, read_compound, read_descriptor, take_u8};
use super::encoder::{AmqpEncode, begin_compound, finish_compound, write_ulong};
use super::value::{Descriptor, Value};
use crate::error::{DecodeError, EncodeError};

/// A list-bodied described type with a numeric and a symbolic descriptor.
pub trait DescribedType: Sized {
    /// Numeric descriptor.
    const CODE: u64;
    /// Symbolic descriptor, e.g. `amqp:open:list`.
    const NAME: &'static str;
    /// Mandatory field count.
    const MIN_FIELDS: usize;
    /// Total field count.
    const MAX_FIELDS: usize;

    /// Read the fields in order.
    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError>;

    /// Write the fields in order.
    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError>;

    /// Whether `descriptor` names this type.
    fn matches(descriptor: &Descriptor) -> bool {
        match descriptor {
            Descriptor::Code(code) => *code == Self::CODE,
            Descriptor::Symbol(name) => name.as_str() == Self::NAME,
        }
    }

    /// Decode the list body that follows an already consumed descriptor.
    fn decode_body(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let _level = Nesting::enter()?;
        let mut reader = FieldReader::open::<Self>(buf)?;
        Self::decode_fields(&mut reader)
    }

    /// Write descriptor and list body.
    fn encode_described(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(codes::DESCRIBED_TYPE_INDICATOR);
        write_ulong(Self::CODE, buf);
        let start = begin_compound(codes::LIST32, buf);
        let mut writer = FieldWriter::new(buf, start);
        self.encode_fields(&mut writer)?;
        writer.finish()
    }
}

/// Decode a described value of type `T`, constructor included.
pub fn decode_described<T: DescribedType>(buf: &mut Bytes) -> Result<T, DecodeError> {
    let code = take_u8(buf)?;
    if code != codes::DESCRIBED_TYPE_INDICATOR {
        return Err(DecodeError::UnexpectedEncoding {
            expected: T::NAME,
            found: code,
        });
    }
    let descriptor = read_descriptor(buf)?;
    if !T::matches(&descriptor) {
        return Err(DecodeError::UnknownDescriptor(descriptor.to_string()));
    }
    T::decode_body(buf)
}

/// A closed set of described types sharing one field position, such as
/// delivery states.
pub trait FromDescribed: Sized {
    /// Decode the body after `descriptor`.
    fn from_described(descriptor: &Descriptor, buf: &mut Bytes) -> Result<Self, DecodeError>;
}

/// Sequential access to the fields of a described list.
#[derive(Debug)]
pub struct FieldReader {
    type_name: &'static str,
    remaining: usize,
    body: Bytes,
}

impl FieldReader {
    /// Read the list header for `T` and validate its field count.
    pub fn open<T: DescribedType>(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let code = take_u8(buf)?;
        let (count, body) = match code {
            codes::LIST0 => (0, Bytes::new()),
            codes::LIST8 | codes::LIST32 => {
                let compound = read_compound(code, buf)?;
                (compound.count, compound.body)
            }
            other => {
                return Err(DecodeError::UnexpectedEncoding {
                    expected: "list",
                    found: other,
                });
            }
        };
        if count < T::MIN_FIELDS || count > T::MAX_FIELDS {
            return Err(DecodeError::FieldCount {
                type_name: T::NAME,
                count,
                min: T::MIN_FIELDS,
                max: T::MAX_FIELDS,
            });
        }
        Ok(Self {
            type_name: T::NAME,
            remaining: count,
            body,
        })
    }

    /// Next constructor byte, or `None` past the encoded count or at a null.
    fn next_code(&mut self) -> Result<Option<u8>, DecodeError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let code = take_u8(&mut self.body)?;
        Ok((code != codes::NULL).then_some(code))
    }

    /// Read an optional field.
    pub fn read<T: AmqpDecode>(&mut self) -> Result<Option<T>, DecodeError> {
        match self.next_code()? {
            Some(code) => T::decode_with(code, &mut self.body).map(Some),
            None => Ok(None),
        }
    }

    /// Read a mandatory field.
    pub fn required<T: AmqpDecode>(&mut self, field: &'static str) -> Result<T, DecodeError> {
        self.read()?.ok_or(DecodeError::MissingField {
            type_name: self.type_name,
            field,
        })
    }

    /// Read a boolean field that defaults to `false`.
    pub fn flag(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read::<bool>()?.unwrap_or(false))
    }

    /// Read an optional field of a specific described type.
    pub fn read_described<T: DescribedType>(&mut self) -> Result<Option<T>, DecodeError> {
        match self.next_code()? {
            Some(codes::DESCRIBED_TYPE_INDICATOR) => {
                let descriptor = read_descriptor(&mut self.body)?;
                if !T::matches(&descriptor) {
                    return Err(DecodeError::UnknownDescriptor(descriptor.to_string()));
                }
                T::decode_body(&mut self.body).map(Some)
            }
            Some(other) => Err(DecodeError::UnexpectedEncoding {
                expected: T::NAME,
                found: other,
            }),
            None => Ok(None),
        }
    }

    /// Read an optional field holding one of several described types.
    pub fn read_union<T: FromDescribed>(&mut self) -> Result<Option<T>, DecodeError> {
        match self.next_code()? {
            Some(codes::DESCRIBED_TYPE_INDICATOR) => {
                let descriptor = read_descriptor(&mut self.body)?;
                T::from_described(&descriptor, &mut self.body).map(Some)
            }
            Some(other) => Err(DecodeError::UnexpectedEncoding {
                expected: "described",
                found: other,
            }),
            None => Ok(None),
        }
    }

    /// Read a field of any type.
    pub fn read_value(&mut self) -> Result<Option<Value>, DecodeError> {
        self.read::<Value>()
    }
}

/// Appends fields to a described list and trims trailing nulls on finish.
pub struct FieldWriter<'a> {
    buf: &'a mut BytesMut,
    start: usize,
    count: usize,
    kept_len: usize,
    kept_count: usize,
}

impl<'a> FieldWriter<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut, start: usize) -> Self {
        let kept_len = buf.len();
        Self {
            buf,
            start,
            count: 0,
            kept_len,
            kept_count: 0,
        }
    }

    fn written(&mut self, at: usize) {
        self.count += 1;
        if self.buf[at] != codes::NULL {
            self.kept_len = self.buf.len();
            self.kept_count = self.count;
        }
    }

    /// Write a field value.
    pub fn write<T: AmqpEncode + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        let at = self.buf.len();
        value.encode_to(self.buf)?;
        self.written(at);
        Ok(())
    }

    /// Write an optional field, null when absent.
    pub fn write_opt<T: AmqpEncode>(&mut self, value: Option<&T>) -> Result<(), EncodeError> {
        match value {
            Some(value) => self.write(value),
            None => {
                self.write_null();
                Ok(())
            }
        }
    }

    /// Write a null field.
    pub fn write_null(&mut self) {
        let at = self.buf.len();
        self.buf.put_u8(codes::NULL);
        self.written(at);
    }

    /// Write a boolean that defaults to `false`; `false` goes out as null.
    pub fn flag(&mut self, value: bool) -> Result<(), EncodeError> {
        if value {
            self.write(&true)
        } else {
            self.write_null();
            Ok(())
        }
    }

    /// Write an optional described field.
    pub fn write_described<T: DescribedType>(&mut self, value: Option<&T>) -> Result<(), EncodeError> {
        match value {
            Some(value) => {
                let at = self.buf.len();
                value.encode_described(self.buf)?;
                self.written(at);
                Ok(())
            }
            None => {
                self.write_null();
                Ok(())
            }
        }
    }

    /// Drop trailing nulls and back-patch the list header.
    pub(crate) fn finish(self) -> Result<(), EncodeError> {
        self.buf.truncate(self.kept_len);
        finish_compound(
            self.start,
            self.kept_count,
            codes::LIST8,
            Some(codes::LIST0),
            self.buf,
        )
    }
}

/// Encode any described type into a fresh buffer.
pub fn encode_described_to_bytes<T: DescribedType>(value: &T) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::new();
    value.encode_described(&mut buf)?;
    Ok(buf.freeze())
}
