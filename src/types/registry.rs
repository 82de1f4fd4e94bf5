//! Descriptor registry.
//!
//! Maps numeric and symbolic descriptors to body decoders so that a frame
//! body can be resolved to one enum in a single lookup.

use std::collections::HashMap;
use std::sync::LazyLock;

use bytes::Bytes;

use super::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
use super::sasl::{SaslChallenge, SaslInit, SaslMechanisms, SaslOutcome, SaslPerformative, SaslResponse};
use crate::codec::{DescribedType, Descriptor, constants, read_descriptor, take_u8};
use crate::error::DecodeError;

/// Decoder for a described body whose descriptor is already consumed.
pub type BodyDecoder<T> = fn(&mut Bytes) -> Result<T, DecodeError>;

fn decode_as<D, T>(buf: &mut Bytes) -> Result<T, DecodeError>
where
    D: DescribedType + Into<T>,
{
    D::decode_body(buf).map(Into::into)
}

/// Lookup table from descriptor to decoder producing `T`.
pub struct DescribedTypeRegistry<T> {
    by_code: HashMap<u64, BodyDecoder<T>>,
    by_name: HashMap<&'static str, BodyDecoder<T>>,
}

impl<T> Default for DescribedTypeRegistry<T> {
    fn default() -> Self {
        Self {
            by_code: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T> DescribedTypeRegistry<T> {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `D` under both of its descriptors.
    pub fn register<D>(&mut self) -> &mut Self
    where
        D: DescribedType + Into<T>,
    {
        self.by_code.insert(D::CODE, decode_as::<D, T>);
        self.by_name.insert(D::NAME, decode_as::<D, T>);
        self
    }

    /// Resolve a descriptor.
    #[must_use]
    pub fn lookup(&self, descriptor: &Descriptor) -> Option<BodyDecoder<T>> {
        match descriptor {
            Descriptor::Code(code) => self.by_code.get(code).copied(),
            Descriptor::Symbol(name) => self.by_name.get(name.as_str()).copied(),
        }
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Decode a described value, constructor included. An unregistered
    /// descriptor is a decode error.
    pub fn decode(&self, buf: &mut Bytes) -> Result<T, DecodeError> {
        let code = take_u8(buf)?;
        if code != constants::DESCRIBED_TYPE_INDICATOR {
            return Err(DecodeError::UnexpectedEncoding {
                expected: "described type",
                found: code,
            });
        }
        let descriptor = read_descriptor(buf)?;
        let decoder = self
            .lookup(&descriptor)
            .ok_or_else(|| DecodeError::UnknownDescriptor(descriptor.to_string()))?;
        decoder(buf)
    }
}

static PERFORMATIVES: LazyLock<DescribedTypeRegistry<Performative>> = LazyLock::new(|| {
    let mut registry = DescribedTypeRegistry::new();
    registry
        .register::<Open>()
        .register::<Begin>()
        .register::<Attach>()
        .register::<Flow>()
        .register::<Transfer>()
        .register::<Disposition>()
        .register::<Detach>()
        .register::<End>()
        .register::<Close>();
    registry
});

static SASL_PERFORMATIVES: LazyLock<DescribedTypeRegistry<SaslPerformative>> =
    LazyLock::new(|| {
        let mut registry = DescribedTypeRegistry::new();
        registry
            .register::<SaslMechanisms>()
            .register::<SaslInit>()
            .register::<SaslChallenge>()
            .register::<SaslResponse>()
            .register::<SaslOutcome>();
        registry
    });

/// Registry of AMQP frame bodies.
#[must_use]
pub fn performatives() -> &'static DescribedTypeRegistry<Performative> {
    &PERFORMATIVES
}

/// Registry of SASL frame bodies.
#[must_use]
pub fn sasl_performatives() -> &'static DescribedTypeRegistry<SaslPerformative> {
    &SASL_PERFORMATIVES
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_described_to_bytes, write_symbol};

    #[test]
    fn resolves_by_code_and_name() {
        let registry = performatives();
        assert_eq!(registry.len(), 9);
        assert!(registry.lookup(&Descriptor::Code(0x10)).is_some());
        assert!(
            registry
                .lookup(&Descriptor::Symbol("amqp:close:list".into()))
                .is_some()
        );
        assert!(registry.lookup(&Descriptor::Code(0x40)).is_none());
    }

    #[test]
    fn symbolic_descriptor_decodes_performative() {
        let mut buf = BytesMut::new();
        buf.put_u8(constants::DESCRIBED_TYPE_INDICATOR);
        write_symbol("amqp:end:list", &mut buf).unwrap();
        buf.put_u8(constants::LIST0);
        let decoded = performatives().decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, Performative::End(End::default()));
    }

    #[test]
    fn unknown_frame_body_descriptor_is_an_error() {
        let mut bytes = encode_described_to_bytes(&SaslChallenge {
            challenge: Bytes::from_static(b"x"),
        })
        .unwrap();
        assert!(matches!(
            performatives().decode(&mut bytes),
            Err(DecodeError::UnknownDescriptor(_))
        ));
    }
}
