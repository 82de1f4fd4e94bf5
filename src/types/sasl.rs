//! SASL frame bodies.

use bytes::{Bytes, BytesMut};

use crate::codec::{AmqpDecode, AmqpEncode, DescribedType, FieldReader, FieldWriter, Symbol};
use crate::error::{DecodeError, EncodeError};

/// Mechanisms advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslMechanisms {
    /// Supported mechanism names, in server preference order.
    pub mechanisms: Vec<Symbol>,
}

impl DescribedType for SaslMechanisms {
    const CODE: u64 = 0x40;
    const NAME: &'static str = "amqp:sasl-mechanisms:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            mechanisms: fields.required("sasl-server-mechanisms")?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.mechanisms)
    }
}

/// Mechanism selection with the initial response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslInit {
    /// Selected mechanism.
    pub mechanism: Symbol,
    /// Initial response data.
    pub initial_response: Option<Bytes>,
    /// Server host name.
    pub hostname: Option<String>,
}

impl DescribedType for SaslInit {
    const CODE: u64 = 0x41;
    const NAME: &'static str = "amqp:sasl-init:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 3;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            mechanism: fields.required("mechanism")?,
            initial_response: fields.read()?,
            hostname: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.mechanism)?;
        fields.write_opt(self.initial_response.as_ref())?;
        fields.write_opt(self.hostname.as_ref())
    }
}

/// Server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslChallenge {
    /// Challenge data.
    pub challenge: Bytes,
}

impl DescribedType for SaslChallenge {
    const CODE: u64 = 0x42;
    const NAME: &'static str = "amqp:sasl-challenge:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            challenge: fields.required("challenge")?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.challenge)
    }
}

/// Client response to a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslResponse {
    /// Response data.
    pub response: Bytes,
}

impl DescribedType for SaslResponse {
    const CODE: u64 = 0x43;
    const NAME: &'static str = "amqp:sasl-response:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 1;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            response: fields.required("response")?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.response)
    }
}

/// Result code of a SASL exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslCode {
    /// Authentication succeeded.
    Ok,
    /// Bad credentials.
    Auth,
    /// Unspecified system error.
    Sys,
    /// Permanent system error.
    SysPerm,
    /// Transient system error.
    SysTemp,
}

impl SaslCode {
    /// Wire value.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Auth => 1,
            Self::Sys => 2,
            Self::SysPerm => 3,
            Self::SysTemp => 4,
        }
    }
}

impl AmqpEncode for SaslCode {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.code().encode_to(buf)
    }
}

impl AmqpDecode for SaslCode {
    fn decode_with(code: u8, buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode_with(code, buf)? {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Auth),
            2 => Ok(Self::Sys),
            3 => Ok(Self::SysPerm),
            4 => Ok(Self::SysTemp),
            other => Err(DecodeError::InvalidField {
                field: "code",
                reason: format!("unknown SASL code {other}"),
            }),
        }
    }
}

/// Final result of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslOutcome {
    /// Result code.
    pub code: SaslCode,
    /// Additional success data.
    pub additional_data: Option<Bytes>,
}

impl DescribedType for SaslOutcome {
    const CODE: u64 = 0x44;
    const NAME: &'static str = "amqp:sasl-outcome:list";
    const MIN_FIELDS: usize = 1;
    const MAX_FIELDS: usize = 2;

    fn decode_fields(fields: &mut FieldReader) -> Result<Self, DecodeError> {
        Ok(Self {
            code: fields.required("code")?,
            additional_data: fields.read()?,
        })
    }

    fn encode_fields(&self, fields: &mut FieldWriter<'_>) -> Result<(), EncodeError> {
        fields.write(&self.code)?;
        fields.write_opt(self.additional_data.as_ref())
    }
}

/// Body of a SASL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslPerformative {
    /// `sasl-mechanisms`
    Mechanisms(SaslMechanisms),
    /// `sasl-init`
    Init(SaslInit),
    /// `sasl-challenge`
    Challenge(SaslChallenge),
    /// `sasl-response`
    Response(SaslResponse),
    /// `sasl-outcome`
    Outcome(SaslOutcome),
}

impl SaslPerformative {
    /// Frame name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mechanisms(_) => "sasl-mechanisms",
            Self::Init(_) => "sasl-init",
            Self::Challenge(_) => "sasl-challenge",
            Self::Response(_) => "sasl-response",
            Self::Outcome(_) => "sasl-outcome",
        }
    }
}

impl AmqpEncode for SaslPerformative {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::Mechanisms(body) => body.encode_described(buf),
            Self::Init(body) => body.encode_described(buf),
            Self::Challenge(body) => body.encode_described(buf),
            Self::Response(body) => body.encode_described(buf),
            Self::Outcome(body) => body.encode_described(buf),
        }
    }
}

impl From<SaslMechanisms> for SaslPerformative {
    fn from(body: SaslMechanisms) -> Self {
        Self::Mechanisms(body)
    }
}

impl From<SaslInit> for SaslPerformative {
    fn from(body: SaslInit) -> Self {
        Self::Init(body)
    }
}

impl From<SaslChallenge> for SaslPerformative {
    fn from(body: SaslChallenge) -> Self {
        Self::Challenge(body)
    }
}

impl From<SaslResponse> for SaslPerformative {
    fn from(body: SaslResponse) -> Self {
        Self::Response(body)
    }
}

impl From<SaslOutcome> for SaslPerformative {
    fn from(body: SaslOutcome) -> Self {
        Self::Outcome(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_described, encode_described_to_bytes};

    #[test]
    fn mechanisms_are_an_array() {
        let frame = SaslMechanisms {
            mechanisms: vec![Symbol::from("PLAIN"), Symbol::from("ANONYMOUS")],
        };
        let mut bytes = encode_described_to_bytes(&frame).unwrap();
        assert_eq!(decode_described::<SaslMechanisms>(&mut bytes).unwrap(), frame);
    }

    #[test]
    fn outcome_code_roundtrips() {
        let outcome = SaslOutcome {
            code: SaslCode::Auth,
            additional_data: None,
        };
        let mut bytes = encode_described_to_bytes(&outcome).unwrap();
        assert_eq!(decode_described::<SaslOutcome>(&mut bytes).unwrap(), outcome);
    }
}
