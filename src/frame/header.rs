//! AMQP protocol header
//!
//! # Wire Format
//!
//! ```text
//! +---+---+---+---+---------+-------+-------+----------+
//! | A | M | Q | P | proto id| major | minor | revision |
//! +---+---+---+---+---------+-------+-------+----------+
//! ```
//!
//! Protocol id 0 selects the AMQP layer, 3 the SASL layer. Only version
//! 1.0.0 is accepted.

use std::fmt;

use crate::error::{Error, Result};

/// Length of the protocol header.
pub const HEADER_SIZE: usize = 8;

const AMQP_ID: u8 = 0;
const SASL_ID: u8 = 3;

/// Which protocol layer a header introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHeader {
    /// Plain AMQP.
    Amqp,
    /// SASL security layer.
    Sasl,
}

impl ProtocolHeader {
    /// Parse the eight header bytes.
    pub fn parse(raw: [u8; HEADER_SIZE]) -> Result<Self> {
        let [b'A', b'M', b'Q', b'P', id, 1, 0, 0] = raw else {
            return Err(Error::InvalidHeader(raw));
        };
        match id {
            AMQP_ID => Ok(Self::Amqp),
            SASL_ID => Ok(Self::Sasl),
            _ => Err(Error::InvalidHeader(raw)),
        }
    }

    /// Wire bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let id = match self {
            Self::Amqp => AMQP_ID,
            Self::Sasl => SASL_ID,
        };
        [b'A', b'M', b'Q', b'P', id, 1, 0, 0]
    }

    /// Whether this is the SASL header.
    #[must_use]
    pub const fn is_sasl(self) -> bool {
        matches!(self, Self::Sasl)
    }
}

impl fmt::Display for ProtocolHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amqp => f.write_str("AMQP 1.0.0"),
            Self::Sasl => f.write_str("AMQP-SASL 1.0.0"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_roundtrip() {
        for header in [ProtocolHeader::Amqp, ProtocolHeader::Sasl] {
            assert_eq!(ProtocolHeader::parse(header.to_bytes()).unwrap(), header);
        }
        assert_eq!(ProtocolHeader::Sasl.to_bytes(), *b"AMQP\x03\x01\x00\x00");
    }

    #[test]
    fn rejects_other_versions_and_ids() {
        assert!(ProtocolHeader::parse(*b"AMQP\x00\x00\x09\x01").is_err());
        assert!(ProtocolHeader::parse(*b"AMQP\x02\x01\x00\x00").is_err());
        assert!(matches!(
            ProtocolHeader::parse(*b"HTTP/1.1"),
            Err(Error::InvalidHeader(_))
        ));
    }
}
