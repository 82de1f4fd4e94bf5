//! Client-side SASL mechanisms.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::SaslError;

/// One client authentication mechanism.
pub trait Mechanism: Send {
    /// Registered mechanism name, e.g. `PLAIN`.
    fn name(&self) -> &'static str;

    /// Data carried by `sasl-init`.
    fn initial_response(&mut self) -> Result<Option<Bytes>, SaslError>;

    /// Answer a server challenge.
    fn challenge_response(&mut self, challenge: &[u8]) -> Result<Bytes, SaslError> {
        let _ = challenge;
        Err(self.failure("unexpected challenge"))
    }

    /// Check the additional data of a successful outcome.
    fn verify_completion(&mut self, additional_data: Option<&[u8]>) -> Result<(), SaslError> {
        let _ = additional_data;
        Ok(())
    }

    /// Error attributed to this mechanism.
    fn failure(&self, reason: &str) -> SaslError {
        SaslError::Mechanism {
            mechanism: self.name().to_owned(),
            reason: reason.to_owned(),
        }
    }
}

/// `ANONYMOUS` with an optional trace string.
#[derive(Debug, Clone, Default)]
pub struct Anonymous {
    trace: Option<String>,
}

impl Anonymous {
    /// Anonymous login that sends `trace` with the init frame.
    #[must_use]
    pub fn with_trace(trace: impl Into<String>) -> Self {
        Self {
            trace: Some(trace.into()),
        }
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>, SaslError> {
        Ok(self.trace.clone().map(Bytes::from))
    }
}

/// `PLAIN` username and password.
#[derive(Clone)]
pub struct Plain {
    authzid: Option<String>,
    username: String,
    password: String,
}

impl std::fmt::Debug for Plain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plain")
            .field("authzid", &self.authzid)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Plain {
    /// Credentials for `username`.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: None,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Act on behalf of another identity.
    #[must_use]
    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }

    /// Decode `authzid NUL authcid NUL passwd`.
    pub fn parse_response(response: &[u8]) -> Result<(Option<String>, String, String), SaslError> {
        let malformed = |reason: &str| SaslError::Mechanism {
            mechanism: "PLAIN".to_owned(),
            reason: reason.to_owned(),
        };
        let mut parts = response.split(|byte| *byte == 0);
        let (Some(authzid), Some(username), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("response must hold three NUL separated fields"));
        };
        let text = |raw: &[u8]| {
            String::from_utf8(raw.to_vec()).map_err(|_| malformed("response is not UTF-8"))
        };
        let authzid = (!authzid.is_empty()).then(|| text(authzid)).transpose()?;
        Ok((authzid, text(username)?, text(password)?))
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>, SaslError> {
        if self.username.is_empty() {
            return Err(self.failure("username is empty"));
        }
        let authzid = self.authzid.as_deref().unwrap_or_default();
        let mut out =
            BytesMut::with_capacity(authzid.len() + self.username.len() + self.password.len() + 2);
        out.put_slice(authzid.as_bytes());
        out.put_u8(0);
        out.put_slice(self.username.as_bytes());
        out.put_u8(0);
        out.put_slice(self.password.as_bytes());
        Ok(Some(out.freeze()))
    }
}

/// `EXTERNAL`: identity comes from the transport, e.g. a client certificate.
#[derive(Debug, Clone, Default)]
pub struct External {
    authzid: Option<String>,
}

impl External {
    /// Request a specific authorization identity.
    #[must_use]
    pub fn with_authzid(authzid: impl Into<String>) -> Self {
        Self {
            authzid: Some(authzid.into()),
        }
    }
}

impl Mechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Bytes>, SaslError> {
        Ok(Some(
            self.authzid.clone().map(Bytes::from).unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_layout() {
        let mut plain = Plain::new("user", "secret");
        let response = plain.initial_response().unwrap().unwrap();
        assert_eq!(&response[..], b"\0user\0secret");
        let parsed = Plain::parse_response(&response).unwrap();
        assert_eq!(parsed, (None, "user".to_owned(), "secret".to_owned()));
    }

    #[test]
    fn plain_with_authzid() {
        let mut plain = Plain::new("user", "pw").with_authzid("admin");
        let response = plain.initial_response().unwrap().unwrap();
        let (authzid, ..) = Plain::parse_response(&response).unwrap();
        assert_eq!(authzid.as_deref(), Some("admin"));
    }

    #[test]
    fn plain_rejects_malformed() {
        assert!(Plain::parse_response(b"no-separators").is_err());
        assert!(Plain::parse_response(b"\0a\0b\0c").is_err());
    }

    #[test]
    fn default_challenge_is_an_error() {
        let mut anonymous = Anonymous::default();
        assert_eq!(anonymous.initial_response().unwrap(), None);
        assert!(matches!(
            anonymous.challenge_response(b"x"),
            Err(SaslError::Mechanism { .. })
        ));
    }

    #[test]
    fn plain_debug_hides_password() {
        let rendered = format!("{:?}", Plain::new("u", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
