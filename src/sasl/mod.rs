//! SASL negotiation as pipeline handlers.
//!
//! The client handler hides the security layer from the engine: it swaps the
//! engine's AMQP header for a SASL header, holds every later write until the
//! outcome arrives, then releases them and removes itself. The server
//! handler answers the client's SASL header with the mechanism list and
//! drives a [`SaslAuthenticator`] until it produces an outcome.

mod mechanism;

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::Symbol;
use crate::engine::pipeline::{EngineHandler, HandlerContext, Inbound, Outbound};
use crate::error::{Error, Result, SaslError};
use crate::frame::{Frame, FrameBody, ProtocolHeader};
use crate::types::{
    SaslChallenge, SaslCode, SaslInit, SaslMechanisms, SaslOutcome, SaslPerformative, SaslResponse,
};

pub use mechanism::{Anonymous, External, Mechanism, Plain};

/// Name of both SASL handlers in the pipeline.
pub const SASL: &str = "sasl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStage {
    Start,
    AwaitHeader,
    AwaitMechanisms,
    AwaitOutcome,
    Done,
}

impl ClientStage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AwaitHeader => "await-header",
            Self::AwaitMechanisms => "await-mechanisms",
            Self::AwaitOutcome => "await-outcome",
            Self::Done => "done",
        }
    }
}

/// Client side of the SASL exchange.
pub struct SaslClientHandler {
    mechanisms: Vec<Box<dyn Mechanism>>,
    selected: Option<Box<dyn Mechanism>>,
    hostname: Option<String>,
    stage: ClientStage,
    held: VecDeque<Outbound>,
}

impl std::fmt::Debug for SaslClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslClientHandler")
            .field("stage", &self.stage)
            .field("selected", &self.selected.as_ref().map(|m| m.name()))
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

impl SaslClientHandler {
    /// Offer `mechanisms` in preference order.
    #[must_use]
    pub fn new(mechanisms: Vec<Box<dyn Mechanism>>, hostname: Option<String>) -> Self {
        Self {
            mechanisms,
            selected: None,
            hostname,
            stage: ClientStage::Start,
            held: VecDeque::new(),
        }
    }

    fn unexpected(&self, frame: &'static str) -> Error {
        SaslError::UnexpectedFrame {
            frame,
            state: self.stage.as_str(),
        }
        .into()
    }

    fn on_mechanisms(&mut self, ctx: &mut HandlerContext, offered: &SaslMechanisms) -> Result<()> {
        let position = self
            .mechanisms
            .iter()
            .position(|mechanism| offered.mechanisms.iter().any(|name| name.as_str() == mechanism.name()))
            .ok_or_else(|| SaslError::NoMatchingMechanism {
                offered: offered.mechanisms.iter().map(|name| name.as_str().to_owned()).collect(),
            })?;
        let mut mechanism = self.mechanisms.swap_remove(position);
        let init = SaslInit {
            mechanism: Symbol::new(mechanism.name()),
            initial_response: mechanism.initial_response()?,
            hostname: self.hostname.clone(),
        };
        debug!(mechanism = mechanism.name(), "SASL mechanism selected");
        self.selected = Some(mechanism);
        self.stage = ClientStage::AwaitOutcome;
        ctx.fire_write(Outbound::Frame(Frame::sasl(init)));
        Ok(())
    }

    fn on_challenge(&mut self, ctx: &mut HandlerContext, challenge: &SaslChallenge) -> Result<()> {
        let Some(mechanism) = self.selected.as_mut() else {
            return Err(self.unexpected("sasl-challenge"));
        };
        let response = mechanism.challenge_response(&challenge.challenge)?;
        ctx.fire_write(Outbound::Frame(Frame::sasl(SaslResponse { response })));
        Ok(())
    }

    fn on_outcome(&mut self, ctx: &mut HandlerContext, outcome: &SaslOutcome) -> Result<()> {
        ctx.fire_read(Inbound::SaslOutcome(outcome.code));
        if outcome.code != SaslCode::Ok {
            warn!(code = outcome.code.code(), "SASL authentication failed");
            return Err(SaslError::AuthenticationFailed {
                code: outcome.code.code(),
            }
            .into());
        }
        if let Some(mechanism) = self.selected.as_mut() {
            mechanism.verify_completion(outcome.additional_data.as_deref())?;
        }
        debug!(held = self.held.len(), "SASL complete");
        self.stage = ClientStage::Done;
        for held in self.held.drain(..) {
            ctx.fire_write(held);
        }
        ctx.remove_self();
        Ok(())
    }
}

impl EngineHandler for SaslClientHandler {
    fn name(&self) -> &'static str {
        SASL
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext, item: Inbound) -> Result<()> {
        match (self.stage, item) {
            (ClientStage::Done, item) => {
                ctx.fire_read(item);
                Ok(())
            }
            (ClientStage::AwaitHeader, Inbound::Header(ProtocolHeader::Sasl)) => {
                self.stage = ClientStage::AwaitMechanisms;
                Ok(())
            }
            (_, Inbound::Header(header)) => Err(Error::InvalidHeader(header.to_bytes())),
            (stage, Inbound::Frame(Frame { body: FrameBody::Sasl(sasl), .. })) => match (stage, &sasl) {
                (ClientStage::AwaitMechanisms, SaslPerformative::Mechanisms(offered)) => {
                    self.on_mechanisms(ctx, offered)
                }
                (ClientStage::AwaitOutcome, SaslPerformative::Challenge(challenge)) => {
                    self.on_challenge(ctx, challenge)
                }
                (ClientStage::AwaitOutcome, SaslPerformative::Outcome(outcome)) => {
                    self.on_outcome(ctx, outcome)
                }
                _ => Err(self.unexpected(sasl.name())),
            },
            (_, Inbound::Frame(frame)) => Err(self.unexpected(frame.body.name())),
            (_, item) => {
                ctx.fire_read(item);
                Ok(())
            }
        }
    }

    fn handle_write(&mut self, ctx: &mut HandlerContext, item: Outbound) -> Result<()> {
        match (self.stage, item) {
            (ClientStage::Done, item) => ctx.fire_write(item),
            (ClientStage::Start, Outbound::Header(ProtocolHeader::Amqp)) => {
                self.stage = ClientStage::AwaitHeader;
                self.held.push_back(Outbound::Header(ProtocolHeader::Amqp));
                ctx.fire_write(Outbound::Header(ProtocolHeader::Sasl));
            }
            (_, item) => self.held.push_back(item),
        }
        Ok(())
    }
}

/// One step of a server-side exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send a challenge and wait for a response.
    Challenge(Bytes),
    /// Finish with this outcome.
    Outcome {
        /// Result code.
        code: SaslCode,
        /// Data for the client's `verify_completion`.
        additional_data: Option<Bytes>,
    },
}

impl SaslStep {
    /// Successful outcome without additional data.
    #[must_use]
    pub const fn ok() -> Self {
        Self::Outcome {
            code: SaslCode::Ok,
            additional_data: None,
        }
    }

    /// Failed outcome.
    #[must_use]
    pub const fn fail(code: SaslCode) -> Self {
        Self::Outcome {
            code,
            additional_data: None,
        }
    }
}

/// Validates client credentials on the server.
pub trait SaslAuthenticator: Send {
    /// Mechanism names offered to clients, in preference order.
    fn mechanisms(&self) -> Vec<Symbol>;

    /// Handle `sasl-init`.
    fn init(&mut self, mechanism: &str, initial_response: Option<&[u8]>, hostname: Option<&str>) -> SaslStep;

    /// Handle `sasl-response` to a challenge.
    fn response(&mut self, response: &[u8]) -> SaslStep {
        let _ = response;
        SaslStep::fail(SaslCode::Auth)
    }
}

/// Accepts `PLAIN` against a fixed user table and optionally `ANONYMOUS`.
#[derive(Clone, Default)]
pub struct PlainAuthenticator {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl std::fmt::Debug for PlainAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainAuthenticator")
            .field("users", &self.users.len())
            .field("allow_anonymous", &self.allow_anonymous)
            .finish()
    }
}

impl PlainAuthenticator {
    /// Authenticator without users.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    #[must_use]
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Also accept `ANONYMOUS`.
    #[must_use]
    pub const fn allow_anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }
}

impl SaslAuthenticator for PlainAuthenticator {
    fn mechanisms(&self) -> Vec<Symbol> {
        let mut mechanisms = vec![Symbol::new("PLAIN")];
        if self.allow_anonymous {
            mechanisms.push(Symbol::new("ANONYMOUS"));
        }
        mechanisms
    }

    fn init(&mut self, mechanism: &str, initial_response: Option<&[u8]>, _hostname: Option<&str>) -> SaslStep {
        match mechanism {
            "ANONYMOUS" if self.allow_anonymous => SaslStep::ok(),
            "PLAIN" => {
                let Ok((_, username, password)) = Plain::parse_response(initial_response.unwrap_or_default()) else {
                    return SaslStep::fail(SaslCode::Auth);
                };
                if self.users.get(&username) == Some(&password) {
                    SaslStep::ok()
                } else {
                    SaslStep::fail(SaslCode::Auth)
                }
            }
            _ => SaslStep::fail(SaslCode::Auth),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerStage {
    AwaitHeader,
    AwaitInit,
    AwaitResponse,
    Done,
}

impl ServerStage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitHeader => "await-header",
            Self::AwaitInit => "await-init",
            Self::AwaitResponse => "await-response",
            Self::Done => "done",
        }
    }
}

/// Server side of the SASL exchange.
pub struct SaslServerHandler {
    authenticator: Box<dyn SaslAuthenticator>,
    stage: ServerStage,
}

impl std::fmt::Debug for SaslServerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslServerHandler")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl SaslServerHandler {
    /// Authenticate clients with `authenticator`.
    #[must_use]
    pub fn new(authenticator: Box<dyn SaslAuthenticator>) -> Self {
        Self {
            authenticator,
            stage: ServerStage::AwaitHeader,
        }
    }

    fn unexpected(&self, frame: &'static str) -> Error {
        SaslError::UnexpectedFrame {
            frame,
            state: self.stage.as_str(),
        }
        .into()
    }

    fn apply(&mut self, ctx: &mut HandlerContext, step: SaslStep) -> Result<()> {
        match step {
            SaslStep::Challenge(challenge) => {
                self.stage = ServerStage::AwaitResponse;
                ctx.fire_write(Outbound::Frame(Frame::sasl(SaslChallenge { challenge })));
                Ok(())
            }
            SaslStep::Outcome {
                code,
                additional_data,
            } => {
                self.stage = ServerStage::Done;
                ctx.fire_write(Outbound::Frame(Frame::sasl(SaslOutcome {
                    code,
                    additional_data,
                })));
                ctx.fire_read(Inbound::SaslOutcome(code));
                ctx.remove_self();
                if code == SaslCode::Ok {
                    debug!("SASL client authenticated");
                    Ok(())
                } else {
                    warn!(code = code.code(), "SASL client rejected");
                    Err(SaslError::AuthenticationFailed { code: code.code() }.into())
                }
            }
        }
    }
}

impl EngineHandler for SaslServerHandler {
    fn name(&self) -> &'static str {
        SASL
    }

    fn handle_read(&mut self, ctx: &mut HandlerContext, item: Inbound) -> Result<()> {
        match (self.stage, item) {
            (ServerStage::Done, item) => {
                ctx.fire_read(item);
                Ok(())
            }
            (ServerStage::AwaitHeader, Inbound::Header(ProtocolHeader::Sasl)) => {
                self.stage = ServerStage::AwaitInit;
                ctx.fire_write(Outbound::Header(ProtocolHeader::Sasl));
                ctx.fire_write(Outbound::Frame(Frame::sasl(SaslMechanisms {
                    mechanisms: self.authenticator.mechanisms(),
                })));
                Ok(())
            }
            (_, Inbound::Header(header)) => Err(Error::InvalidHeader(header.to_bytes())),
            (stage, Inbound::Frame(Frame { body: FrameBody::Sasl(sasl), .. })) => match (stage, sasl) {
                (ServerStage::AwaitInit, SaslPerformative::Init(init)) => {
                    debug!(mechanism = init.mechanism.as_str(), "SASL init");
                    let step = self.authenticator.init(
                        init.mechanism.as_str(),
                        init.initial_response.as_deref(),
                        init.hostname.as_deref(),
                    );
                    self.apply(ctx, step)
                }
                (ServerStage::AwaitResponse, SaslPerformative::Response(response)) => {
                    let step = self.authenticator.response(&response.response);
                    self.apply(ctx, step)
                }
                (_, other) => Err(self.unexpected(other.name())),
            },
            (_, Inbound::Frame(frame)) => Err(self.unexpected(frame.body.name())),
            (_, item) => {
                ctx.fire_read(item);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sasl_frame(body: impl Into<SaslPerformative>) -> Inbound {
        Inbound::Frame(Frame::sasl(body))
    }

    fn call_read(handler: &mut dyn EngineHandler, item: Inbound) -> (Result<()>, HandlerContext) {
        let mut ctx = HandlerContext::default();
        let result = handler.handle_read(&mut ctx, item);
        (result, ctx)
    }

    #[test]
    fn client_holds_writes_until_outcome() {
        let mut client = SaslClientHandler::new(vec![Box::new(Plain::new("u", "p"))], None);
        let mut ctx = HandlerContext::default();
        client
            .handle_write(&mut ctx, Outbound::Header(ProtocolHeader::Amqp))
            .unwrap();
        client
            .handle_write(&mut ctx, Outbound::Heartbeat)
            .unwrap();
        assert_eq!(ctx.into_parts().1, vec![Outbound::Header(ProtocolHeader::Sasl)]);

        let (result, _) = call_read(&mut client, Inbound::Header(ProtocolHeader::Sasl));
        result.unwrap();
        let (result, ctx) = call_read(
            &mut client,
            sasl_frame(SaslMechanisms {
                mechanisms: vec![Symbol::new("ANONYMOUS"), Symbol::new("PLAIN")],
            }),
        );
        result.unwrap();
        let writes = ctx.into_parts().1;
        let [Outbound::Frame(Frame { body: FrameBody::Sasl(SaslPerformative::Init(init)), .. })] = &writes[..] else {
            panic!("expected sasl-init, got {writes:?}");
        };
        assert_eq!(init.mechanism.as_str(), "PLAIN");

        let (result, ctx) = call_read(
            &mut client,
            sasl_frame(SaslOutcome {
                code: SaslCode::Ok,
                additional_data: None,
            }),
        );
        result.unwrap();
        let (reads, writes) = ctx.into_parts();
        assert_eq!(reads, vec![Inbound::SaslOutcome(SaslCode::Ok)]);
        assert_eq!(writes, vec![Outbound::Header(ProtocolHeader::Amqp), Outbound::Heartbeat]);
    }

    #[test]
    fn client_without_common_mechanism_fails() {
        let mut client = SaslClientHandler::new(vec![Box::new(External::default())], None);
        let mut ctx = HandlerContext::default();
        client
            .handle_write(&mut ctx, Outbound::Header(ProtocolHeader::Amqp))
            .unwrap();
        call_read(&mut client, Inbound::Header(ProtocolHeader::Sasl)).0.unwrap();
        let (result, _) = call_read(
            &mut client,
            sasl_frame(SaslMechanisms {
                mechanisms: vec![Symbol::new("PLAIN")],
            }),
        );
        assert!(matches!(
            result,
            Err(Error::Sasl(SaslError::NoMatchingMechanism { .. }))
        ));
    }

    #[test]
    fn client_rejects_plain_header() {
        let mut client = SaslClientHandler::new(vec![Box::new(Anonymous::default())], None);
        let mut ctx = HandlerContext::default();
        client
            .handle_write(&mut ctx, Outbound::Header(ProtocolHeader::Amqp))
            .unwrap();
        let (result, _) = call_read(&mut client, Inbound::Header(ProtocolHeader::Amqp));
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn server_authenticates_plain() {
        let authenticator = PlainAuthenticator::new().with_user("guest", "guest");
        let mut server = SaslServerHandler::new(Box::new(authenticator));
        let (result, ctx) = call_read(&mut server, Inbound::Header(ProtocolHeader::Sasl));
        result.unwrap();
        assert_eq!(ctx.into_parts().1.len(), 2);

        let (result, ctx) = call_read(
            &mut server,
            sasl_frame(SaslInit {
                mechanism: Symbol::new("PLAIN"),
                initial_response: Some(Bytes::from_static(b"\0guest\0guest")),
                hostname: None,
            }),
        );
        result.unwrap();
        let (reads, writes) = ctx.into_parts();
        assert_eq!(reads, vec![Inbound::SaslOutcome(SaslCode::Ok)]);
        assert!(matches!(
            &writes[..],
            [Outbound::Frame(Frame { body: FrameBody::Sasl(SaslPerformative::Outcome(_)), .. })]
        ));
    }

    #[test]
    fn server_rejects_bad_password() {
        let authenticator = PlainAuthenticator::new().with_user("guest", "guest");
        let mut server = SaslServerHandler::new(Box::new(authenticator));
        call_read(&mut server, Inbound::Header(ProtocolHeader::Sasl)).0.unwrap();
        let (result, ctx) = call_read(
            &mut server,
            sasl_frame(SaslInit {
                mechanism: Symbol::new("PLAIN"),
                initial_response: Some(Bytes::from_static(b"\0guest\0wrong")),
                hostname: None,
            }),
        );
        assert!(matches!(
            result,
            Err(Error::Sasl(SaslError::AuthenticationFailed { code: 1 }))
        ));
        assert_eq!(ctx.into_parts().1.len(), 1);
    }

    #[test]
    fn anonymous_needs_opt_in() {
        let mut strict = PlainAuthenticator::new();
        assert_eq!(strict.init("ANONYMOUS", None, None), SaslStep::fail(SaslCode::Auth));
        let mut open = PlainAuthenticator::new().allow_anonymous();
        assert_eq!(open.init("ANONYMOUS", None, None), SaslStep::ok());
        assert_eq!(open.mechanisms().len(), 2);
    }
}
