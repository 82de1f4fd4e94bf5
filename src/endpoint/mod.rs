//! Endpoint state machines
//!
//! A [`Connection`] owns its sessions keyed by local channel; a [`Session`]
//! owns its links keyed by local handle. Local operations produce frames,
//! remote performatives are validated against the current state. Both sides
//! append to an [`Outbox`] that the engine drains after every step.

mod connection;
mod delivery;
mod flow;
mod link;
mod session;

use std::fmt;

use crate::engine::EngineEvent;
use crate::frame::Frame;
use crate::types::Performative;

pub use connection::{Connection, ConnectionState};
pub use delivery::{Delivery, IncomingDelivery};
pub use flow::{LinkCredit, ReplenishPolicy, SessionWindow};
pub use link::{Link, LinkState};
pub use session::{Session, SessionState};

/// A session, named by its local channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u16);

impl SessionId {
    /// Local channel number.
    #[must_use]
    pub const fn channel(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// A link, named by its session and local handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId {
    session: SessionId,
    handle: u32,
}

impl LinkId {
    pub(crate) const fn new(session: SessionId, handle: u32) -> Self {
        Self { session, handle }
    }

    /// Owning session.
    #[must_use]
    pub const fn session(self) -> SessionId {
        self.session
    }

    /// Local handle.
    #[must_use]
    pub const fn handle(self) -> u32 {
        self.handle
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/h{}", self.session, self.handle)
    }
}

/// Frames and events produced by one endpoint step.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub(crate) frames: Vec<Frame>,
    pub(crate) events: Vec<EngineEvent>,
}

impl Outbox {
    pub(crate) fn frame(&mut self, channel: u16, performative: impl Into<Performative>) {
        self.frames.push(Frame::amqp(channel, performative));
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}
