//! Events surfaced to the application.

use crate::endpoint::{LinkId, SessionId};
use crate::error::Error;
use crate::types::{DeliveryState, ErrorCondition, SaslCode, SequenceNumber};

/// Something the peer did, or a state the engine reached.
///
/// Events are queued in the order they happen and drained with
/// [`crate::engine::Engine::poll_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// SASL negotiation finished with this outcome.
    SaslOutcome(SaslCode),
    /// Peer's open arrived.
    RemoteOpen,
    /// Peer closed the connection.
    RemoteClose(Option<ErrorCondition>),
    /// Both sides have closed the connection.
    ConnectionClosed,
    /// Peer began a session, or answered ours.
    RemoteBegin(SessionId),
    /// Peer ended a session.
    RemoteEnd {
        /// Session ended.
        session: SessionId,
        /// Error carried by the end.
        error: Option<ErrorCondition>,
    },
    /// Both sides have ended the session.
    SessionEnded(SessionId),
    /// Peer attached a link, or answered our attach.
    RemoteAttach(LinkId),
    /// Peer detached a link.
    RemoteDetach {
        /// Link detached.
        link: LinkId,
        /// Closed rather than suspended.
        closed: bool,
        /// Error carried by the detach.
        error: Option<ErrorCondition>,
    },
    /// Both sides have detached the link.
    LinkDetached(LinkId),
    /// Sender credit changed.
    LinkCredit(LinkId),
    /// Receiver asked the sender to use or give back all credit.
    DrainRequested(LinkId),
    /// Our drain request completed.
    Drained(LinkId),
    /// A complete incoming delivery is ready for `take_delivery`.
    Delivery {
        /// Receiving link.
        link: LinkId,
        /// Session-scoped delivery id.
        delivery_id: SequenceNumber,
    },
    /// Sender aborted a partial delivery; its frames were discarded.
    DeliveryAborted {
        /// Receiving link.
        link: LinkId,
        /// Session-scoped delivery id.
        delivery_id: SequenceNumber,
    },
    /// Peer changed the state of, or settled, one of our deliveries.
    DeliveryUpdated {
        /// Link of the delivery.
        link: LinkId,
        /// Session-scoped delivery id.
        delivery_id: SequenceNumber,
        /// New remote state.
        state: Option<DeliveryState>,
        /// Whether the peer settled it.
        settled: bool,
    },
    /// The engine failed; no further frames are processed.
    Failed(Error),
}
