//! Connection endpoint: header and open/close lifecycle, session routing.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::session::{Session, SessionState};
use super::{Outbox, SessionId};
use crate::codec::Symbol;
use crate::engine::{EngineConfig, EngineEvent, LinkOptions, SessionOptions};
use crate::error::{Error, Result, UsageError};
use crate::frame::{Frame, FrameBody, ProtocolHeader};
use crate::types::{
    Begin, Close, End, ErrorCondition, MIN_MAX_FRAME_SIZE, Open, Performative, conditions,
};

/// Connection lifecycle, derived from which headers, opens and closes have
/// gone each way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing exchanged.
    Idle,
    /// Our protocol header went out.
    HeaderSent,
    /// Peer's header arrived; ours has not gone out.
    HeaderReceived,
    /// Both headers exchanged.
    HeaderExchanged,
    /// Our open went out.
    OpenSent,
    /// Peer's open arrived; ours is pending.
    OpenReceived,
    /// Both opens exchanged.
    Active,
    /// Our close went out.
    CloseSent,
    /// Peer closed; ours is pending.
    CloseReceived,
    /// Both closes exchanged.
    Closed,
    /// Failed; nothing more is processed.
    Failed,
}

impl ConnectionState {
    /// State name for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::HeaderSent => "header-sent",
            Self::HeaderReceived => "header-received",
            Self::HeaderExchanged => "header-exchanged",
            Self::OpenSent => "open-sent",
            Self::OpenReceived => "open-received",
            Self::Active => "active",
            Self::CloseSent => "close-sent",
            Self::CloseReceived => "close-received",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::struct_excessive_bools)]
struct Progress {
    header_sent: bool,
    header_received: bool,
    open_sent: bool,
    open_received: bool,
    close_sent: bool,
    close_received: bool,
    failed: bool,
}

/// The AMQP connection and everything it owns.
#[derive(Debug)]
pub struct Connection {
    local_open: Open,
    remote_open: Option<Open>,
    remote_error: Option<ErrorCondition>,
    progress: Progress,
    sessions: BTreeMap<u16, Session>,
    remote_channels: HashMap<u16, u16>,
    session_defaults: SessionOptions,
    link_defaults: LinkOptions,
}

fn symbols(names: &[String]) -> Vec<Symbol> {
    names.iter().map(|name| Symbol::new(name.as_str())).collect()
}

impl Connection {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        let local_open = Open {
            container_id: config.container_id.clone(),
            hostname: config.hostname.clone(),
            max_frame_size: Some(config.max_frame_size),
            channel_max: (config.channel_max != u16::MAX).then_some(config.channel_max),
            idle_time_out: config.idle_timeout_millis(),
            offered_capabilities: symbols(&config.offered_capabilities),
            desired_capabilities: symbols(&config.desired_capabilities),
            ..Open::default()
        };
        Self {
            local_open,
            remote_open: None,
            remote_error: None,
            progress: Progress::default(),
            sessions: BTreeMap::new(),
            remote_channels: HashMap::new(),
            session_defaults: config.session.clone(),
            link_defaults: config.link.clone(),
        }
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        let p = self.progress;
        if p.failed {
            return ConnectionState::Failed;
        }
        match (p.close_sent, p.close_received) {
            (true, true) => return ConnectionState::Closed,
            (true, false) => return ConnectionState::CloseSent,
            (false, true) => return ConnectionState::CloseReceived,
            (false, false) => {}
        }
        match (p.open_sent, p.open_received) {
            (true, true) => return ConnectionState::Active,
            (true, false) => return ConnectionState::OpenSent,
            (false, true) => return ConnectionState::OpenReceived,
            (false, false) => {}
        }
        match (p.header_sent, p.header_received) {
            (true, true) => ConnectionState::HeaderExchanged,
            (true, false) => ConnectionState::HeaderSent,
            (false, true) => ConnectionState::HeaderReceived,
            (false, false) => ConnectionState::Idle,
        }
    }

    /// Open we send.
    #[must_use]
    pub const fn local_open(&self) -> &Open {
        &self.local_open
    }

    /// Peer's open.
    #[must_use]
    pub const fn remote_open(&self) -> Option<&Open> {
        self.remote_open.as_ref()
    }

    /// Error from the peer's close.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&ErrorCondition> {
        self.remote_error.as_ref()
    }

    /// Largest frame either side will accept, once both opens are known.
    #[must_use]
    pub fn max_frame_size(&self) -> u32 {
        let local = self.local_open.max_frame_size();
        self.remote_open
            .as_ref()
            .map_or(local, |remote| local.min(remote.max_frame_size()))
    }

    /// Highest usable channel.
    #[must_use]
    pub fn channel_max(&self) -> u16 {
        let local = self.local_open.channel_max();
        self.remote_open
            .as_ref()
            .map_or(local, |remote| local.min(remote.channel_max()))
    }

    /// Peer's idle timeout; we must send something at least this often.
    #[must_use]
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote_open
            .as_ref()
            .and_then(|open| open.idle_time_out)
            .filter(|millis| *millis > 0)
            .map(|millis| Duration::from_millis(u64::from(millis)))
    }

    /// Session by id.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id.channel())
    }

    /// Sessions in channel order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Whether we have sent open and not yet close.
    pub(crate) const fn open_pending_close(&self) -> bool {
        self.progress.open_sent && !self.progress.close_sent
    }

    pub(crate) const fn header_sent(&self) -> bool {
        self.progress.header_sent
    }

    fn invalid(&self, operation: &'static str) -> UsageError {
        UsageError::InvalidState {
            entity: "connection",
            operation,
            state: self.state().as_str(),
        }
    }

    fn require_usable(&self, operation: &'static str) -> std::result::Result<(), UsageError> {
        let p = self.progress;
        if p.open_sent && !p.close_sent && !p.close_received && !p.failed {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    pub(crate) fn session_mut(&mut self, id: SessionId) -> std::result::Result<&mut Session, UsageError> {
        self.sessions
            .get_mut(&id.channel())
            .ok_or(UsageError::UnknownSession(id.channel()))
    }

    /// Session ready for link operations.
    pub(crate) fn usable_session(&mut self, id: SessionId, operation: &'static str) -> std::result::Result<&mut Session, UsageError> {
        self.require_usable(operation)?;
        self.session_mut(id)
    }

    pub(crate) fn header_written(&mut self) {
        self.progress.header_sent = true;
    }

    pub(crate) fn on_header(&mut self, header: ProtocolHeader) -> Result<()> {
        if header.is_sasl() {
            return Err(Error::InvalidHeader(header.to_bytes()));
        }
        self.progress.header_received = true;
        debug!(state = self.state().as_str(), "protocol header received");
        Ok(())
    }

    pub(crate) fn open(&mut self, out: &mut Outbox) -> std::result::Result<(), UsageError> {
        let p = self.progress;
        if p.open_sent || p.close_sent || p.failed {
            return Err(self.invalid("open"));
        }
        self.progress.open_sent = true;
        out.frame(0, self.local_open.clone());
        debug!(state = self.state().as_str(), "connection open");
        Ok(())
    }

    pub(crate) fn close(&mut self, error: Option<ErrorCondition>, out: &mut Outbox) -> std::result::Result<(), UsageError> {
        let p = self.progress;
        if p.close_sent || p.failed {
            return Err(self.invalid("close"));
        }
        if !p.open_sent {
            self.open(out)?;
        }
        self.progress.close_sent = true;
        out.frame(0, Close { error });
        debug!(state = self.state().as_str(), "connection close");
        if self.progress.close_received {
            out.event(EngineEvent::ConnectionClosed);
        }
        Ok(())
    }

    pub(crate) fn fail(&mut self) {
        self.progress.failed = true;
        for session in self.sessions.values_mut() {
            session.fail();
        }
    }

    pub(crate) fn new_session(&mut self, options: Option<SessionOptions>) -> std::result::Result<SessionId, UsageError> {
        let p = self.progress;
        if p.close_sent || p.close_received || p.failed {
            return Err(self.invalid("create session"));
        }
        let channel = self.allocate_channel()?;
        let options = options.unwrap_or_else(|| self.session_defaults.clone());
        let id = SessionId(channel);
        self.sessions
            .insert(channel, Session::new(id, options, self.link_defaults.clone()));
        Ok(id)
    }

    fn allocate_channel(&self) -> std::result::Result<u16, UsageError> {
        let max = self.channel_max();
        (0..=max)
            .find(|channel| !self.sessions.contains_key(channel))
            .ok_or(UsageError::ChannelsExhausted(max))
    }

    pub(crate) fn begin(&mut self, id: SessionId, out: &mut Outbox) -> Result<()> {
        let begin = self.usable_session(id, "begin")?.begin_frame()?;
        out.frame(id.channel(), begin);
        Ok(())
    }

    pub(crate) fn end(&mut self, id: SessionId, error: Option<ErrorCondition>, out: &mut Outbox) -> Result<()> {
        let session = self.usable_session(id, "end")?;
        let (end, done) = session.end_frame(error)?;
        out.frame(id.channel(), end);
        if done {
            self.sessions.remove(&id.channel());
            out.event(EngineEvent::SessionEnded(id));
        }
        Ok(())
    }

    /// Apply one frame from the peer.
    pub(crate) fn on_frame(&mut self, frame: Frame, out: &mut Outbox) -> Result<()> {
        let Frame {
            channel,
            body,
            payload,
        } = frame;
        let performative = match body {
            FrameBody::Amqp(performative) => performative,
            FrameBody::Sasl(sasl) => {
                return Err(Error::protocol(
                    conditions::ILLEGAL_STATE,
                    format!("unexpected SASL frame {}", sasl.name()),
                ));
            }
        };
        trace!(channel, performative = performative.name(), "apply frame");
        if let Performative::Open(open) = performative {
            return self.on_open(open, out);
        }
        if !self.progress.open_received || self.progress.close_received {
            return Err(Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("{} in connection state {}", performative.name(), self.state().as_str()),
            ));
        }
        match performative {
            Performative::Close(close) => {
                self.on_close(close, out);
                Ok(())
            }
            Performative::Begin(begin) => self.on_begin(channel, begin, out),
            Performative::End(end) => self.on_end(channel, &end, out),
            other => self.on_link_frame(channel, other, payload, out),
        }
    }

    fn on_open(&mut self, open: Open, out: &mut Outbox) -> Result<()> {
        if self.progress.open_received {
            return Err(Error::protocol(conditions::ILLEGAL_STATE, "duplicate open"));
        }
        if open.max_frame_size() < MIN_MAX_FRAME_SIZE {
            return Err(Error::protocol(
                conditions::INVALID_FIELD,
                format!("max-frame-size {} is below {MIN_MAX_FRAME_SIZE}", open.max_frame_size()),
            ));
        }
        self.progress.open_received = true;
        debug!(
            container = %open.container_id,
            max_frame_size = open.max_frame_size(),
            channel_max = open.channel_max(),
            idle_time_out = ?open.idle_time_out,
            "remote open"
        );
        self.remote_open = Some(open);
        out.event(EngineEvent::RemoteOpen);
        Ok(())
    }

    fn on_close(&mut self, close: Close, out: &mut Outbox) {
        self.progress.close_received = true;
        debug!(error = ?close.error, "remote close");
        self.sessions.clear();
        self.remote_channels.clear();
        self.remote_error.clone_from(&close.error);
        out.event(EngineEvent::RemoteClose(close.error));
        if self.progress.close_sent {
            out.event(EngineEvent::ConnectionClosed);
        }
    }

    fn route(&self, channel: u16) -> Result<u16> {
        self.remote_channels.get(&channel).copied().ok_or_else(|| {
            Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("frame on unmapped channel {channel}"),
            )
        })
    }

    fn on_begin(&mut self, channel: u16, begin: Begin, out: &mut Outbox) -> Result<()> {
        if self.remote_channels.contains_key(&channel) {
            return Err(Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("begin on channel {channel} which is already mapped"),
            ));
        }
        let local = match begin.remote_channel {
            Some(local) => local,
            None => {
                let local = self
                    .allocate_channel()
                    .map_err(|err| Error::protocol(conditions::RESOURCE_LIMIT_EXCEEDED, err.to_string()))?;
                let session = Session::new(
                    SessionId(local),
                    self.session_defaults.clone(),
                    self.link_defaults.clone(),
                );
                self.sessions.insert(local, session);
                local
            }
        };
        let session = self.sessions.get_mut(&local).ok_or_else(|| {
            Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("begin answers unknown channel {local}"),
            )
        })?;
        session.on_begin(channel, begin)?;
        self.remote_channels.insert(channel, local);
        out.event(EngineEvent::RemoteBegin(SessionId(local)));
        Ok(())
    }

    fn on_end(&mut self, channel: u16, end: &End, out: &mut Outbox) -> Result<()> {
        let local = self.route(channel)?;
        self.remote_channels.remove(&channel);
        let id = SessionId(local);
        let session = self.session_mut(id)?;
        let done = session.on_end(end)?;
        out.event(EngineEvent::RemoteEnd {
            session: id,
            error: end.error.clone(),
        });
        if done {
            self.sessions.remove(&local);
            out.event(EngineEvent::SessionEnded(id));
        }
        Ok(())
    }

    fn on_link_frame(
        &mut self,
        channel: u16,
        performative: Performative,
        payload: Option<Bytes>,
        out: &mut Outbox,
    ) -> Result<()> {
        let local = self.route(channel)?;
        let session = self.session_mut(SessionId(local))?;
        if !session.accepts_link_frames() {
            if session.state() == SessionState::EndSent {
                trace!(channel, performative = performative.name(), "dropping frame on ending session");
                return Ok(());
            }
            return Err(Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("{} in session state {}", performative.name(), session.state().as_str()),
            ));
        }
        match performative {
            Performative::Attach(attach) => session.on_attach(*attach, out),
            Performative::Flow(flow) => session.on_flow(&flow, out),
            Performative::Transfer(transfer) => {
                session.on_transfer(&transfer, payload.unwrap_or_default(), out)
            }
            Performative::Disposition(disposition) => {
                session.on_disposition(&disposition, out);
                Ok(())
            }
            Performative::Detach(detach) => session.on_detach(&detach, out),
            other => Err(Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("unexpected {} on channel {channel}", other.name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        let mut connection = Connection::new(&EngineConfig::default());
        connection.header_written();
        connection.on_header(ProtocolHeader::Amqp).unwrap();
        connection
    }

    fn remote_open(max_frame_size: u32) -> Frame {
        Frame::amqp(
            0,
            Open {
                container_id: "peer".into(),
                max_frame_size: Some(max_frame_size),
                channel_max: Some(7),
                idle_time_out: Some(1000),
                ..Open::default()
            },
        )
    }

    #[test]
    fn state_follows_exchange() {
        let mut connection = Connection::new(&EngineConfig::default());
        assert_eq!(connection.state(), ConnectionState::Idle);
        connection.header_written();
        assert_eq!(connection.state(), ConnectionState::HeaderSent);
        connection.on_header(ProtocolHeader::Amqp).unwrap();
        assert_eq!(connection.state(), ConnectionState::HeaderExchanged);

        let mut out = Outbox::default();
        connection.open(&mut out).unwrap();
        assert_eq!(connection.state(), ConnectionState::OpenSent);
        connection.on_frame(remote_open(1024), &mut out).unwrap();
        assert_eq!(connection.state(), ConnectionState::Active);
        assert_eq!(out.events, vec![EngineEvent::RemoteOpen]);

        connection.close(None, &mut out).unwrap();
        assert_eq!(connection.state(), ConnectionState::CloseSent);
        connection.on_frame(Frame::amqp(0, Close::default()), &mut out).unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(out.events.last(), Some(&EngineEvent::ConnectionClosed));
    }

    #[test]
    fn negotiates_minimums() {
        let mut connection = connection();
        let mut out = Outbox::default();
        connection.open(&mut out).unwrap();
        connection.on_frame(remote_open(1024), &mut out).unwrap();
        assert_eq!(connection.max_frame_size(), 1024);
        assert_eq!(connection.channel_max(), 7);
        assert_eq!(connection.remote_idle_timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn frames_before_open_are_illegal() {
        let mut connection = connection();
        let mut out = Outbox::default();
        let err = connection
            .on_frame(Frame::amqp(0, Begin::default()), &mut out)
            .unwrap_err();
        assert_eq!(err.condition(), conditions::ILLEGAL_STATE);
    }

    #[test]
    fn remote_begin_creates_idle_session() {
        let mut connection = connection();
        let mut out = Outbox::default();
        connection.open(&mut out).unwrap();
        connection.on_frame(remote_open(4096), &mut out).unwrap();
        connection
            .on_frame(Frame::amqp(3, Begin { incoming_window: 10, outgoing_window: 10, ..Begin::default() }), &mut out)
            .unwrap();
        let id = SessionId(0);
        assert_eq!(out.events.last(), Some(&EngineEvent::RemoteBegin(id)));
        let session = connection.session(id).unwrap();
        assert_eq!(session.state(), SessionState::BeginReceived);
        assert_eq!(session.remote_channel(), Some(3));

        let mut out = Outbox::default();
        connection.begin(id, &mut out).unwrap();
        let FrameBody::Amqp(Performative::Begin(reply)) = &out.frames[0].body else {
            panic!("expected begin");
        };
        assert_eq!(reply.remote_channel, Some(3));
        assert_eq!(connection.session(id).unwrap().state(), SessionState::Mapped);
    }

    #[test]
    fn remote_close_tears_down_sessions() {
        let mut connection = connection();
        let mut out = Outbox::default();
        connection.open(&mut out).unwrap();
        connection.on_frame(remote_open(4096), &mut out).unwrap();
        let id = connection.new_session(None).unwrap();
        connection.begin(id, &mut out).unwrap();

        let error = ErrorCondition::new(conditions::CONNECTION_FORCED, "shutdown");
        let mut out = Outbox::default();
        connection
            .on_frame(Frame::amqp(0, Close { error: Some(error.clone()) }), &mut out)
            .unwrap();
        assert_eq!(out.events, vec![EngineEvent::RemoteClose(Some(error))]);
        assert!(connection.session(id).is_none());
        assert_eq!(connection.state(), ConnectionState::CloseReceived);
        assert!(matches!(connection.begin(id, &mut out), Err(Error::Usage(_))));
    }

    #[test]
    fn close_before_open_sends_both() {
        let mut connection = connection();
        let mut out = Outbox::default();
        connection.close(None, &mut out).unwrap();
        let names: Vec<_> = out.frames.iter().map(|frame| frame.body.name()).collect();
        assert_eq!(names, ["open", "close"]);
    }
}
