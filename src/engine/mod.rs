//! The sans-I/O engine.
//!
//! An [`Engine`] owns one connection and its pipeline. Bytes from the
//! transport go in through [`Engine::ingest`]; encoded bytes come out through
//! [`Engine::take_output`] or an installed [`OutputSink`]. Everything the peer
//! does is reported as an [`EngineEvent`]. Nothing here blocks, spawns or
//! reads a clock; time advances only through [`Engine::tick`].

mod codec_handler;
mod config;
mod event;
pub mod executor;
pub mod pipeline;
mod timers;

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, instrument, trace, warn};

use crate::endpoint::{
    Connection, ConnectionState, IncomingDelivery, Link, LinkId, Outbox, Session, SessionId,
};
use crate::error::{Error, Result, UsageError};
use crate::frame::{Frame, FrameEncoder, ProtocolHeader};
use crate::metrics::Metrics;
use crate::sasl::{Mechanism, SaslAuthenticator, SaslClientHandler, SaslServerHandler};
use crate::types::{
    Close, DeliveryState, ErrorCondition, Role, SequenceNumber, Source, Target, TargetKind,
};

pub use codec_handler::{FRAME_CODEC, FRAME_LOGGER, FrameCodecHandler, FrameLoggerHandler};
pub use config::{EngineConfig, EngineRole, LinkOptions, SessionOptions};
pub use event::EngineEvent;
pub use executor::{ExecutorHandle, Scheduler, SerialExecutor, TaskId};
use pipeline::{Dispatch, Inbound, Outbound, Pipeline, TransportLimits};
use timers::{Expired, Timers};

/// Receives encoded bytes as soon as the engine produces them.
pub trait OutputSink: Send {
    /// Hand bytes to the transport.
    fn write(&mut self, bytes: Bytes) -> Result<()>;
}

impl<F> OutputSink for F
where
    F: FnMut(Bytes) -> Result<()> + Send,
{
    fn write(&mut self, bytes: Bytes) -> Result<()> {
        self(bytes)
    }
}

/// One AMQP connection driven by the caller.
pub struct Engine {
    config: EngineConfig,
    connection: Connection,
    pipeline: Pipeline,
    encoder: FrameEncoder,
    timers: Timers,
    events: VecDeque<EngineEvent>,
    output: VecDeque<Bytes>,
    sink: Option<Box<dyn OutputSink>>,
    started: bool,
    failure: Option<Error>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("role", &self.config.role)
            .field("state", &self.connection.state())
            .field("pipeline", &self.pipeline)
            .field("events", &self.events.len())
            .field("output", &self.output.len())
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine for a validated configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut pipeline = Pipeline::new();
        pipeline.add_last(Box::new(FrameCodecHandler::new(config.max_frame_size)))?;
        if config.trace_frames {
            pipeline.add_last(Box::new(FrameLoggerHandler))?;
        }
        Ok(Self {
            connection: Connection::new(&config),
            pipeline,
            encoder: FrameEncoder::default(),
            timers: Timers::default(),
            events: VecDeque::new(),
            output: VecDeque::new(),
            sink: None,
            started: false,
            failure: None,
            config,
        })
    }

    /// Authenticate to the server with the first of `mechanisms` it offers.
    pub fn with_sasl_client(mut self, mechanisms: Vec<Box<dyn Mechanism>>) -> Result<Self> {
        self.require_sasl_slot(EngineRole::Client)?;
        let hostname = self.config.hostname.clone();
        self.pipeline
            .add_last(Box::new(SaslClientHandler::new(mechanisms, hostname)))?;
        Ok(self)
    }

    /// Require clients to authenticate through `authenticator`.
    pub fn with_sasl_server(mut self, authenticator: Box<dyn SaslAuthenticator>) -> Result<Self> {
        self.require_sasl_slot(EngineRole::Server)?;
        self.pipeline
            .add_last(Box::new(SaslServerHandler::new(authenticator)))?;
        Ok(self)
    }

    fn require_sasl_slot(&self, role: EngineRole) -> Result<()> {
        if self.started {
            return Err(Error::Config("SASL must be configured before start".into()));
        }
        if self.config.role != role {
            return Err(Error::Config(format!(
                "SASL {role:?} layer on a {:?} engine",
                self.config.role
            )));
        }
        Ok(())
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The connection endpoint.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Session by id.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.connection.session(id)
    }

    /// Link by id.
    #[must_use]
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.connection.session(id.session())?.link(id.handle())
    }

    /// Installed pipeline handlers from the transport end.
    pub fn handlers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pipeline.names()
    }

    /// Error that failed the engine.
    #[must_use]
    pub const fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Whether the engine has failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Next queued event.
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Everything encoded since the last call. Empty when nothing is pending.
    pub fn take_output(&mut self) -> Bytes {
        match self.output.len() {
            0 => Bytes::new(),
            1 => self.output.pop_front().unwrap_or_default(),
            _ => {
                let size = self.output.iter().map(Bytes::len).sum();
                let mut out = BytesMut::with_capacity(size);
                for chunk in self.output.drain(..) {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }

    /// Deliver output to `sink` from now on; pending output goes first.
    pub fn set_output_sink(&mut self, sink: Box<dyn OutputSink>) -> Result<()> {
        self.sink = Some(sink);
        let pending: Vec<Bytes> = self.output.drain(..).collect();
        self.emit(pending)
    }

    /// Earliest instant at which [`Self::tick`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .next_deadline(self.config.idle_timeout, self.connection.remote_idle_timeout())
    }

    /// Begin the protocol. A client writes its header now; a server waits
    /// for the client's.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_healthy()?;
        if self.started {
            return Err(self.not_startable("start"));
        }
        self.started = true;
        Metrics::record_connection_open();
        debug!(role = ?self.config.role, handlers = ?self.pipeline, "engine started");
        if self.config.role == EngineRole::Client {
            let result = self.write_header();
            self.escalate(result)?;
        }
        Ok(())
    }

    fn not_startable(&self, operation: &'static str) -> Error {
        UsageError::InvalidState {
            entity: "engine",
            operation,
            state: if self.started { "started" } else { "not started" },
        }
        .into()
    }

    fn write_header(&mut self) -> Result<()> {
        self.connection.header_written();
        let dispatch = self.pipeline.write([Outbound::Header(ProtocolHeader::Amqp)]);
        self.complete(dispatch)
    }

    /// Feed bytes read from the transport.
    #[instrument(level = "trace", skip(self, input), fields(len = input.len()))]
    pub fn ingest(&mut self, input: Bytes) -> Result<()> {
        self.ensure_healthy()?;
        if !self.started {
            return Err(self.not_startable("ingest"));
        }
        let dispatch = self.pipeline.read([Inbound::Bytes(input)]);
        let result = self.complete(dispatch);
        self.escalate(result)
    }

    /// Report that the transport broke.
    pub fn transport_failed(&mut self, reason: impl Into<String>) {
        self.fail(Error::Transport(reason.into()));
    }

    /// Advance time to `now`, firing any expired deadline.
    #[instrument(level = "trace", skip(self))]
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        self.ensure_healthy()?;
        if !self.started || self.connection.state() == ConnectionState::Closed {
            return Ok(());
        }
        let expired = self.timers.advance(
            now,
            self.config.idle_timeout,
            self.connection.remote_idle_timeout(),
        );
        for timer in expired {
            let result = match timer {
                Expired::Open => Err(Error::Timeout("open")),
                Expired::Close => Err(Error::Timeout("close")),
                Expired::Drain(link) => {
                    warn!(%link, "drain timed out");
                    Err(Error::Timeout("drain"))
                }
                Expired::Idle => Err(Error::Timeout("idle")),
                Expired::Heartbeat => {
                    trace!("heartbeat");
                    let dispatch = self.pipeline.write([Outbound::Heartbeat]);
                    self.complete(dispatch)
                }
            };
            self.escalate(result)?;
        }
        Ok(())
    }

    /// Send our open.
    pub fn open(&mut self) -> Result<()> {
        self.step(|connection, _, out| Ok(connection.open(out)?))?;
        if self.connection.remote_open().is_none() {
            self.timers.arm_open(self.config.open_timeout);
        }
        Ok(())
    }

    /// Send our close, opening first if needed.
    pub fn close(&mut self, error: Option<ErrorCondition>) -> Result<()> {
        self.step(|connection, _, out| Ok(connection.close(error, out)?))?;
        if self.connection.state() != ConnectionState::Closed {
            self.timers.arm_close(self.config.close_timeout);
        }
        Ok(())
    }

    /// Create a session using the configured defaults unless `options` is given.
    pub fn new_session(&mut self, options: Option<SessionOptions>) -> Result<SessionId> {
        self.step(|connection, _, _| Ok(connection.new_session(options)?))
    }

    /// Send begin for a local session or answer a remote one.
    pub fn begin(&mut self, session: SessionId) -> Result<()> {
        self.step(|connection, _, out| connection.begin(session, out))
    }

    /// Send end.
    pub fn end(&mut self, session: SessionId, error: Option<ErrorCondition>) -> Result<()> {
        self.step(|connection, _, out| connection.end(session, error, out))
    }

    /// Create a link on `session`.
    pub fn new_link(
        &mut self,
        session: SessionId,
        name: impl Into<String>,
        role: Role,
        source: Option<Source>,
        target: Option<TargetKind>,
        options: Option<LinkOptions>,
    ) -> Result<LinkId> {
        let name = name.into();
        self.step(|connection, _, _| {
            Ok(connection
                .session_mut(session)?
                .new_link(name, role, source, target, options)?)
        })
    }

    /// Sending link to `address`.
    pub fn new_sender(
        &mut self,
        session: SessionId,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<LinkId> {
        let target = TargetKind::Target(Target::new(address));
        self.new_link(session, name, Role::Sender, Some(Source::default()), Some(target), None)
    }

    /// Receiving link from `address`.
    pub fn new_receiver(
        &mut self,
        session: SessionId,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<LinkId> {
        let target = TargetKind::Target(Target::default());
        self.new_link(session, name, Role::Receiver, Some(Source::new(address)), Some(target), None)
    }

    /// Send attach for a local link or answer a remote one.
    pub fn attach(&mut self, link: LinkId) -> Result<()> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "attach")?
                .attach(link.handle(), out)
        })
    }

    /// Send detach; `closed` ends the link instead of suspending it.
    pub fn detach(&mut self, link: LinkId, closed: bool, error: Option<ErrorCondition>) -> Result<()> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "detach")?
                .detach(link.handle(), closed, error, out)
        })
    }

    /// Send one delivery, split across as many frames as the peer's
    /// max-frame-size requires. Returns the delivery id.
    ///
    /// A `settled` send fails on a link whose sender settle mode is
    /// unsettled; a settled-mode link settles every delivery.
    #[instrument(level = "trace", skip(self, tag, payload), fields(len = payload.len()))]
    pub fn send(&mut self, link: LinkId, tag: Bytes, payload: Bytes, settled: bool) -> Result<SequenceNumber> {
        self.step(|connection, encoder, out| {
            connection
                .usable_session(link.session(), "send")?
                .send(link.handle(), tag, payload, settled, encoder, out)
        })
    }

    /// Add credit on a receiver without a credit window.
    pub fn grant_credit(&mut self, link: LinkId, credit: u32) -> Result<()> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "grant credit")?
                .grant_credit(link.handle(), credit, out)
        })
    }

    /// Ask the sender to use or return all outstanding credit.
    pub fn drain(&mut self, link: LinkId) -> Result<()> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "drain")?
                .drain(link.handle(), out)
        })?;
        self.timers.arm_drain(link, self.config.drain_timeout);
        Ok(())
    }

    /// Sender answer to a drain request: give back all remaining credit.
    pub fn drained(&mut self, link: LinkId) -> Result<()> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "drained")?
                .drained(link.handle(), out)
        })
    }

    /// Next complete delivery on a receiver. Replenishes credit per policy.
    pub fn take_delivery(&mut self, link: LinkId) -> Result<Option<IncomingDelivery>> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "take delivery")?
                .take_delivery(link.handle(), out)
        })
    }

    /// Update or settle a delivery.
    pub fn disposition(
        &mut self,
        link: LinkId,
        delivery_id: SequenceNumber,
        state: Option<DeliveryState>,
        settled: bool,
    ) -> Result<()> {
        self.step(|connection, _, out| {
            connection
                .usable_session(link.session(), "disposition")?
                .disposition(link.handle(), delivery_id, state, settled, out)
        })
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.failure {
            Some(err) => Err(Error::EngineFailed(Box::new(err.clone()))),
            None => Ok(()),
        }
    }

    /// Run a local operation and flush what it produced. Operation errors
    /// leave the engine untouched; flushing errors fail it.
    fn step<T>(
        &mut self,
        operation: impl FnOnce(&mut Connection, &FrameEncoder, &mut Outbox) -> Result<T>,
    ) -> Result<T> {
        self.ensure_healthy()?;
        if !self.started {
            return Err(self.not_startable("endpoint operation"));
        }
        let mut out = Outbox::default();
        let value = operation(&mut self.connection, &self.encoder, &mut out)?;
        let result = self.flush(out);
        self.escalate(result)?;
        Ok(value)
    }

    fn escalate(&mut self, result: Result<()>) -> Result<()> {
        if let Err(err) = result {
            self.fail(err);
        }
        self.ensure_healthy()
    }

    fn flush(&mut self, out: Outbox) -> Result<()> {
        let Outbox { frames, events } = out;
        for event in events {
            self.on_event(event)?;
        }
        if frames.is_empty() {
            return Ok(());
        }
        let dispatch = self.pipeline.write(frames.into_iter().map(Outbound::Frame));
        self.complete(dispatch)
    }

    fn on_event(&mut self, event: EngineEvent) -> Result<()> {
        match &event {
            EngineEvent::RemoteOpen => {
                self.timers.cancel_open();
                self.encoder.set_max_frame_size(self.connection.max_frame_size());
                self.pipeline.configure(TransportLimits {
                    max_inbound_frame_size: self.config.max_frame_size,
                    max_outbound_frame_size: self.connection.max_frame_size(),
                });
            }
            EngineEvent::ConnectionClosed => {
                self.timers.clear();
                Metrics::record_connection_close();
            }
            EngineEvent::Drained(link) | EngineEvent::LinkDetached(link) => {
                self.timers.cancel_drain(*link);
            }
            _ => {}
        }
        trace!(?event, "event");
        self.events.push_back(event);
        Ok(())
    }

    /// Emit output, apply reads that reached the engine, then report the
    /// pipeline's own failure.
    fn complete(&mut self, dispatch: Dispatch) -> Result<()> {
        let Dispatch {
            reads,
            output,
            error,
        } = dispatch;
        self.emit(output)?;
        for item in reads {
            self.apply(item)?;
        }
        error.map_or(Ok(()), Err)
    }

    fn emit(&mut self, output: Vec<Bytes>) -> Result<()> {
        if output.is_empty() {
            return Ok(());
        }
        self.timers.on_write();
        match self.sink.as_mut() {
            Some(sink) => {
                for bytes in output {
                    sink.write(bytes)?;
                }
                Ok(())
            }
            None => {
                self.output.extend(output);
                Ok(())
            }
        }
    }

    fn apply(&mut self, item: Inbound) -> Result<()> {
        self.timers.on_read();
        match item {
            Inbound::Header(header) => {
                self.connection.on_header(header)?;
                if self.config.role == EngineRole::Server && !self.connection.header_sent() {
                    self.write_header()?;
                }
                Ok(())
            }
            Inbound::Frame(frame) => {
                let mut out = Outbox::default();
                self.connection.on_frame(frame, &mut out)?;
                self.flush(out)
            }
            Inbound::SaslOutcome(code) => self.on_event(EngineEvent::SaslOutcome(code)),
            Inbound::Heartbeat | Inbound::Bytes(_) => Ok(()),
        }
    }

    /// Fail the engine: best-effort close, every endpoint to Failed, one event.
    fn fail(&mut self, err: Error) {
        if self.failure.is_some() {
            return;
        }
        let err = match err {
            Error::EngineFailed(inner) => *inner,
            other => other,
        };
        warn!(error = %err, condition = err.condition(), "engine failed");
        if self.connection.open_pending_close() && !matches!(err, Error::Transport(_)) {
            let close = Frame::amqp(0, Close {
                error: Some(ErrorCondition::from(&err)),
            });
            let dispatch = self.pipeline.write([Outbound::Frame(close)]);
            if let Err(write_err) = self.emit(dispatch.output) {
                debug!(error = %write_err, "best-effort close not written");
            }
        }
        self.connection.fail();
        self.timers.clear();
        Metrics::record_failure();
        Metrics::record_connection_close();
        self.events.push_back(EngineEvent::Failed(err.clone()));
        self.failure = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Open, conditions};

    fn started(role: EngineRole) -> Engine {
        let config = EngineConfig {
            role,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config).unwrap();
        engine.start().unwrap();
        engine
    }

    #[test]
    fn client_writes_header_on_start() {
        let mut engine = started(EngineRole::Client);
        assert_eq!(&engine.take_output()[..], &ProtocolHeader::Amqp.to_bytes());
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn server_answers_header() {
        let mut engine = started(EngineRole::Server);
        assert!(engine.take_output().is_empty());
        engine
            .ingest(Bytes::copy_from_slice(&ProtocolHeader::Amqp.to_bytes()))
            .unwrap();
        assert_eq!(&engine.take_output()[..], &ProtocolHeader::Amqp.to_bytes());
    }

    #[test]
    fn operations_need_start() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(matches!(engine.open(), Err(Error::Usage(_))));
        assert!(!engine.is_failed());
    }

    #[test]
    fn usage_errors_leave_engine_running() {
        let mut engine = started(EngineRole::Client);
        let err = engine.begin(SessionId(4)).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert!(!engine.is_failed());
        engine.open().unwrap();
    }

    #[test]
    fn garbage_fails_once_and_stays_failed() {
        let mut engine = started(EngineRole::Server);
        let err = engine.ingest(Bytes::from_static(b"HTTP/1.1")).unwrap_err();
        assert!(matches!(err, Error::EngineFailed(_)));
        assert!(matches!(engine.poll_event(), Some(EngineEvent::Failed(Error::InvalidHeader(_)))));
        assert_eq!(engine.poll_event(), None);
        assert!(engine.ingest(Bytes::from_static(b"AMQP")).is_err());
        assert_eq!(engine.poll_event(), None);
    }

    #[test]
    fn failure_after_open_writes_close() {
        let mut engine = started(EngineRole::Client);
        engine.open().unwrap();
        engine.take_output();
        engine.transport_failed("reset");
        assert!(engine.take_output().is_empty());

        let mut engine = started(EngineRole::Client);
        engine.open().unwrap();
        engine.take_output();
        let oversized = Frame::amqp(0, Open::default());
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&ProtocolHeader::Amqp.to_bytes());
        FrameEncoder::default().encode(&oversized, &mut wire).unwrap();
        wire.extend_from_slice(&[0, 0, 0, 7]);
        let _ = engine.ingest(wire.freeze());
        let failure = engine.failure().unwrap();
        assert_eq!(failure.condition(), conditions::FRAMING_ERROR);
        assert!(!engine.take_output().is_empty());
    }

    #[test]
    fn open_timeout_fires() {
        let mut engine = started(EngineRole::Client);
        let start = Instant::now();
        engine.tick(start).unwrap();
        engine.open().unwrap();
        let deadline = engine.next_deadline().unwrap();
        assert!(deadline <= start + std::time::Duration::from_secs(30));
        let err = engine.tick(start + std::time::Duration::from_secs(31)).unwrap_err();
        assert!(matches!(err, Error::EngineFailed(inner) if matches!(*inner, Error::Timeout("open"))));
    }

    #[test]
    fn output_sink_receives_pending_bytes() {
        let mut engine = started(EngineRole::Client);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = std::sync::Arc::clone(&seen);
        engine
            .set_output_sink(Box::new(move |bytes: Bytes| -> Result<()> {
                sink_seen.lock().unwrap().push(bytes);
                Ok(())
            }))
            .unwrap();
        engine.open().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert!(engine.take_output().is_empty());
    }

    #[test]
    fn sasl_layer_matches_role() {
        let engine = Engine::new(EngineConfig::server()).unwrap();
        let err = engine
            .with_sasl_client(vec![Box::new(crate::sasl::Anonymous::default())])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
