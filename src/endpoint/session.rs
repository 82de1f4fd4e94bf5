//! Session endpoint: begin/end lifecycle, transfer windows and link routing.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

use super::delivery::{Delivery, IncomingDelivery};
use super::flow::SessionWindow;
use super::link::{Link, LinkState, TransferOutcome};
use super::{LinkId, Outbox, SessionId};
use crate::engine::{EngineEvent, LinkOptions, SessionOptions};
use crate::error::{Error, Result, UsageError};
use crate::frame::{Frame, FrameBody, FrameEncoder};
use crate::metrics::Metrics;
use crate::types::{
    Attach, Begin, DeliveryState, Detach, Disposition, End, ErrorCondition, Flow, Performative,
    Role, SequenceNumber, Source, TargetKind, Transfer, conditions,
};

/// Longest delivery tag a sender may use.
const MAX_DELIVERY_TAG: usize = 32;

/// Session lifecycle as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing exchanged.
    Idle,
    /// Our begin went out.
    BeginSent,
    /// Peer began; ours is pending.
    BeginReceived,
    /// Both begins exchanged.
    Mapped,
    /// Our end went out.
    EndSent,
    /// Peer ended; ours is pending.
    EndReceived,
    /// Both ends exchanged.
    Ended,
    /// Torn down by an engine failure.
    Failed,
}

impl SessionState {
    /// State name for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BeginSent => "begin-sent",
            Self::BeginReceived => "begin-received",
            Self::Mapped => "mapped",
            Self::EndSent => "end-sent",
            Self::EndReceived => "end-received",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

/// A bidirectional conversation on one channel pair.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    options: SessionOptions,
    link_defaults: LinkOptions,
    remote_channel: Option<u16>,
    remote_begin: Option<Begin>,
    remote_error: Option<ErrorCondition>,
    window: SessionWindow,
    remote_handle_max: u32,
    links: BTreeMap<u32, Link>,
    remote_handles: HashMap<u32, u32>,
    next_delivery_id: SequenceNumber,
    pending: VecDeque<Frame>,
}

impl Session {
    pub(crate) fn new(id: SessionId, options: SessionOptions, link_defaults: LinkOptions) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            window: SessionWindow::new(options.incoming_window, options.outgoing_window),
            options,
            link_defaults,
            remote_channel: None,
            remote_begin: None,
            remote_error: None,
            remote_handle_max: u32::MAX,
            links: BTreeMap::new(),
            remote_handles: HashMap::new(),
            next_delivery_id: SequenceNumber(0),
            pending: VecDeque::new(),
        }
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Peer's channel, once its begin arrived.
    #[must_use]
    pub const fn remote_channel(&self) -> Option<u16> {
        self.remote_channel
    }

    /// Peer's begin.
    #[must_use]
    pub const fn remote_begin(&self) -> Option<&Begin> {
        self.remote_begin.as_ref()
    }

    /// Error from the peer's end.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&ErrorCondition> {
        self.remote_error.as_ref()
    }

    /// Transfer windows.
    #[must_use]
    pub const fn window(&self) -> &SessionWindow {
        &self.window
    }

    /// Link by local handle.
    #[must_use]
    pub fn link(&self, handle: u32) -> Option<&Link> {
        self.links.get(&handle)
    }

    /// Links in handle order.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Frames held back until the peer's incoming window reopens.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    fn channel(&self) -> u16 {
        self.id.channel()
    }

    fn invalid(&self, operation: &'static str) -> UsageError {
        UsageError::InvalidState {
            entity: "session",
            operation,
            state: self.state.as_str(),
        }
    }

    fn require_open(&self, operation: &'static str) -> std::result::Result<(), UsageError> {
        if matches!(self.state, SessionState::BeginSent | SessionState::Mapped) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn link_mut(&mut self, handle: u32) -> std::result::Result<&mut Link, UsageError> {
        let channel = self.channel();
        self.links
            .get_mut(&handle)
            .ok_or(UsageError::UnknownLink { channel, handle })
    }

    fn local_handle(&self, remote: u32) -> Result<u32> {
        self.remote_handles.get(&remote).copied().ok_or_else(|| {
            Error::protocol(
                conditions::UNATTACHED_HANDLE,
                format!("handle {remote} is not attached"),
            )
        })
    }

    fn allocate_handle(&self) -> std::result::Result<u32, UsageError> {
        let max = self.remote_handle_max;
        (0..=max)
            .find(|handle| !self.links.contains_key(handle))
            .ok_or(UsageError::HandlesExhausted(max))
    }

    /// Whether frames from the peer are still meaningful.
    pub(crate) const fn accepts_link_frames(&self) -> bool {
        matches!(self.state, SessionState::Mapped | SessionState::BeginReceived)
    }

    pub(crate) fn begin_frame(&mut self) -> std::result::Result<Begin, UsageError> {
        self.state = match self.state {
            SessionState::Idle => SessionState::BeginSent,
            SessionState::BeginReceived => SessionState::Mapped,
            _ => return Err(self.invalid("begin")),
        };
        debug!(session = %self.id, state = self.state.as_str(), "session begin");
        let handle_max = self.options.handle_max;
        Ok(Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.window.next_outgoing_id(),
            incoming_window: self.window.incoming_window(),
            outgoing_window: self.window.outgoing_window(),
            handle_max: (handle_max != u32::MAX).then_some(handle_max),
            ..Begin::default()
        })
    }

    pub(crate) fn on_begin(&mut self, remote_channel: u16, begin: Begin) -> Result<()> {
        self.state = match self.state {
            SessionState::Idle => SessionState::BeginReceived,
            SessionState::BeginSent => SessionState::Mapped,
            other => {
                return Err(Error::protocol(
                    conditions::ILLEGAL_STATE,
                    format!("begin for session {} in state {}", self.id, other.as_str()),
                ));
            }
        };
        self.remote_channel = Some(remote_channel);
        self.window.remote_begin(&begin);
        self.remote_handle_max = begin.handle_max();
        self.remote_begin = Some(begin);
        debug!(session = %self.id, remote_channel, state = self.state.as_str(), "remote begin");
        Ok(())
    }

    /// Returns whether both ends have now been exchanged.
    pub(crate) fn end_frame(
        &mut self,
        error: Option<ErrorCondition>,
    ) -> std::result::Result<(End, bool), UsageError> {
        self.state = match self.state {
            SessionState::BeginSent | SessionState::BeginReceived | SessionState::Mapped => {
                SessionState::EndSent
            }
            SessionState::EndReceived => SessionState::Ended,
            _ => return Err(self.invalid("end")),
        };
        debug!(session = %self.id, state = self.state.as_str(), "session end");
        Ok((End { error }, self.state == SessionState::Ended))
    }

    /// Returns whether both ends have now been exchanged.
    pub(crate) fn on_end(&mut self, end: &End) -> Result<bool> {
        self.state = match self.state {
            SessionState::BeginSent | SessionState::Mapped | SessionState::BeginReceived => {
                SessionState::EndReceived
            }
            SessionState::EndSent => SessionState::Ended,
            other => {
                return Err(Error::protocol(
                    conditions::ILLEGAL_STATE,
                    format!("end for session {} in state {}", self.id, other.as_str()),
                ));
            }
        };
        self.remote_error.clone_from(&end.error);
        self.remote_handles.clear();
        debug!(session = %self.id, state = self.state.as_str(), "remote end");
        Ok(self.state == SessionState::Ended)
    }

    pub(crate) fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.pending.clear();
        for link in self.links.values_mut() {
            link.fail();
        }
    }

    pub(crate) fn new_link(
        &mut self,
        name: String,
        role: Role,
        source: Option<Source>,
        target: Option<TargetKind>,
        options: Option<LinkOptions>,
    ) -> std::result::Result<LinkId, UsageError> {
        if matches!(
            self.state,
            SessionState::EndSent | SessionState::EndReceived | SessionState::Ended | SessionState::Failed
        ) {
            return Err(self.invalid("create link"));
        }
        if self.links.values().any(|link| link.name() == name && link.role() == role) {
            return Err(UsageError::DuplicateLinkName(name));
        }
        let handle = self.allocate_handle()?;
        let id = LinkId::new(self.id, handle);
        let options = options.unwrap_or_else(|| self.link_defaults.clone());
        self.links
            .insert(handle, Link::new(id, name, role, source, target, options));
        Ok(id)
    }

    /// Session and link fields of a flow for `handle`.
    fn link_flow(&self, handle: u32) -> Flow {
        let mut flow = self.window.flow();
        if let Some(link) = self.links.get(&handle) {
            link.credit().fill_flow(&mut flow, handle);
        }
        flow
    }

    /// Send a frame after any transfers still held back.
    fn emit_ordered(&mut self, frame: Frame, out: &mut Outbox) {
        if self.pending.is_empty() {
            out.push(frame);
        } else {
            self.pending.push_back(frame);
        }
    }

    fn queue_transfer(&mut self, frame: Frame, out: &mut Outbox) {
        if self.pending.is_empty() && self.window.can_send() {
            self.window.record_outgoing();
            out.push(frame);
        } else {
            trace!(session = %self.id, queued = self.pending.len() + 1, "peer window closed, holding transfer");
            self.pending.push_back(frame);
        }
    }

    fn flush_pending(&mut self, out: &mut Outbox) {
        while let Some(front) = self.pending.front() {
            let is_transfer = matches!(front.body, FrameBody::Amqp(Performative::Transfer(_)));
            if is_transfer {
                if !self.window.can_send() {
                    break;
                }
                self.window.record_outgoing();
            }
            if let Some(frame) = self.pending.pop_front() {
                out.push(frame);
            }
        }
    }

    fn remove_link(&mut self, handle: u32, out: &mut Outbox) {
        if let Some(link) = self.links.remove(&handle) {
            out.event(EngineEvent::LinkDetached(link.id()));
        }
    }

    pub(crate) fn attach(&mut self, handle: u32, out: &mut Outbox) -> Result<()> {
        self.require_open("attach")?;
        let channel = self.channel();
        let link = self.link_mut(handle)?;
        let attach = link.attach_frame()?;
        let grant = link.role() == Role::Receiver && link.credit().credit() > 0;
        self.emit_ordered(Frame::amqp(channel, attach), out);
        if grant {
            let flow = self.link_flow(handle);
            out.frame(channel, flow);
        }
        Ok(())
    }

    pub(crate) fn detach(
        &mut self,
        handle: u32,
        closed: bool,
        error: Option<ErrorCondition>,
        out: &mut Outbox,
    ) -> Result<()> {
        let channel = self.channel();
        let (detach, done) = self.link_mut(handle)?.detach_frame(closed, error)?;
        self.emit_ordered(Frame::amqp(channel, detach), out);
        if done {
            self.remove_link(handle, out);
        }
        Ok(())
    }

    pub(crate) fn on_attach(&mut self, attach: Attach, out: &mut Outbox) -> Result<()> {
        let remote = attach.handle;
        if self.remote_handles.contains_key(&remote) {
            return Err(Error::protocol(
                conditions::HANDLE_IN_USE,
                format!("handle {remote} is already attached"),
            ));
        }
        if remote > self.options.handle_max {
            return Err(Error::protocol(
                conditions::NOT_ALLOWED,
                format!("handle {remote} exceeds handle-max {}", self.options.handle_max),
            ));
        }
        let ours = attach.role.peer();
        let existing = self
            .links
            .values()
            .find(|link| {
                link.name() == attach.name && link.role() == ours && link.state() == LinkState::AttachSent
            })
            .map(|link| link.id().handle());
        let local = match existing {
            Some(handle) => handle,
            None => {
                let handle = self
                    .allocate_handle()
                    .map_err(|err| Error::protocol(conditions::RESOURCE_LIMIT_EXCEEDED, err.to_string()))?;
                let link = Link::remote_initiated(LinkId::new(self.id, handle), &attach, self.link_defaults.clone());
                self.links.insert(handle, link);
                handle
            }
        };
        let link = self.link_mut(local)?;
        link.on_attach(attach)?;
        let id = link.id();
        self.remote_handles.insert(remote, local);
        out.event(EngineEvent::RemoteAttach(id));
        Ok(())
    }

    pub(crate) fn on_detach(&mut self, detach: &Detach, out: &mut Outbox) -> Result<()> {
        let local = self.local_handle(detach.handle)?;
        self.remote_handles.remove(&detach.handle);
        let link = self.link_mut(local)?;
        let done = link.on_detach(detach)?;
        out.event(EngineEvent::RemoteDetach {
            link: link.id(),
            closed: detach.closed,
            error: detach.error.clone(),
        });
        if done {
            self.remove_link(local, out);
        }
        Ok(())
    }

    pub(crate) fn on_flow(&mut self, flow: &Flow, out: &mut Outbox) -> Result<()> {
        self.window.remote_flow(flow);
        let channel = self.channel();
        if let Some(remote) = flow.handle {
            let local = self.local_handle(remote)?;
            let link = self.link_mut(local)?;
            let id = link.id();
            let mut reply = flow.echo;
            match link.role() {
                Role::Sender => {
                    link.credit_mut().sender_flow(flow);
                    out.event(EngineEvent::LinkCredit(id));
                    if flow.drain {
                        if link.credit().credit() > 0 {
                            out.event(EngineEvent::DrainRequested(id));
                        } else {
                            reply = true;
                        }
                    }
                }
                Role::Receiver => {
                    if link.credit_mut().receiver_flow(flow) {
                        out.event(EngineEvent::Drained(id));
                    }
                }
            }
            if reply {
                let flow = self.link_flow(local);
                out.frame(channel, flow);
            }
        } else if flow.echo {
            out.frame(channel, self.window.flow());
        }
        self.flush_pending(out);
        Ok(())
    }

    pub(crate) fn on_transfer(&mut self, transfer: &Transfer, payload: Bytes, out: &mut Outbox) -> Result<()> {
        let refill = self.window.record_incoming()?;
        let local = self.local_handle(transfer.handle)?;
        let link = self.link_mut(local)?;
        let id = link.id();
        if link.state() == LinkState::DetachSent {
            trace!(link = %id, "dropping transfer on detaching link");
        } else {
            match link.on_transfer(transfer, payload)? {
                TransferOutcome::Partial => {}
                TransferOutcome::Complete(delivery_id) => {
                    Metrics::record_delivery_received();
                    out.event(EngineEvent::Delivery { link: id, delivery_id });
                }
                TransferOutcome::Aborted(delivery_id) => {
                    debug!(link = %id, %delivery_id, "delivery aborted by sender");
                    out.event(EngineEvent::DeliveryAborted { link: id, delivery_id });
                }
            }
            if link.credit_mut().finish_drain() {
                out.event(EngineEvent::Drained(id));
            }
        }
        if refill {
            self.window.replenish_incoming();
            out.frame(self.channel(), self.window.flow());
        }
        Ok(())
    }

    pub(crate) fn on_disposition(&mut self, disposition: &Disposition, out: &mut Outbox) {
        let ours = disposition.role.peer();
        let last = disposition.last();
        for link in self.links.values_mut().filter(|link| link.role() == ours) {
            let id = link.id();
            let updates = link.on_disposition(
                disposition.first,
                last,
                disposition.settled,
                disposition.state.as_ref(),
            );
            for (delivery_id, state, settled) in updates {
                out.event(EngineEvent::DeliveryUpdated {
                    link: id,
                    delivery_id,
                    state,
                    settled,
                });
            }
        }
    }

    /// Queue one delivery as one or more transfer frames.
    pub(crate) fn send(
        &mut self,
        handle: u32,
        tag: Bytes,
        mut payload: Bytes,
        settled: bool,
        encoder: &FrameEncoder,
        out: &mut Outbox,
    ) -> Result<SequenceNumber> {
        self.require_open("send")?;
        if tag.len() > MAX_DELIVERY_TAG {
            return Err(UsageError::DeliveryTagTooLong(tag.len()).into());
        }
        let channel = self.channel();
        let delivery_id = self.next_delivery_id;
        let link = self.link_mut(handle)?;
        link.require_role(Role::Sender)?;
        link.require_attached("send")?;
        let settled = link.settlement(settled)?;

        let first = Transfer {
            handle,
            delivery_id: Some(delivery_id),
            delivery_tag: Some(tag.clone()),
            message_format: Some(0),
            settled: Some(settled),
            more: true,
            ..Transfer::default()
        };
        let next = Transfer {
            handle,
            more: true,
            ..Transfer::default()
        };
        let first_capacity = encoder
            .payload_capacity(&Performative::Transfer(first.clone()))?
            .max(1);
        let next_capacity = encoder
            .payload_capacity(&Performative::Transfer(next.clone()))?
            .max(1);

        link.credit_mut().consume()?;
        if !settled {
            link.track(Delivery::new(delivery_id, tag));
        }
        self.next_delivery_id = delivery_id.next();

        let mut transfer = first;
        let mut capacity = first_capacity;
        let mut frames = 0usize;
        loop {
            let chunk = payload.split_to(capacity.min(payload.len()));
            transfer.more = !payload.is_empty();
            self.queue_transfer(Frame::with_payload(channel, transfer, chunk), out);
            frames += 1;
            if payload.is_empty() {
                break;
            }
            transfer = next.clone();
            capacity = next_capacity;
        }
        Metrics::record_delivery_sent();
        trace!(session = %self.id, handle, %delivery_id, frames, settled, "delivery queued");
        Ok(delivery_id)
    }

    pub(crate) fn take_delivery(&mut self, handle: u32, out: &mut Outbox) -> Result<Option<IncomingDelivery>> {
        let channel = self.channel();
        let link = self.link_mut(handle)?;
        link.require_role(Role::Receiver)?;
        let delivery = link.take_delivery();
        if let Some(credit) = link.replenish() {
            link.credit_mut().grant(credit);
            trace!(link = %link.id(), credit, "credit replenished");
            let flow = self.link_flow(handle);
            out.frame(channel, flow);
        }
        Ok(delivery)
    }

    pub(crate) fn grant_credit(&mut self, handle: u32, credit: u32, out: &mut Outbox) -> Result<()> {
        let channel = self.channel();
        let link = self.link_mut(handle)?;
        link.require_role(Role::Receiver)?;
        let window = link.options().credit_window;
        if window > 0 {
            return Err(UsageError::CreditWindowConfigured(window).into());
        }
        let total = link.credit().credit().saturating_add(credit);
        link.credit_mut().grant(total);
        if link.can_flow() {
            let flow = self.link_flow(handle);
            out.frame(channel, flow);
        }
        Ok(())
    }

    pub(crate) fn drain(&mut self, handle: u32, out: &mut Outbox) -> Result<()> {
        let channel = self.channel();
        let link = self.link_mut(handle)?;
        link.require_role(Role::Receiver)?;
        link.require_attached("drain")?;
        link.credit_mut().start_drain()?;
        let flow = self.link_flow(handle);
        out.frame(channel, flow);
        Ok(())
    }

    pub(crate) fn drained(&mut self, handle: u32, out: &mut Outbox) -> Result<()> {
        let channel = self.channel();
        let link = self.link_mut(handle)?;
        link.require_role(Role::Sender)?;
        link.require_attached("drained")?;
        link.credit_mut().drained();
        let id = link.id();
        let flow = self.link_flow(handle);
        out.frame(channel, flow);
        out.event(EngineEvent::LinkCredit(id));
        Ok(())
    }

    pub(crate) fn disposition(
        &mut self,
        handle: u32,
        delivery_id: SequenceNumber,
        state: Option<DeliveryState>,
        settled: bool,
        out: &mut Outbox,
    ) -> Result<()> {
        self.require_open("disposition")?;
        let channel = self.channel();
        let link = self.link_mut(handle)?;
        link.local_disposition(delivery_id, state.clone(), settled)?;
        let role = link.role();
        out.frame(
            channel,
            Disposition {
                role,
                first: delivery_id,
                last: None,
                settled,
                state,
                batchable: false,
            },
        );
        Ok(())
    }
}
