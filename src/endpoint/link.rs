//! Link endpoint: attach/detach lifecycle, credit and deliveries.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::debug;

use super::LinkId;
use super::delivery::{Delivery, IncomingDelivery, PartialDelivery};
use super::flow::LinkCredit;
use crate::engine::LinkOptions;
use crate::error::{Error, Result, UsageError};
use crate::types::{
    Attach, DeliveryState, Detach, ErrorCondition, Role, SenderSettleMode, SequenceNumber,
    Source, TargetKind, Transfer, conditions,
};

/// Link lifecycle as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created locally, nothing exchanged.
    Idle,
    /// Our attach went out.
    AttachSent,
    /// Peer attached; ours is pending.
    AttachReceived,
    /// Both attaches exchanged.
    Attached,
    /// Our detach went out.
    DetachSent,
    /// Peer detached; ours is pending.
    DetachReceived,
    /// Both detaches exchanged.
    Detached,
    /// Torn down by an engine failure.
    Failed,
}

impl LinkState {
    /// State name for logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AttachSent => "attach-sent",
            Self::AttachReceived => "attach-received",
            Self::Attached => "attached",
            Self::DetachSent => "detach-sent",
            Self::DetachReceived => "detach-received",
            Self::Detached => "detached",
            Self::Failed => "failed",
        }
    }
}

/// Result of feeding one transfer frame to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    /// More frames follow.
    Partial,
    /// The delivery is complete and queued.
    Complete(SequenceNumber),
    /// The sender aborted the delivery.
    Aborted(SequenceNumber),
}

/// One end of a unidirectional message route.
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    name: String,
    role: Role,
    state: LinkState,
    options: LinkOptions,
    source: Option<Source>,
    target: Option<TargetKind>,
    remote_handle: Option<u32>,
    remote_attach: Option<Box<Attach>>,
    remote_error: Option<ErrorCondition>,
    credit: LinkCredit,
    unsettled: HashMap<u32, Delivery>,
    partial: Option<PartialDelivery>,
    ready: VecDeque<IncomingDelivery>,
}

impl Link {
    pub(crate) fn new(
        id: LinkId,
        name: String,
        role: Role,
        source: Option<Source>,
        target: Option<TargetKind>,
        options: LinkOptions,
    ) -> Self {
        Self {
            id,
            name,
            role,
            state: LinkState::Idle,
            options,
            source,
            target,
            remote_handle: None,
            remote_attach: None,
            remote_error: None,
            credit: LinkCredit::default(),
            unsettled: HashMap::new(),
            partial: None,
            ready: VecDeque::new(),
        }
    }

    /// Local end of a link the peer attached first; termini mirror the peer's.
    pub(crate) fn remote_initiated(id: LinkId, attach: &Attach, mut options: LinkOptions) -> Self {
        options.snd_settle_mode = attach.snd_settle_mode;
        options.rcv_settle_mode = attach.rcv_settle_mode;
        Self::new(
            id,
            attach.name.clone(),
            attach.role.peer(),
            attach.source.clone(),
            attach.target.clone(),
            options,
        )
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> LinkId {
        self.id
    }

    /// Link name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Options the link was created with.
    #[must_use]
    pub const fn options(&self) -> &LinkOptions {
        &self.options
    }

    /// Source terminus we attach with.
    #[must_use]
    pub const fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    /// Target terminus we attach with.
    #[must_use]
    pub const fn target(&self) -> Option<&TargetKind> {
        self.target.as_ref()
    }

    /// Peer's attach, once received.
    #[must_use]
    pub fn remote_attach(&self) -> Option<&Attach> {
        self.remote_attach.as_deref()
    }

    /// Error from the peer's detach.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&ErrorCondition> {
        self.remote_error.as_ref()
    }

    /// Handle the peer uses for this link.
    #[must_use]
    pub const fn remote_handle(&self) -> Option<u32> {
        self.remote_handle
    }

    /// Credit and delivery-count.
    #[must_use]
    pub const fn credit(&self) -> &LinkCredit {
        &self.credit
    }

    /// Unsettled delivery by id.
    #[must_use]
    pub fn unsettled(&self, delivery_id: SequenceNumber) -> Option<&Delivery> {
        self.unsettled.get(&delivery_id.get())
    }

    /// Number of unsettled deliveries.
    #[must_use]
    pub fn unsettled_count(&self) -> usize {
        self.unsettled.len()
    }

    /// Complete deliveries not yet taken by the application.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn credit_mut(&mut self) -> &mut LinkCredit {
        &mut self.credit
    }

    fn invalid(&self, operation: &'static str) -> UsageError {
        UsageError::InvalidState {
            entity: "link",
            operation,
            state: self.state.as_str(),
        }
    }

    pub(crate) fn require_attached(&self, operation: &'static str) -> std::result::Result<(), UsageError> {
        if matches!(self.state, LinkState::Attached) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    pub(crate) fn require_role(&self, role: Role) -> std::result::Result<(), UsageError> {
        match (self.role, role) {
            (Role::Sender, Role::Sender) | (Role::Receiver, Role::Receiver) => Ok(()),
            (_, Role::Sender) => Err(UsageError::NotSender),
            (_, Role::Receiver) => Err(UsageError::NotReceiver),
        }
    }

    /// Whether our attach is out and the link is not yet detaching.
    pub(crate) const fn can_flow(&self) -> bool {
        matches!(self.state, LinkState::AttachSent | LinkState::Attached)
    }

    pub(crate) fn attach_frame(&mut self) -> std::result::Result<Attach, UsageError> {
        self.state = match self.state {
            LinkState::Idle => LinkState::AttachSent,
            LinkState::AttachReceived => LinkState::Attached,
            _ => return Err(self.invalid("attach")),
        };
        if self.role == Role::Receiver && self.options.credit_window > 0 {
            self.credit.grant(self.options.credit_window);
        }
        debug!(link = %self.id, name = %self.name, state = self.state.as_str(), "link attach");
        Ok(Attach {
            snd_settle_mode: self.options.snd_settle_mode,
            rcv_settle_mode: self.options.rcv_settle_mode,
            source: self.source.clone(),
            target: self.target.clone(),
            initial_delivery_count: (self.role == Role::Sender).then(|| self.credit.delivery_count()),
            max_message_size: self.options.max_message_size,
            ..Attach::new(self.name.clone(), self.id.handle(), self.role)
        })
    }

    pub(crate) fn on_attach(&mut self, attach: Attach) -> Result<()> {
        self.state = match self.state {
            LinkState::Idle => LinkState::AttachReceived,
            LinkState::AttachSent => LinkState::Attached,
            other => {
                return Err(Error::protocol(
                    conditions::ILLEGAL_STATE,
                    format!("attach for link {} in state {}", self.name, other.as_str()),
                ));
            }
        };
        if self.role == Role::Receiver {
            let initial = attach.initial_delivery_count.ok_or_else(|| {
                Error::protocol(
                    conditions::INVALID_FIELD,
                    "sender attach lacks initial-delivery-count",
                )
            })?;
            self.credit.set_initial(initial);
        }
        self.remote_handle = Some(attach.handle);
        self.remote_attach = Some(Box::new(attach));
        debug!(link = %self.id, name = %self.name, state = self.state.as_str(), "remote attach");
        Ok(())
    }

    /// Returns whether both detaches have now been exchanged.
    pub(crate) fn detach_frame(
        &mut self,
        closed: bool,
        error: Option<ErrorCondition>,
    ) -> std::result::Result<(Detach, bool), UsageError> {
        self.state = match self.state {
            LinkState::AttachSent | LinkState::AttachReceived | LinkState::Attached => {
                LinkState::DetachSent
            }
            LinkState::DetachReceived => LinkState::Detached,
            _ => return Err(self.invalid("detach")),
        };
        debug!(link = %self.id, closed, state = self.state.as_str(), "link detach");
        let detach = Detach {
            handle: self.id.handle(),
            closed,
            error,
        };
        Ok((detach, self.state == LinkState::Detached))
    }

    /// Returns whether both detaches have now been exchanged.
    pub(crate) fn on_detach(&mut self, detach: &Detach) -> Result<bool> {
        self.state = match self.state {
            LinkState::AttachReceived | LinkState::Attached => LinkState::DetachReceived,
            LinkState::DetachSent => LinkState::Detached,
            other => {
                return Err(Error::protocol(
                    conditions::ILLEGAL_STATE,
                    format!("detach for link {} in state {}", self.name, other.as_str()),
                ));
            }
        };
        self.remote_handle = None;
        self.remote_error.clone_from(&detach.error);
        self.partial = None;
        debug!(link = %self.id, closed = detach.closed, state = self.state.as_str(), "remote detach");
        Ok(self.state == LinkState::Detached)
    }

    pub(crate) fn fail(&mut self) {
        self.state = LinkState::Failed;
        self.partial = None;
    }

    /// Settlement of the next delivery under the link's sender settle mode.
    pub(crate) fn settlement(&self, settled: bool) -> std::result::Result<bool, UsageError> {
        match self.options.snd_settle_mode {
            SenderSettleMode::Settled => Ok(true),
            SenderSettleMode::Unsettled if settled => Err(UsageError::SettledSendNotAllowed),
            SenderSettleMode::Unsettled | SenderSettleMode::Mixed => Ok(settled),
        }
    }

    pub(crate) fn track(&mut self, delivery: Delivery) {
        self.unsettled.insert(delivery.id().get(), delivery);
    }

    /// Feed an inbound transfer to a receiver.
    pub(crate) fn on_transfer(&mut self, transfer: &Transfer, payload: Bytes) -> Result<TransferOutcome> {
        if self.role != Role::Receiver {
            return Err(Error::protocol(
                conditions::ILLEGAL_STATE,
                format!("transfer received on sending link {}", self.name),
            ));
        }
        let partial = match self.partial.take() {
            Some(mut partial) => {
                partial.append(transfer, &payload)?;
                partial
            }
            None => {
                self.credit.receive()?;
                PartialDelivery::start(transfer, payload, self.options.max_message_size)?
            }
        };
        if transfer.aborted {
            return Ok(TransferOutcome::Aborted(partial.delivery_id()));
        }
        if transfer.more {
            self.partial = Some(partial);
            return Ok(TransferOutcome::Partial);
        }
        let id = partial.delivery_id();
        let delivery = partial.complete()?;
        if !delivery.settled {
            let mut tracked = Delivery::new(id, delivery.tag.clone());
            tracked.update_remote(delivery.state.clone(), false);
            self.track(tracked);
        }
        self.ready.push_back(delivery);
        Ok(TransferOutcome::Complete(id))
    }

    pub(crate) fn take_delivery(&mut self) -> Option<IncomingDelivery> {
        self.ready.pop_front()
    }

    /// Credit to grant if the configured window should be refilled.
    pub(crate) fn replenish(&self) -> Option<u32> {
        if self.role != Role::Receiver || !self.can_flow() {
            return None;
        }
        let buffered = u32::try_from(self.ready.len()).unwrap_or(u32::MAX);
        self.options
            .replenish
            .replenish(self.options.credit_window, self.credit.credit(), buffered)
    }

    /// Apply a peer disposition; returns the deliveries it touched.
    pub(crate) fn on_disposition(
        &mut self,
        first: SequenceNumber,
        last: SequenceNumber,
        settled: bool,
        state: Option<&DeliveryState>,
    ) -> Vec<(SequenceNumber, Option<DeliveryState>, bool)> {
        let mut touched: Vec<u32> = self
            .unsettled
            .keys()
            .copied()
            .filter(|id| SequenceNumber(*id).within(first, last))
            .collect();
        touched.sort_by_key(|id| SequenceNumber(*id).distance_from(first));
        let mut updates = Vec::with_capacity(touched.len());
        for id in touched {
            if let Some(delivery) = self.unsettled.get_mut(&id) {
                delivery.update_remote(state.cloned(), settled);
                updates.push((SequenceNumber(id), state.cloned(), settled));
            }
            if settled {
                self.unsettled.remove(&id);
            }
        }
        updates
    }

    /// Record a local state change; settled deliveries are released.
    pub(crate) fn local_disposition(
        &mut self,
        delivery_id: SequenceNumber,
        state: Option<DeliveryState>,
        settled: bool,
    ) -> std::result::Result<(), UsageError> {
        let delivery = self
            .unsettled
            .get_mut(&delivery_id.get())
            .ok_or(UsageError::UnknownDelivery(delivery_id.get()))?;
        delivery.update_local(state, settled);
        if settled {
            self.unsettled.remove(&delivery_id.get());
        }
        Ok(())
    }
}
