//! Flow control: session transfer windows and link credit.
//!
//! A session counts transfer frames against the peer's incoming window and
//! its own. A link counts deliveries against credit. Sender credit is
//! derived from the receiver's last flow:
//!
//! ```text
//! credit = delivery_count(rcv) + link_credit(rcv) - delivery_count(snd)
//! ```
//!
//! with all arithmetic wrapping.

use crate::error::{Error, Result, UsageError};
use crate::types::{Begin, Flow, SequenceNumber, conditions};

/// Thresholds deciding when a receiver tops its credit back up.
///
/// Credit is raised to the full window once it has fallen to
/// `credit_low_percent` of the window and credit plus deliveries still
/// buffered at the application is at most `buffered_high_percent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplenishPolicy {
    /// Credit level, as a percentage of the window, at or below which a refill is considered.
    pub credit_low_percent: u8,
    /// Ceiling for credit plus buffered deliveries, as a percentage of the window.
    pub buffered_high_percent: u8,
}

impl Default for ReplenishPolicy {
    fn default() -> Self {
        Self {
            credit_low_percent: 50,
            buffered_high_percent: 70,
        }
    }
}

impl ReplenishPolicy {
    /// New credit to grant, if the window should be refilled.
    #[must_use]
    pub fn replenish(&self, window: u32, credit: u32, buffered: u32) -> Option<u32> {
        if window == 0 || credit >= window {
            return None;
        }
        let window_wide = u64::from(window);
        let low = window_wide * u64::from(self.credit_low_percent) / 100;
        let high = window_wide * u64::from(self.buffered_high_percent) / 100;
        let credit_wide = u64::from(credit);
        (credit_wide <= low && credit_wide + u64::from(buffered) <= high).then_some(window)
    }
}

/// Transfer-frame accounting for one session.
#[derive(Debug, Clone)]
pub struct SessionWindow {
    initial_outgoing_id: SequenceNumber,
    next_outgoing_id: SequenceNumber,
    outgoing_window: u32,
    incoming_window: u32,
    configured_incoming_window: u32,
    next_incoming_id: Option<SequenceNumber>,
    remote_incoming_window: u32,
    remote_outgoing_window: u32,
}

impl SessionWindow {
    /// Window starting at transfer id 0.
    #[must_use]
    pub const fn new(incoming_window: u32, outgoing_window: u32) -> Self {
        Self {
            initial_outgoing_id: SequenceNumber(0),
            next_outgoing_id: SequenceNumber(0),
            outgoing_window,
            incoming_window,
            configured_incoming_window: incoming_window,
            next_incoming_id: None,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
        }
    }

    /// Id of the next outgoing transfer frame.
    #[must_use]
    pub const fn next_outgoing_id(&self) -> SequenceNumber {
        self.next_outgoing_id
    }

    /// Id the peer's next transfer frame must carry, once its begin is known.
    #[must_use]
    pub const fn next_incoming_id(&self) -> Option<SequenceNumber> {
        self.next_incoming_id
    }

    /// Transfer frames we will still accept.
    #[must_use]
    pub const fn incoming_window(&self) -> u32 {
        self.incoming_window
    }

    /// Transfer frames we announce we may send.
    #[must_use]
    pub const fn outgoing_window(&self) -> u32 {
        self.outgoing_window
    }

    /// Transfer frames the peer will still accept.
    #[must_use]
    pub const fn remote_incoming_window(&self) -> u32 {
        self.remote_incoming_window
    }

    /// Transfer frames the peer announced it may send.
    #[must_use]
    pub const fn remote_outgoing_window(&self) -> u32 {
        self.remote_outgoing_window
    }

    /// Whether another transfer frame may go out now.
    #[must_use]
    pub const fn can_send(&self) -> bool {
        self.remote_incoming_window > 0
    }

    pub(crate) fn remote_begin(&mut self, begin: &Begin) {
        self.next_incoming_id = Some(begin.next_outgoing_id);
        self.remote_incoming_window = begin.incoming_window;
        self.remote_outgoing_window = begin.outgoing_window;
    }

    pub(crate) fn remote_flow(&mut self, flow: &Flow) {
        let expected = flow.next_incoming_id.unwrap_or(self.initial_outgoing_id);
        let limit = expected.add(flow.incoming_window);
        self.remote_incoming_window = if limit > self.next_outgoing_id {
            limit.distance_from(self.next_outgoing_id)
        } else {
            0
        };
        self.remote_outgoing_window = flow.outgoing_window;
    }

    pub(crate) fn record_outgoing(&mut self) {
        self.next_outgoing_id = self.next_outgoing_id.next();
        self.remote_incoming_window = self.remote_incoming_window.saturating_sub(1);
    }

    /// Account for one inbound transfer frame. Returns whether the local
    /// incoming window has fallen far enough to announce a refill.
    pub(crate) fn record_incoming(&mut self) -> Result<bool> {
        if self.incoming_window == 0 {
            return Err(Error::protocol(
                conditions::WINDOW_VIOLATION,
                "transfer received while the incoming window is zero",
            ));
        }
        self.incoming_window -= 1;
        self.next_incoming_id = self.next_incoming_id.map(SequenceNumber::next);
        self.remote_outgoing_window = self.remote_outgoing_window.saturating_sub(1);
        Ok(self.incoming_window <= self.configured_incoming_window / 2)
    }

    pub(crate) fn replenish_incoming(&mut self) {
        self.incoming_window = self.configured_incoming_window;
    }

    /// Session fields of a flow frame.
    pub(crate) fn flow(&self) -> Flow {
        Flow {
            next_incoming_id: self.next_incoming_id,
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            ..Flow::default()
        }
    }
}

/// Credit and delivery-count of one link.
#[derive(Debug, Clone, Default)]
pub struct LinkCredit {
    initial_delivery_count: SequenceNumber,
    delivery_count: SequenceNumber,
    credit: u32,
    drain: bool,
}

impl LinkCredit {
    /// Credit state starting at `delivery_count`.
    #[must_use]
    pub const fn new(delivery_count: SequenceNumber) -> Self {
        Self {
            initial_delivery_count: delivery_count,
            delivery_count,
            credit: 0,
            drain: false,
        }
    }

    /// Deliveries sent (or received) so far, wrapping.
    #[must_use]
    pub const fn delivery_count(&self) -> SequenceNumber {
        self.delivery_count
    }

    /// Deliveries that may still be sent.
    #[must_use]
    pub const fn credit(&self) -> u32 {
        self.credit
    }

    /// Whether a drain request is outstanding.
    #[must_use]
    pub const fn is_draining(&self) -> bool {
        self.drain
    }

    /// Receiver adopts the sender's initial delivery-count from its attach.
    pub(crate) fn set_initial(&mut self, delivery_count: SequenceNumber) {
        self.initial_delivery_count = delivery_count;
        self.delivery_count = delivery_count;
    }

    /// Sender side: recompute credit from the receiver's flow.
    pub(crate) fn sender_flow(&mut self, flow: &Flow) {
        let rcv_count = flow.delivery_count.unwrap_or(self.initial_delivery_count);
        let limit = rcv_count.add(flow.link_credit.unwrap_or(0));
        self.credit = if limit > self.delivery_count {
            limit.distance_from(self.delivery_count)
        } else {
            0
        };
        self.drain = flow.drain;
    }

    /// Sender side: one delivery leaves.
    pub(crate) fn consume(&mut self) -> std::result::Result<(), UsageError> {
        if self.credit == 0 {
            return Err(UsageError::NoCredit);
        }
        self.credit -= 1;
        self.delivery_count = self.delivery_count.next();
        Ok(())
    }

    /// Sender side: give up all remaining credit in response to a drain.
    pub(crate) fn drained(&mut self) {
        self.delivery_count = self.delivery_count.add(self.credit);
        self.credit = 0;
    }

    /// Receiver side: set the credit to advertise.
    pub(crate) fn grant(&mut self, credit: u32) {
        self.credit = credit;
    }

    /// Receiver side: ask the sender to use or return all credit.
    pub(crate) fn start_drain(&mut self) -> std::result::Result<(), UsageError> {
        if self.drain {
            return Err(UsageError::DrainPending);
        }
        self.drain = true;
        Ok(())
    }

    /// Receiver side: one delivery arrives.
    pub(crate) fn receive(&mut self) -> Result<()> {
        if self.credit == 0 {
            return Err(Error::protocol(
                conditions::TRANSFER_LIMIT_EXCEEDED,
                "transfer received on a link without credit",
            ));
        }
        self.credit -= 1;
        self.delivery_count = self.delivery_count.next();
        Ok(())
    }

    /// Receiver side: apply the sender's flow. Returns whether an
    /// outstanding drain has completed.
    pub(crate) fn receiver_flow(&mut self, flow: &Flow) -> bool {
        if let Some(count) = flow.delivery_count {
            if count > self.delivery_count {
                let advanced = count.distance_from(self.delivery_count);
                self.credit = self.credit.saturating_sub(advanced);
                self.delivery_count = count;
            }
        }
        if let Some(link_credit) = flow.link_credit {
            self.credit = self.credit.min(link_credit);
        }
        self.finish_drain()
    }

    /// Clear the drain flag once no credit remains.
    pub(crate) fn finish_drain(&mut self) -> bool {
        let done = self.drain && self.credit == 0;
        if done {
            self.drain = false;
        }
        done
    }

    /// Link fields of a flow frame.
    pub(crate) fn fill_flow(&self, flow: &mut Flow, handle: u32) {
        flow.handle = Some(handle);
        flow.delivery_count = Some(self.delivery_count);
        flow.link_credit = Some(self.credit);
        flow.drain = self.drain;
    }
}
