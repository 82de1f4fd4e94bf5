//! Deadlines driven by [`super::Engine::tick`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::endpoint::LinkId;

/// A deadline armed before the engine has seen a clock reading is anchored
/// on the first tick.
#[derive(Debug, Clone, Copy)]
enum Deadline {
    Pending(Duration),
    At(Instant),
}

impl Deadline {
    fn arm(timeout: Duration, now: Option<Instant>) -> Self {
        match now {
            Some(now) => Self::At(now + timeout),
            None => Self::Pending(timeout),
        }
    }

    fn anchor(&mut self, now: Instant) {
        if let Self::Pending(timeout) = *self {
            *self = Self::At(now + timeout);
        }
    }

    fn at(self) -> Option<Instant> {
        match self {
            Self::At(at) => Some(at),
            Self::Pending(_) => None,
        }
    }

    fn expired(self, now: Instant) -> bool {
        self.at().is_some_and(|at| at <= now)
    }
}

/// Timer that went off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expired {
    Open,
    Close,
    Drain(LinkId),
    Idle,
    Heartbeat,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    now: Option<Instant>,
    open: Option<Deadline>,
    close: Option<Deadline>,
    drains: BTreeMap<LinkId, Deadline>,
    last_read: Option<Instant>,
    last_write: Option<Instant>,
}

impl Timers {
    pub(crate) const fn now(&self) -> Option<Instant> {
        self.now
    }

    pub(crate) fn arm_open(&mut self, timeout: Option<Duration>) {
        self.open = timeout.map(|timeout| Deadline::arm(timeout, self.now));
    }

    pub(crate) fn cancel_open(&mut self) {
        self.open = None;
    }

    pub(crate) fn arm_close(&mut self, timeout: Option<Duration>) {
        self.close = timeout.map(|timeout| Deadline::arm(timeout, self.now));
    }

    pub(crate) fn cancel_close(&mut self) {
        self.close = None;
    }

    pub(crate) fn arm_drain(&mut self, link: LinkId, timeout: Option<Duration>) {
        if let Some(timeout) = timeout {
            self.drains.insert(link, Deadline::arm(timeout, self.now));
        }
    }

    pub(crate) fn cancel_drain(&mut self, link: LinkId) {
        self.drains.remove(&link);
    }

    pub(crate) fn clear(&mut self) {
        self.open = None;
        self.close = None;
        self.drains.clear();
    }

    pub(crate) fn on_read(&mut self) {
        self.last_read = self.now;
    }

    pub(crate) fn on_write(&mut self) {
        self.last_write = self.now;
    }

    /// Advance the clock and collect what went off.
    ///
    /// `local_idle` is the timeout we advertised; silence from the peer for
    /// that long expires the connection. `remote_idle` is the peer's; we
    /// send a heartbeat after half of it passes without output.
    pub(crate) fn advance(
        &mut self,
        now: Instant,
        local_idle: Option<Duration>,
        remote_idle: Option<Duration>,
    ) -> Vec<Expired> {
        self.now = Some(now);
        self.last_read.get_or_insert(now);
        self.last_write.get_or_insert(now);
        for deadline in self
            .open
            .iter_mut()
            .chain(self.close.iter_mut())
            .chain(self.drains.values_mut())
        {
            deadline.anchor(now);
        }

        let mut expired = Vec::new();
        if self.open.is_some_and(|deadline| deadline.expired(now)) {
            self.open = None;
            expired.push(Expired::Open);
        }
        if self.close.is_some_and(|deadline| deadline.expired(now)) {
            self.close = None;
            expired.push(Expired::Close);
        }
        let drained: Vec<LinkId> = self
            .drains
            .iter()
            .filter(|(_, deadline)| deadline.expired(now))
            .map(|(link, _)| *link)
            .collect();
        for link in drained {
            self.drains.remove(&link);
            expired.push(Expired::Drain(link));
        }
        if let (Some(idle), Some(last)) = (local_idle, self.last_read) {
            if now.saturating_duration_since(last) >= idle {
                expired.push(Expired::Idle);
            }
        }
        if let (Some(idle), Some(last)) = (remote_idle, self.last_write) {
            if now.saturating_duration_since(last) >= idle / 2 {
                expired.push(Expired::Heartbeat);
            }
        }
        expired
    }

    /// Earliest instant at which [`Self::advance`] has work to do.
    pub(crate) fn next_deadline(
        &self,
        local_idle: Option<Duration>,
        remote_idle: Option<Duration>,
    ) -> Option<Instant> {
        let idle = local_idle.zip(self.last_read).map(|(idle, last)| last + idle);
        let heartbeat = remote_idle
            .zip(self.last_write)
            .map(|(idle, last)| last + idle / 2);
        self.open
            .iter()
            .chain(self.close.iter())
            .chain(self.drains.values())
            .filter_map(|deadline| deadline.at())
            .chain(idle)
            .chain(heartbeat)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SessionId;

    #[test]
    fn pending_deadline_anchors_on_first_tick() {
        let mut timers = Timers::default();
        timers.arm_open(Some(Duration::from_secs(5)));
        let start = Instant::now();
        assert!(timers.advance(start, None, None).is_empty());
        assert!(timers.advance(start + Duration::from_secs(4), None, None).is_empty());
        assert_eq!(
            timers.advance(start + Duration::from_secs(5), None, None),
            vec![Expired::Open]
        );
        assert!(timers.advance(start + Duration::from_secs(9), None, None).is_empty());
    }

    #[test]
    fn cancel_stops_expiry() {
        let start = Instant::now();
        let mut timers = Timers::default();
        timers.advance(start, None, None);
        let link = LinkId::new(SessionId(0), 1);
        timers.arm_drain(link, Some(Duration::from_secs(1)));
        timers.cancel_drain(link);
        assert!(timers.advance(start + Duration::from_secs(2), None, None).is_empty());
    }

    #[test]
    fn heartbeat_at_half_remote_idle() {
        let start = Instant::now();
        let mut timers = Timers::default();
        let remote = Some(Duration::from_secs(10));
        timers.advance(start, None, remote);
        assert_eq!(
            timers.next_deadline(None, remote),
            Some(start + Duration::from_secs(5))
        );
        assert!(timers.advance(start + Duration::from_secs(4), None, remote).is_empty());
        timers.on_write();
        assert!(timers.advance(start + Duration::from_secs(8), None, remote).is_empty());
        assert_eq!(
            timers.advance(start + Duration::from_secs(9), None, remote),
            vec![Expired::Heartbeat]
        );
    }

    #[test]
    fn silence_expires_local_idle() {
        let start = Instant::now();
        let mut timers = Timers::default();
        let local = Some(Duration::from_secs(2));
        timers.advance(start, local, None);
        timers.advance(start + Duration::from_secs(1), local, None);
        timers.on_read();
        assert!(timers.advance(start + Duration::from_secs(2), local, None).is_empty());
        assert_eq!(
            timers.advance(start + Duration::from_secs(3), local, None),
            vec![Expired::Idle]
        );
    }
}
