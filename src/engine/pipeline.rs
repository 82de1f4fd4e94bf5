//! Ordered handler chain between the transport and the endpoints.
//!
//! Index 0 sits nearest the transport. Reads enter at index 0 and travel
//! toward the engine; writes enter at the tail and travel toward the
//! transport, leaving as encoded bytes. A handler forwards, transforms,
//! swallows or injects items through its [`HandlerContext`]. Dispatch runs
//! off a FIFO worklist so handlers never re-enter each other.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::error::{Error, Result};
use crate::frame::{Frame, ProtocolHeader};
use crate::types::SaslCode;

/// Item travelling from the transport toward the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Raw transport bytes.
    Bytes(Bytes),
    /// Protocol header.
    Header(ProtocolHeader),
    /// Decoded frame.
    Frame(Frame),
    /// Empty frame.
    Heartbeat,
    /// SASL negotiation finished with this code.
    SaslOutcome(SaslCode),
}

/// Item travelling from the engine toward the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Protocol header.
    Header(ProtocolHeader),
    /// Frame to encode.
    Frame(Frame),
    /// Empty frame.
    Heartbeat,
    /// Encoded bytes ready for the transport.
    Bytes(Bytes),
}

/// Frame size limits pushed to every handler once negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Largest frame we accept.
    pub max_inbound_frame_size: u32,
    /// Largest frame the peer accepts.
    pub max_outbound_frame_size: u32,
}

/// A stage of the pipeline.
pub trait EngineHandler: Send {
    /// Unique handler name.
    fn name(&self) -> &'static str;

    /// Handle an item moving toward the engine.
    fn handle_read(&mut self, ctx: &mut HandlerContext, item: Inbound) -> Result<()> {
        ctx.fire_read(item);
        Ok(())
    }

    /// Handle an item moving toward the transport.
    fn handle_write(&mut self, ctx: &mut HandlerContext, item: Outbound) -> Result<()> {
        ctx.fire_write(item);
        Ok(())
    }

    /// Negotiated limits changed.
    fn configure(&mut self, _limits: TransportLimits) {}
}

/// Per-call handle a handler uses to forward items.
#[derive(Debug, Default)]
pub struct HandlerContext {
    reads: Vec<Inbound>,
    writes: Vec<Outbound>,
    remove: bool,
}

impl HandlerContext {
    /// Pass an item on toward the engine.
    pub fn fire_read(&mut self, item: Inbound) {
        self.reads.push(item);
    }

    /// Pass an item on toward the transport.
    pub fn fire_write(&mut self, item: Outbound) {
        self.writes.push(item);
    }

    /// Remove the calling handler once the current dispatch unwinds.
    pub fn remove_self(&mut self) {
        self.remove = true;
    }

    #[cfg(test)]
    pub(crate) fn into_parts(self) -> (Vec<Inbound>, Vec<Outbound>) {
        (self.reads, self.writes)
    }
}

struct Slot {
    name: &'static str,
    handler: Box<dyn EngineHandler>,
    removed: bool,
}

enum Work {
    /// Read to deliver to the handler at this index.
    Read(usize, Inbound),
    /// Write that has passed every handler at or above this index.
    Write(usize, Outbound),
}

/// Results of one dispatch.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Reads that reached the engine end.
    pub reads: Vec<Inbound>,
    /// Bytes that reached the transport end.
    pub output: Vec<Bytes>,
    /// First handler failure, if any.
    pub error: Option<Error>,
}

/// The handler chain.
#[derive(Default)]
pub struct Pipeline {
    slots: Vec<Slot>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Pipeline {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler at the engine end.
    pub fn add_last(&mut self, handler: Box<dyn EngineHandler>) -> Result<()> {
        let name = handler.name();
        if self.contains(name) {
            return Err(Error::Config(format!("duplicate pipeline handler {name}")));
        }
        self.slots.push(Slot {
            name,
            handler,
            removed: false,
        });
        Ok(())
    }

    /// Whether a live handler with this name is installed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| slot.name == name && !slot.removed)
    }

    /// Live handler names from the transport end.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.slots
            .iter()
            .filter(|slot| !slot.removed)
            .map(|slot| slot.name)
    }

    /// Push new limits to every handler.
    pub fn configure(&mut self, limits: TransportLimits) {
        for slot in &mut self.slots {
            slot.handler.configure(limits);
        }
    }

    /// Feed items in from the transport end.
    pub fn read(&mut self, items: impl IntoIterator<Item = Inbound>) -> Dispatch {
        let work = items.into_iter().map(|item| Work::Read(0, item)).collect();
        self.run(work)
    }

    /// Feed items in from the engine end.
    pub fn write(&mut self, items: impl IntoIterator<Item = Outbound>) -> Dispatch {
        let tail = self.slots.len();
        let work = items
            .into_iter()
            .map(|item| Work::Write(tail, item))
            .collect();
        self.run(work)
    }

    fn run(&mut self, mut work: VecDeque<Work>) -> Dispatch {
        let mut dispatch = Dispatch::default();
        while let Some(next) = work.pop_front() {
            match next {
                Work::Read(index, item) if index >= self.slots.len() => dispatch.reads.push(item),
                Work::Write(0, Outbound::Bytes(bytes)) => dispatch.output.push(bytes),
                Work::Write(0, item) => {
                    dispatch.error.get_or_insert_with(|| {
                        Error::Transport(format!("unencoded item reached the transport: {item:?}"))
                    });
                }
                Work::Read(index, item) => {
                    let slot = &mut self.slots[index];
                    if slot.removed {
                        work.push_back(Work::Read(index + 1, item));
                        continue;
                    }
                    let mut ctx = HandlerContext::default();
                    let result = slot.handler.handle_read(&mut ctx, item);
                    Self::settle(slot, index, ctx, result, &mut work, &mut dispatch);
                }
                Work::Write(above, item) => {
                    let index = above - 1;
                    let slot = &mut self.slots[index];
                    if slot.removed {
                        work.push_back(Work::Write(index, item));
                        continue;
                    }
                    let mut ctx = HandlerContext::default();
                    let result = slot.handler.handle_write(&mut ctx, item);
                    Self::settle(slot, index, ctx, result, &mut work, &mut dispatch);
                }
            }
        }
        self.compact();
        dispatch
    }

    fn settle(
        slot: &mut Slot,
        index: usize,
        ctx: HandlerContext,
        result: Result<()>,
        work: &mut VecDeque<Work>,
        dispatch: &mut Dispatch,
    ) {
        if let Err(err) = result {
            trace!(handler = slot.name, error = %err, "handler failed");
            dispatch.error.get_or_insert(err);
        }
        if ctx.remove {
            trace!(handler = slot.name, "handler removed");
            slot.removed = true;
        }
        work.extend(ctx.reads.into_iter().map(|item| Work::Read(index + 1, item)));
        work.extend(ctx.writes.into_iter().map(|item| Work::Write(index, item)));
    }

    fn compact(&mut self) {
        self.slots.retain(|slot| !slot.removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagger {
        name: &'static str,
        seen: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
        remove_after_read: bool,
    }

    impl EngineHandler for Tagger {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handle_read(&mut self, ctx: &mut HandlerContext, item: Inbound) -> Result<()> {
            self.seen.lock().unwrap().push(format!("{}:read", self.name));
            if self.remove_after_read {
                ctx.remove_self();
            }
            ctx.fire_read(item);
            Ok(())
        }

        fn handle_write(&mut self, ctx: &mut HandlerContext, item: Outbound) -> Result<()> {
            self.seen.lock().unwrap().push(format!("{}:write", self.name));
            let item = match item {
                Outbound::Heartbeat => Outbound::Bytes(Bytes::from_static(&[0; 8])),
                other => other,
            };
            ctx.fire_write(item);
            Ok(())
        }
    }

    fn pipeline(remove_b: bool) -> (Pipeline, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
        let seen = std::sync::Arc::default();
        let mut pipeline = Pipeline::new();
        for (name, remove) in [("a", false), ("b", remove_b)] {
            pipeline
                .add_last(Box::new(Tagger {
                    name,
                    seen: std::sync::Arc::clone(&seen),
                    remove_after_read: remove,
                }))
                .unwrap();
        }
        (pipeline, seen)
    }

    #[test]
    fn reads_and_writes_travel_opposite_ways() {
        let (mut pipeline, seen) = pipeline(false);
        let dispatch = pipeline.read([Inbound::Heartbeat]);
        assert_eq!(dispatch.reads, vec![Inbound::Heartbeat]);
        let dispatch = pipeline.write([Outbound::Heartbeat]);
        assert_eq!(dispatch.output.len(), 1);
        assert_eq!(*seen.lock().unwrap(), ["a:read", "b:read", "b:write", "a:write"]);
    }

    #[test]
    fn removal_applies_after_dispatch() {
        let (mut pipeline, seen) = pipeline(true);
        let dispatch = pipeline.read([Inbound::Heartbeat, Inbound::Heartbeat]);
        assert_eq!(dispatch.reads.len(), 2);
        assert_eq!(pipeline.names().collect::<Vec<_>>(), ["a"]);
        assert_eq!(*seen.lock().unwrap(), ["a:read", "a:read", "b:read"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (mut pipeline, seen) = pipeline(false);
        let err = pipeline
            .add_last(Box::new(Tagger {
                name: "a",
                seen,
                remove_after_read: false,
            }))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unencoded_writes_are_an_error() {
        let mut pipeline = Pipeline::new();
        let dispatch = pipeline.write([Outbound::Heartbeat]);
        assert!(matches!(dispatch.error, Some(Error::Transport(_))));
    }
}
