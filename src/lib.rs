//! Sans-I/O AMQP 1.0 protocol engine
//!
//! The crate turns bytes into AMQP performatives and back, and runs the
//! connection, session and link state machines over them. It never touches
//! a socket or a clock: the caller feeds transport bytes in, drains encoded
//! bytes out, and advances time explicitly.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use amqp_engine::engine::{Engine, EngineConfig, EngineEvent};
//! use bytes::Bytes;
//!
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.start()?;
//! engine.open()?;
//! let session = engine.new_session(None)?;
//! engine.begin(session)?;
//! let sender = engine.new_sender(session, "sender-1", "queue")?;
//! engine.attach(sender)?;
//!
//! // Write `engine.take_output()` to the socket, feed replies back in.
//! # let bytes_from_socket = Bytes::new();
//! engine.ingest(bytes_from_socket)?;
//! while let Some(event) = engine.poll_event() {
//!     if let EngineEvent::LinkCredit(link) = event {
//!         engine.send(link, Bytes::from_static(b"t1"), Bytes::from_static(b"payload"), false)?;
//!     }
//! }
//! # Ok::<(), amqp_engine::Error>(())
//! ```
//!
//! # Layers
//!
//! - [`codec`]: the AMQP type system, encoders and decoders
//! - [`types`]: described types such as performatives, messaging sections, SASL bodies
//! - [`frame`]: protocol headers, frame parsing and frame encoding
//! - [`engine`]: the handler pipeline, the [`engine::Engine`] facade and its executor
//! - [`endpoint`]: connection, session and link state machines with flow control
//! - [`sasl`]: client and server SASL negotiation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod buffer;
pub mod codec;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod sasl;
pub mod types;

pub use engine::{Engine, EngineConfig, EngineEvent, EngineRole};
pub use error::{Error, Result};

/// AMQP protocol version implemented.
pub const PROTOCOL_VERSION: (u8, u8, u8) = (1, 0, 0);

/// IANA-assigned AMQP port.
pub const DEFAULT_PORT: u16 = 5672;
