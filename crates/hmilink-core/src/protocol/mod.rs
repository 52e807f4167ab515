//! Serial protocol for Nextion-class HMI displays
//!
//! The display speaks an ASCII command language over a serial link and
//! replies with binary frames, each terminated by three 0xFF bytes. This
//! module covers the whole exchange: framing inbound bytes, encoding
//! outbound commands, matching replies to requests in FIFO order, and
//! dispatching autonomous events (touch, sleep, component pushes) to
//! registered callbacks.

pub mod channel;
pub mod codec;
pub mod command;
pub mod component;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod framer;
pub mod queue;

pub use channel::{list_ports, open_port, Channel, PortInfo, SerialChannel};
pub use codec::ConnectInfo;
pub use component::{ComponentConfig, ComponentKey, ComponentKind, Registry, StateValue};
pub use engine::{Engine, EngineConfig};
pub use error::ProtocolError;
pub use framer::{Frame, Framer};

/// Every frame in either direction ends with these three bytes.
pub const FRAME_TERMINATOR: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Factory default line speed for these displays.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
