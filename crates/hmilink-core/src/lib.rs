//! # HMILink Core Library
//!
//! Host-side driver for serial-attached Nextion-class HMI displays.
//!
//! This library provides:
//! - Frame parsing and event dispatch for the display's binary reply stream
//! - FIFO request/response matching for value reads
//! - Outbound command building with sleep and setup gating
//! - Component registry for sensors, switches, text fields and waveforms
//! - Resumable chunked firmware (TFT) upload fed from HTTP range requests
//!
//! ## Example
//!
//! ```rust,ignore
//! use hmilink_core::protocol::{Engine, EngineConfig, SerialChannel, ComponentConfig};
//!
//! let channel = SerialChannel::open("/dev/ttyUSB0", None)?;
//! let mut engine = Engine::new(channel, EngineConfig::default());
//! let rpm = engine.register(ComponentConfig::sensor("rpm"));
//! engine.begin_setup()?;
//!
//! loop {
//!     engine.poll()?;
//!     engine.update_component(rpm)?;
//! }
//! ```

pub mod protocol;
pub mod upload;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        list_ports, open_port, Channel, ComponentConfig, ComponentKey, ComponentKind, ConnectInfo,
        Engine, EngineConfig, Frame, Framer, PortInfo, ProtocolError, SerialChannel, StateValue,
        DEFAULT_BAUD_RATE, FRAME_TERMINATOR,
    };
    pub use crate::upload::{
        HttpRangeClient, RangeClient, RangeResponse, UploadConfig, UploadError, UploadSession,
    };
}
