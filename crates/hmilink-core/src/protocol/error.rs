//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the display
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Unknown component key {0}")]
    UnknownComponent(usize),

    #[error("Command too long ({0} bytes)")]
    CommandTooLong(usize),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
