//! Byte stream framer
//!
//! Inbound traffic from the display is a stream of frames, each terminated by
//! three 0xFF bytes: `[event code][payload...][FF FF FF]`. The framer
//! accumulates raw serial bytes and yields complete frames; partial frames are
//! carried forward until their terminator arrives.

use super::FRAME_TERMINATOR;

/// One decoded display event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Event code (first byte of the frame)
    pub event: u8,
    /// Payload between the event code and the terminator
    pub payload: Vec<u8>,
}

/// Accumulates serial bytes and extracts terminator-delimited frames
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the channel
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// The consumed prefix (frame plus terminator) is removed; leftover bytes
    /// stay buffered. An empty prefix before a terminator run is discarded.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let at = find_terminator(&self.buf)?;
            if at == 0 {
                // Terminator with nothing before it; drop it and keep looking
                tracing::trace!("discarding bare frame terminator");
                self.buf.drain(..FRAME_TERMINATOR.len());
                continue;
            }

            let event = self.buf[0];
            let payload = self.buf[1..at].to_vec();
            self.buf.drain(..at + FRAME_TERMINATOR.len());
            return Some(Frame { event, payload });
        }
    }

    /// Number of buffered, not-yet-framed bytes
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop any buffered bytes (used when the line is handed to the uploader)
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_TERMINATOR.len())
        .position(|w| w == FRAME_TERMINATOR)
}
