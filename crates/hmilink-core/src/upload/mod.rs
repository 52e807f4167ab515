//! Firmware (TFT) upload engine
//!
//! Streams a firmware image from an HTTP server to the display in 4096-byte
//! chunks. The display's internal flash cursor is independent of the host's
//! HTTP offset, so after each chunk the display may report a resume offset
//! (0x08 + little-endian u32) that overrides host bookkeeping entirely. Any
//! outcome, success or abort, leaves the display mid-reflash or freshly
//! flashed: the session always ends with a device soft reset and the host
//! must restart its own connection state afterwards.

pub mod http;

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::channel::Channel;
use crate::protocol::command;
use crate::protocol::dispatcher::events;
use crate::protocol::engine::Engine;
use crate::protocol::ProtocolError;

pub use http::{HttpRangeClient, RangeClient, RangeResponse};

/// Displays consume firmware in blocks of this size.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on the transfer buffer, and thus on one HTTP window.
pub const MAX_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("HTTP request failed after {0} attempts")]
    RetriesExhausted(u32),
    #[error("response is missing a usable Content-Range header")]
    MissingContentRange,
    #[error("firmware image is implausibly small ({0} bytes)")]
    ImageTooSmall(u64),
    #[error("upload handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("display reported resume offset {0} beyond image size {1}")]
    InvalidResumeOffset(u32, u64),
    #[error("could not allocate a transfer buffer")]
    BufferAllocation,
    #[error("HTTP transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Where to fetch the TFT image from
    pub url: String,
    /// Transfer buffer budget in bytes; rounded down to a multiple of 4096
    /// and capped at 64 KiB
    pub memory_budget: usize,
    /// How long to wait for the display's 0x05 ready byte after the
    /// announce command
    pub handshake_timeout_ms: u64,
    /// How long to wait for a per-chunk device response
    pub ack_timeout_ms: u64,
    /// Settling time after the very first chunk, which the display uses to
    /// erase flash
    pub first_chunk_settle_ms: u64,
    /// Attempts per HTTP range request
    pub http_retries: u32,
    /// Fixed delay between HTTP attempts
    pub retry_backoff_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            url: String::new(),
            memory_budget: MAX_BUFFER_SIZE,
            handshake_timeout_ms: 2000,
            ack_timeout_ms: 2000,
            first_chunk_settle_ms: 500,
            http_retries: 5,
            retry_backoff_ms: 250,
        }
    }
}

impl UploadConfig {
    pub fn new(url: impl Into<String>) -> Self {
        UploadConfig {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Per-chunk device response during transfer
enum ChunkAck {
    /// Keep streaming from the current offset
    Continue,
    /// The display's flash cursor; nonzero means re-request from here
    Resume(u32),
}

/// One firmware transfer. Lives for a single `run` call.
pub struct UploadSession {
    config: UploadConfig,
    total_size: u64,
    remaining: u64,
    buffer_size: usize,
    first_chunk_sent: bool,
}

impl UploadSession {
    pub fn new(config: UploadConfig) -> Self {
        UploadSession {
            config,
            total_size: 0,
            remaining: 0,
            buffer_size: 0,
            first_chunk_sent: false,
        }
    }

    /// Total image size, known once size negotiation has run
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Drive the whole transfer. Returns the number of bytes the image
    /// contains on success. The caller owns the restart that must follow.
    pub fn run<C, R>(
        &mut self,
        channel: &mut C,
        client: &mut R,
        baud_rate: u32,
        feed_watchdog: &mut dyn FnMut(),
    ) -> Result<u64, UploadError>
    where
        C: Channel,
        R: RangeClient,
    {
        self.negotiate_size(client)?;
        let buffer_size = negotiate_buffer_size(self.config.memory_budget)?;
        self.buffer_size = buffer_size;
        tracing::info!(
            total_size = self.total_size,
            buffer_size,
            "firmware size negotiated"
        );

        self.handshake(channel, baud_rate)?;
        self.transfer(channel, client, feed_watchdog)?;
        Ok(self.total_size)
    }

    /// Ask for the first 256 bytes purely to learn the image size from the
    /// Content-Range header
    fn negotiate_size<R: RangeClient>(&mut self, client: &mut R) -> Result<(), UploadError> {
        let url = self.config.url.clone();
        let response = self.fetch_with_retries(client, &url, 0, 255)?;
        let total = response.total_size.ok_or(UploadError::MissingContentRange)?;
        if total < CHUNK_SIZE as u64 {
            return Err(UploadError::ImageTooSmall(total));
        }
        self.total_size = total;
        self.remaining = total;
        Ok(())
    }

    /// Announce the transfer and wait for the display's single 0x05 ready
    /// byte. Anything else leaves the display in an ambiguous state, so
    /// there is no retry.
    fn handshake<C: Channel>(&mut self, channel: &mut C, baud_rate: u32) -> Result<(), UploadError> {
        channel.clear_input()?;
        let announce = command::upload_announce(self.total_size, baud_rate);
        tracing::info!(command = %announce, "announcing firmware upload");
        channel.write_all(&command::encode(&announce))?;
        channel.flush()?;

        let deadline = Instant::now() + Duration::from_millis(self.config.handshake_timeout_ms);
        let mut buf = [0u8; 64];
        loop {
            let n = channel.read(&mut buf)?;
            if buf[..n].contains(&events::UPLOAD_READY) {
                tracing::debug!("display is ready to receive firmware");
                return Ok(());
            }
            // Any answer other than the ready byte leaves the display in an
            // ambiguous state; abort rather than keep polling.
            if n > 0 {
                return Err(UploadError::HandshakeFailed(format!(
                    "unexpected response {:02X?}",
                    &buf[..n]
                )));
            }
            if Instant::now() >= deadline {
                return Err(UploadError::HandshakeFailed(
                    "timed out waiting for the ready byte".into(),
                ));
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn transfer<C, R>(
        &mut self,
        channel: &mut C,
        client: &mut R,
        feed_watchdog: &mut dyn FnMut(),
    ) -> Result<(), UploadError>
    where
        C: Channel,
        R: RangeClient,
    {
        let url = self.config.url.clone();
        let mut offset: u64 = 0;

        while self.remaining > 0 {
            let window = (self.buffer_size as u64).min(self.remaining);
            let response = self.fetch_with_retries(client, &url, offset, offset + window - 1)?;
            if response.body.is_empty() {
                return Err(UploadError::Transport("empty range response body".into()));
            }
            let mut written_in_window: u64 = 0;
            let mut resumed = false;

            for chunk in response.body.chunks(CHUNK_SIZE) {
                channel.write_all(chunk)?;
                channel.flush()?;
                self.remaining = self.remaining.saturating_sub(chunk.len() as u64);
                written_in_window += chunk.len() as u64;
                feed_watchdog();

                // Acks only arrive on full-block boundaries; the final
                // partial block of the image is not acknowledged.
                if chunk.len() < CHUNK_SIZE {
                    continue;
                }

                if !self.first_chunk_sent {
                    self.first_chunk_sent = true;
                    // The display erases flash after the first block.
                    thread::sleep(Duration::from_millis(self.config.first_chunk_settle_ms));
                    feed_watchdog();
                }

                if let ChunkAck::Resume(resume) = self.read_chunk_ack(channel)? {
                    if resume != 0 {
                        // The offset is raw device input; a report past the
                        // image end means the transfer is unrecoverable.
                        if u64::from(resume) >= self.total_size {
                            tracing::error!(resume, total_size = self.total_size, "resume offset out of range");
                            return Err(UploadError::InvalidResumeOffset(resume, self.total_size));
                        }
                        tracing::debug!(resume, "display requested a new offset");
                        offset = u64::from(resume);
                        self.remaining = self.total_size - offset;
                        resumed = true;
                        break;
                    }
                }
            }

            if !resumed {
                offset += written_in_window;
            }
            tracing::debug!(
                offset,
                remaining = self.remaining,
                "firmware window complete"
            );
        }
        Ok(())
    }

    /// Bounded read of the display's per-chunk response. Silence is not an
    /// error; only an 0x08-prefixed report carries information.
    fn read_chunk_ack<C: Channel>(&mut self, channel: &mut C) -> Result<ChunkAck, UploadError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.ack_timeout_ms);
        let mut received: Vec<u8> = Vec::with_capacity(8);
        let mut buf = [0u8; 16];

        loop {
            let n = channel.read(&mut buf)?;
            received.extend_from_slice(&buf[..n]);

            match received.first() {
                Some(&events::UPLOAD_RESUME) => {
                    if received.len() >= 5 {
                        return Ok(ChunkAck::Resume(LittleEndian::read_u32(&received[1..5])));
                    }
                }
                Some(_) => return Ok(ChunkAck::Continue),
                None => {}
            }

            if Instant::now() >= deadline {
                return Ok(ChunkAck::Continue);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn fetch_with_retries<R: RangeClient>(
        &mut self,
        client: &mut R,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<RangeResponse, UploadError> {
        let retries = self.config.http_retries.max(1);
        for attempt in 1..=retries {
            match client.fetch(url, start, end) {
                Ok(response) if response.status == 200 || response.status == 206 => {
                    return Ok(response);
                }
                Ok(response) => {
                    tracing::warn!(
                        status = response.status,
                        start,
                        end,
                        attempt,
                        "range request rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(error = %err, start, end, attempt, "range request failed");
                }
            }
            if attempt < retries {
                thread::sleep(Duration::from_millis(self.config.retry_backoff_ms));
            }
        }
        Err(UploadError::RetriesExhausted(retries))
    }
}

/// Round the budget to a multiple of 4096 within [4096, 65536] and prove the
/// allocation is possible, falling back to half and then the floor under
/// memory pressure.
fn negotiate_buffer_size(memory_budget: usize) -> Result<usize, UploadError> {
    let ideal = (memory_budget / CHUNK_SIZE * CHUNK_SIZE)
        .clamp(CHUNK_SIZE, MAX_BUFFER_SIZE);
    let halved = (ideal / 2 / CHUNK_SIZE * CHUNK_SIZE).max(CHUNK_SIZE);

    for candidate in [ideal, halved, CHUNK_SIZE] {
        let mut probe: Vec<u8> = Vec::new();
        if probe.try_reserve_exact(candidate).is_ok() {
            return Ok(candidate);
        }
        tracing::warn!(candidate, "transfer buffer allocation failed");
    }
    Err(UploadError::BufferAllocation)
}

impl<C: Channel> Engine<C> {
    /// Reflash the display from an HTTP-served TFT image.
    ///
    /// Consumes the connection for the duration of the transfer. Whatever
    /// the outcome, the display is soft-reset and this engine's session
    /// state is discarded; the caller must run setup again (and, on
    /// embedded-style hosts, usually restarts outright).
    pub fn upload_tft<R: RangeClient>(
        &mut self,
        config: UploadConfig,
        client: &mut R,
    ) -> Result<u64, UploadError> {
        tracing::info!(url = %config.url, "starting firmware upload");

        // A sleeping display will not answer the handshake.
        self.channel
            .write_all(&command::encode(&command::sleep(false)))?;
        self.channel.flush()?;
        thread::sleep(Duration::from_millis(250));
        self.channel.clear_input()?;

        let baud_rate = self.config.baud_rate;
        let mut watchdog = self.watchdog.take();
        let mut feed = || {
            if let Some(feed) = watchdog.as_mut() {
                feed();
            }
        };

        let mut session = UploadSession::new(config);
        let result = session.run(&mut self.channel, client, baud_rate, &mut feed);
        drop(feed);
        self.watchdog = watchdog;

        // The display is either flashing or confused; reset it and drop all
        // session state either way.
        let reset = self
            .channel
            .write_all(&command::encode(command::SOFT_RESET))
            .and_then(|_| self.channel.flush());
        if let Err(err) = reset {
            tracing::warn!(error = %err, "post-upload reset write failed");
        }
        self.queue.clear();
        self.framer.clear();
        self.is_setup = false;
        self.is_sleeping = false;

        match &result {
            Ok(total) => tracing::info!(total, "firmware upload complete, restart required"),
            Err(err) => tracing::error!(error = %err, "firmware upload aborted"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn buffer_size_rounds_down_and_caps() {
        assert_eq!(negotiate_buffer_size(1_000_000).unwrap(), MAX_BUFFER_SIZE);
        assert_eq!(negotiate_buffer_size(20_000).unwrap(), 16_384);
        assert_eq!(negotiate_buffer_size(0).unwrap(), CHUNK_SIZE);
        assert_eq!(negotiate_buffer_size(4096).unwrap(), CHUNK_SIZE);
    }
}
