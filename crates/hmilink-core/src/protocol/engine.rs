//! Protocol engine
//!
//! Owns the serial channel, the framer, the pending-command queue and the
//! component registry. Everything runs on a single cooperative poll path:
//! `poll()` drains all available bytes and dispatches every complete frame
//! before returning, so queue order can never be observed mid-mutation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::channel::Channel;
use super::codec::{self, ConnectInfo};
use super::command;
use super::component::{Component, ComponentConfig, ComponentKey, ComponentKind, Registry, StateValue};
use super::framer::{Frame, Framer};
use super::queue::{PendingQueue, QueueEntry};
use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Longest command the display's input buffer accepts
const MAX_COMMAND_LEN: usize = 255;

/// Callback invoked when the display autonomously enters or leaves sleep
pub type SleepCallback = Box<dyn FnMut(bool)>;

/// Callback invoked for touch events: (page id, component id, pressed)
pub type TouchCallback = Box<dyn FnMut(u8, u8, bool)>;

/// Listener invoked whenever a component's state is published
pub type StateListener = Box<dyn FnMut(ComponentKey, &StateValue)>;

/// Hook fed during bounded wait loops so an external watchdog stays happy
pub type WatchdogFeed = Box<dyn FnMut()>;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Baud rate the channel runs at (announced during firmware upload)
    pub baud_rate: u32,
    /// Initial backlight brightness in percent
    pub brightness_pct: u8,
    /// Page selected at the end of setup
    pub start_page: Option<String>,
    /// Seconds without touch before the display sleeps (`None` leaves the
    /// device default untouched)
    pub touch_sleep_timeout: Option<u16>,
    /// Page shown when the display wakes
    pub wake_up_page: Option<u8>,
    /// Wake on touch while sleeping
    pub auto_wake_on_touch: Option<bool>,
    /// How long to wait for the `comok` banner during setup
    pub connect_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            brightness_pct: 100,
            start_page: Some("0".to_string()),
            touch_sleep_timeout: None,
            wake_up_page: None,
            auto_wake_on_touch: None,
            connect_timeout_ms: 1500,
        }
    }
}

/// Bidirectional protocol engine for one display
pub struct Engine<C: Channel> {
    pub(crate) channel: C,
    pub(crate) config: EngineConfig,
    pub(crate) framer: Framer,
    pub(crate) queue: PendingQueue,
    pub(crate) registry: Registry,
    /// False until the setup handshake's queue entries have all drained
    pub(crate) is_setup: bool,
    /// Setup-time bypass for the setup gate
    pub(crate) ignore_setup_gate: bool,
    /// Mirrors the display's sleep state; mutated only by 0x86/0x87 frames
    pub(crate) is_sleeping: bool,
    pub(crate) connect_info: Option<ConnectInfo>,
    pub(crate) sleep_callbacks: Vec<SleepCallback>,
    pub(crate) wake_callbacks: Vec<SleepCallback>,
    pub(crate) touch_callbacks: Vec<TouchCallback>,
    pub(crate) state_listeners: Vec<StateListener>,
    pub(crate) watchdog: Option<WatchdogFeed>,
}

impl<C: Channel> Engine<C> {
    pub fn new(channel: C, config: EngineConfig) -> Self {
        Self {
            channel,
            config,
            framer: Framer::new(),
            queue: PendingQueue::new(),
            registry: Registry::new(),
            is_setup: false,
            ignore_setup_gate: false,
            is_sleeping: false,
            connect_info: None,
            sleep_callbacks: Vec::new(),
            wake_callbacks: Vec::new(),
            touch_callbacks: Vec::new(),
            state_listeners: Vec::new(),
            watchdog: None,
        }
    }

    /// True once the setup handshake has been acknowledged
    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    /// True while the display reports itself asleep
    pub fn is_sleeping(&self) -> bool {
        self.is_sleeping
    }

    /// Identity reported by the display during setup, if it answered
    pub fn connect_info(&self) -> Option<&ConnectInfo> {
        self.connect_info.as_ref()
    }

    /// Outstanding requests awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Direct access to the underlying channel
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    // ---- registration -----------------------------------------------------

    /// Register a downstream component and get its key
    pub fn register(&mut self, config: ComponentConfig) -> ComponentKey {
        tracing::debug!(
            kind = config.kind.as_str(),
            name = %config.variable_name,
            "registering component"
        );
        self.registry.add(config)
    }

    pub fn component(&self, key: ComponentKey) -> Option<&Component> {
        self.registry.get(key)
    }

    pub fn add_sleep_callback(&mut self, callback: SleepCallback) {
        self.sleep_callbacks.push(callback);
    }

    pub fn add_wake_callback(&mut self, callback: SleepCallback) {
        self.wake_callbacks.push(callback);
    }

    pub fn add_touch_callback(&mut self, callback: TouchCallback) {
        self.touch_callbacks.push(callback);
    }

    pub fn add_state_listener(&mut self, listener: StateListener) {
        self.state_listeners.push(listener);
    }

    pub fn set_watchdog(&mut self, feed: WatchdogFeed) {
        self.watchdog = Some(feed);
    }

    // ---- polling ----------------------------------------------------------

    /// Drain available bytes and dispatch every complete frame.
    ///
    /// Returns the number of frames processed. Called once per scheduling
    /// tick; never blocks.
    pub fn poll(&mut self) -> Result<usize, ProtocolError> {
        self.drain_channel()?;
        let mut processed = 0;
        while let Some(frame) = self.framer.next_frame() {
            self.dispatch(frame)?;
            processed += 1;
        }
        Ok(processed)
    }

    pub(crate) fn drain_channel(&mut self) -> Result<(), ProtocolError> {
        let mut buf = [0u8; 256];
        loop {
            let available = self.channel.bytes_to_read()?;
            if available == 0 {
                break;
            }
            let want = (available as usize).min(buf.len());
            let n = self.channel.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.framer.extend(&buf[..n]);
        }
        Ok(())
    }

    /// Timeout-bounded wait for the next complete frame.
    ///
    /// Only used from the setup handshake; the regular path is `poll`.
    pub(crate) fn recv_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, ProtocolError> {
        let start = Instant::now();
        loop {
            self.drain_channel()?;
            if let Some(frame) = self.framer.next_frame() {
                return Ok(Some(frame));
            }
            if start.elapsed() > timeout {
                return Ok(None);
            }
            self.feed_watchdog();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn feed_watchdog(&mut self) {
        if let Some(feed) = self.watchdog.as_mut() {
            feed();
        }
    }

    // ---- setup ------------------------------------------------------------

    /// Run the initial handshake.
    ///
    /// Raw commands establish a known interpreter state and request the
    /// `comok` identity banner; the remaining setup commands are tracked in
    /// the queue, and `SetupState` flips to true once their acks drain it.
    pub fn begin_setup(&mut self) -> Result<(), ProtocolError> {
        self.is_setup = false;
        self.ignore_setup_gate = true;
        self.queue.clear();
        self.framer.clear();
        self.channel.clear_input()?;

        self.write_command(command::ACK_OFF)?;
        self.write_command(&command::sleep(false))?;
        self.channel.flush()?;
        self.write_command("connect")?;

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match self.recv_frame(timeout)? {
            Some(frame) => {
                let mut raw = Vec::with_capacity(frame.payload.len() + 1);
                raw.push(frame.event);
                raw.extend_from_slice(&frame.payload);
                let text = String::from_utf8_lossy(&raw);
                match codec::parse_connect_info(&text) {
                    Some(info) => {
                        tracing::info!(
                            model = %info.device_model,
                            firmware = %info.firmware_version,
                            serial = %info.serial_number,
                            flash = %info.flash_size,
                            "display connected"
                        );
                        self.connect_info = Some(info);
                    }
                    None => {
                        tracing::debug!(response = %text, "display did not answer the connect request");
                    }
                }
            }
            None => {
                tracing::debug!("no connect banner before timeout");
            }
        }

        self.send_command_no_ack("setup ack mode", command::ACK_ALWAYS)?;
        let brightness = command::backlight(self.config.brightness_pct, false);
        self.send_command_no_ack("setup backlight", &brightness)?;
        if let Some(page) = self.config.start_page.clone() {
            self.send_command_no_ack("setup page", &command::goto_page(&page))?;
        }
        if let Some(seconds) = self.config.touch_sleep_timeout {
            self.send_command_no_ack("setup thsp", &command::touch_sleep_timeout(seconds))?;
        }
        if let Some(page) = self.config.wake_up_page {
            self.send_command_no_ack("setup wup", &command::wake_up_page(page))?;
        }
        if let Some(enabled) = self.config.auto_wake_on_touch {
            self.send_command_no_ack("setup thup", &command::auto_wake_on_touch(enabled))?;
        }
        self.ignore_setup_gate = false;
        Ok(())
    }

    // ---- outbound commands ------------------------------------------------

    pub(crate) fn write_command(&mut self, command_text: &str) -> Result<(), ProtocolError> {
        // The display's command interpreter has a small fixed input buffer.
        if command_text.len() > MAX_COMMAND_LEN {
            return Err(ProtocolError::CommandTooLong(command_text.len()));
        }
        tracing::trace!(command = command_text, "tx");
        self.channel.write_all(&command::encode(command_text))?;
        Ok(())
    }

    fn may_send(&self, command_text: &str) -> bool {
        if !self.is_setup && !self.ignore_setup_gate {
            tracing::trace!(command = command_text, "suppressed: setup incomplete");
            return false;
        }
        if self.is_sleeping && !command::is_sleep_safe(command_text) {
            tracing::debug!(command = command_text, "suppressed: display is sleeping");
            return false;
        }
        true
    }

    /// Send a fire-and-forget command, tracking its ack in the queue.
    ///
    /// Returns `Ok(false)` when the command was suppressed by setup or sleep
    /// gating.
    pub fn send_command_no_ack(
        &mut self,
        label: &str,
        command_text: &str,
    ) -> Result<bool, ProtocolError> {
        if !self.may_send(command_text) {
            return Ok(false);
        }
        self.queue.push_back(QueueEntry::NoResult(label.to_string()));
        self.write_command(command_text)?;
        Ok(true)
    }

    /// Raw passthrough: no queue entry, no gating. Only meaningful before
    /// setup completes (the interpreter is in `bkcmd=0` mode and sends no
    /// acks) or for diagnostics.
    pub fn send_raw_command(&mut self, command_text: &str) -> Result<(), ProtocolError> {
        self.write_command(command_text)
    }

    /// Queue a `get` for the component and send it.
    ///
    /// Suppressed while the display sleeps: a sleeping interpreter drops the
    /// `get` without replying, which would leave the queue entry stuck at the
    /// head and desynchronize every later reply.
    pub fn update_component(&mut self, key: ComponentKey) -> Result<bool, ProtocolError> {
        if (!self.is_setup && !self.ignore_setup_gate) || self.is_sleeping {
            return Ok(false);
        }
        let comp = self
            .registry
            .get(key)
            .ok_or(ProtocolError::UnknownComponent(key.index()))?;
        let cmd = command::get_value(comp.variable_name_to_send());
        self.queue.push_back(QueueEntry::Component(key));
        self.write_command(&cmd)?;
        Ok(true)
    }

    /// Queue a `get` for every non-waveform component whose variable name
    /// starts with `prefix` (typically a page name, after a page switch).
    /// Sleep-gated like [`Self::update_component`].
    pub fn update_components_by_prefix(&mut self, prefix: &str) -> Result<(), ProtocolError> {
        if self.is_sleeping {
            return Ok(());
        }
        let keys: Vec<ComponentKey> = self
            .registry
            .iter()
            .filter(|(_, c)| {
                c.kind() != ComponentKind::WaveformSensor && c.variable_name().starts_with(prefix)
            })
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.update_component(key)?;
        }
        Ok(())
    }

    /// Update the host-side mirror of a component and optionally publish the
    /// value to listeners and/or write it to the display.
    ///
    /// Writes to a sleeping display (or a hidden component) are deferred by
    /// marking the component dirty; the wake handler flushes dirty state.
    pub fn set_component_state(
        &mut self,
        key: ComponentKey,
        value: StateValue,
        publish: bool,
        send_to_device: bool,
    ) -> Result<(), ProtocolError> {
        let pending = {
            let sleeping = self.is_sleeping;
            let comp = self
                .registry
                .get_mut(key)
                .ok_or(ProtocolError::UnknownComponent(key.index()))?;
            comp.state = Some(value.clone());
            if send_to_device {
                let cmd = match &value {
                    StateValue::Int(v) => command::set_int(&comp.variable_name_to_send, *v),
                    StateValue::Bool(b) => {
                        command::set_int(&comp.variable_name_to_send, i32::from(*b))
                    }
                    StateValue::Text(t) => command::set_text(&comp.variable_name_to_send, t),
                };
                if (sleeping && !command::is_sleep_safe(&cmd)) || !comp.visible {
                    comp.needs_send = true;
                    tracing::debug!(
                        name = %comp.variable_name,
                        "deferring state write until wake/visible"
                    );
                    None
                } else {
                    comp.needs_send = false;
                    Some((comp.variable_name.clone(), cmd))
                }
            } else {
                None
            }
        };

        if let Some((label, cmd)) = pending {
            self.send_command_no_ack(&label, &cmd)?;
        }
        if publish {
            self.notify_state(key, &value);
        }
        Ok(())
    }

    /// Route a state update to every registered component of `kind` matching
    /// `name` (local write, publish, and device write)
    pub fn set_state_by_name(
        &mut self,
        kind: ComponentKind,
        name: &str,
        value: StateValue,
    ) -> Result<bool, ProtocolError> {
        let keys = self.registry.find_by_name(kind, name);
        let matched = !keys.is_empty();
        for key in keys {
            self.set_component_state(key, value.clone(), true, true)?;
        }
        Ok(matched)
    }

    /// Write component states back to the display: dirty ones, or all of them
    /// when `force` is set. Waveforms are excluded.
    pub fn send_all_states(&mut self, force: bool) -> Result<(), ProtocolError> {
        let keys: Vec<ComponentKey> = self
            .registry
            .iter()
            .filter(|(_, c)| {
                c.kind() != ComponentKind::WaveformSensor
                    && (force || c.needs_send())
                    && c.state().is_some()
            })
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            if let Some(value) = self.registry.get(key).and_then(|c| c.state().cloned()) {
                self.set_component_state(key, value, false, true)?;
            }
        }
        Ok(())
    }

    // ---- waveforms --------------------------------------------------------

    /// Buffer waveform samples for later transmission
    pub fn feed_waveform(&mut self, key: ComponentKey, samples: &[u8]) -> Result<(), ProtocolError> {
        let comp = self
            .registry
            .get_mut(key)
            .ok_or(ProtocolError::UnknownComponent(key.index()))?;
        comp.push_wave_samples(samples);
        Ok(())
    }

    /// Announce the component's buffered samples with `addt`.
    ///
    /// The display answers with transmit-ready (0xFE) when it wants the bytes;
    /// the dispatcher writes them then.
    pub fn send_waveform(&mut self, key: ComponentKey) -> Result<bool, ProtocolError> {
        if (!self.is_setup && !self.ignore_setup_gate) || self.is_sleeping {
            return Ok(false);
        }
        let comp = self
            .registry
            .get(key)
            .ok_or(ProtocolError::UnknownComponent(key.index()))?;
        let announced = comp.wave_buffer_len();
        if announced == 0 {
            return Ok(false);
        }
        let cmd = command::add_waveform_data(comp.component_id, comp.wave_channel_id, announced);
        self.queue.push_back(QueueEntry::Waveform { key, announced });
        self.write_command(&cmd)?;
        Ok(true)
    }

    // ---- convenience commands --------------------------------------------

    pub fn goto_page(&mut self, page: &str) -> Result<bool, ProtocolError> {
        self.send_command_no_ack("goto_page", &command::goto_page(page))
    }

    pub fn set_backlight_brightness(&mut self, brightness_pct: u8) -> Result<bool, ProtocolError> {
        self.send_command_no_ack("backlight", &command::backlight(brightness_pct, false))
    }

    /// Ask the display to enter or leave sleep. The mirrored sleep state only
    /// changes when the display confirms with its autonomous 0x86/0x87 frame.
    pub fn sleep(&mut self, enter: bool) -> Result<bool, ProtocolError> {
        self.send_command_no_ack("sleep", &command::sleep(enter))
    }

    pub fn soft_reset(&mut self) -> Result<bool, ProtocolError> {
        self.send_command_no_ack("soft_reset", command::SOFT_RESET)
    }

    /// Show or hide a component; re-sends deferred state when it becomes
    /// visible again
    pub fn set_component_visible(
        &mut self,
        key: ComponentKey,
        visible: bool,
    ) -> Result<(), ProtocolError> {
        let (name, resend) = {
            let comp = self
                .registry
                .get_mut(key)
                .ok_or(ProtocolError::UnknownComponent(key.index()))?;
            comp.visible = visible;
            (comp.variable_name_to_send.clone(), visible && comp.needs_send)
        };
        self.send_command_no_ack("visibility", &command::visibility(&name, visible))?;
        if resend {
            if let Some(value) = self.registry.get(key).and_then(|c| c.state().cloned()) {
                self.set_component_state(key, value, false, true)?;
            }
        }
        Ok(())
    }

    // ---- callback plumbing ------------------------------------------------

    pub(crate) fn notify_state(&mut self, key: ComponentKey, value: &StateValue) {
        let mut listeners = std::mem::take(&mut self.state_listeners);
        for listener in listeners.iter_mut() {
            listener(key, value);
        }
        listeners.append(&mut self.state_listeners);
        self.state_listeners = listeners;
    }

    pub(crate) fn notify_sleep(&mut self, asleep: bool) {
        let mut callbacks = std::mem::take(&mut self.sleep_callbacks);
        for callback in callbacks.iter_mut() {
            callback(asleep);
        }
        callbacks.append(&mut self.sleep_callbacks);
        self.sleep_callbacks = callbacks;
    }

    pub(crate) fn notify_wake(&mut self, awake: bool) {
        let mut callbacks = std::mem::take(&mut self.wake_callbacks);
        for callback in callbacks.iter_mut() {
            callback(awake);
        }
        callbacks.append(&mut self.wake_callbacks);
        self.wake_callbacks = callbacks;
    }

    pub(crate) fn notify_touch(&mut self, page_id: u8, component_id: u8, pressed: bool) {
        let mut callbacks = std::mem::take(&mut self.touch_callbacks);
        for callback in callbacks.iter_mut() {
            callback(page_id, component_id, pressed);
        }
        callbacks.append(&mut self.touch_callbacks);
        self.touch_callbacks = callbacks;
    }
}
