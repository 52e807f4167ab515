//! Inbound event dispatch
//!
//! One self-contained transition per frame: the event code selects the
//! handler, which may log, mutate the pending queue, deliver a decoded value
//! to a registered component, or write waveform bytes back out. Replies match
//! strictly FIFO against the queue; a mismatch is a protocol error and is
//! never silently repaired.

use super::channel::Channel;
use super::codec;
use super::component::{ComponentKind, StateValue};
use super::engine::Engine;
use super::framer::Frame;
use super::queue::QueueEntry;
use super::ProtocolError;

/// Event codes sent by the display
pub mod events {
    pub const INSTRUCTION_FAILED: u8 = 0x00;
    pub const INSTRUCTION_OK: u8 = 0x01;
    pub const INVALID_COMPONENT: u8 = 0x02;
    pub const INVALID_PAGE: u8 = 0x03;
    pub const INVALID_PICTURE: u8 = 0x04;
    pub const INVALID_FONT: u8 = 0x05;
    pub const FILE_OPERATION_FAILED: u8 = 0x06;
    pub const CRC_CHECK_FAILED: u8 = 0x09;
    pub const INVALID_BAUD: u8 = 0x11;
    pub const INVALID_WAVEFORM: u8 = 0x12;
    pub const INVALID_VARIABLE: u8 = 0x1A;
    pub const INVALID_OPERATION: u8 = 0x1B;
    pub const ASSIGN_FAILED: u8 = 0x1C;
    pub const EEPROM_FAILED: u8 = 0x1D;
    pub const INVALID_PARAMETER_COUNT: u8 = 0x1E;
    pub const IO_OPERATION_FAILED: u8 = 0x1F;
    pub const INVALID_ESCAPE: u8 = 0x20;
    pub const VARIABLE_NAME_TOO_LONG: u8 = 0x23;
    pub const SERIAL_BUFFER_OVERFLOW: u8 = 0x24;
    pub const TOUCH: u8 = 0x65;
    pub const TOUCH_COORDINATE: u8 = 0x67;
    pub const TOUCH_COORDINATE_SLEEP: u8 = 0x68;
    pub const STRING_RETURN: u8 = 0x70;
    pub const NUMERIC_RETURN: u8 = 0x71;
    pub const AUTO_SLEEP: u8 = 0x86;
    pub const AUTO_WAKE: u8 = 0x87;
    pub const STARTUP_BANNER: u8 = 0x88;
    pub const SWITCH_PUSH: u8 = 0x90;
    pub const SENSOR_PUSH: u8 = 0x91;
    pub const TEXT_PUSH: u8 = 0x92;
    pub const BINARY_SENSOR_PUSH: u8 = 0x93;
    pub const TRANSMIT_FINISHED: u8 = 0xFD;
    pub const TRANSMIT_READY: u8 = 0xFE;
    /// Acknowledgement byte during a firmware upload handshake
    pub const UPLOAD_READY: u8 = 0x05;
    /// Prefix of an upload resume-offset report
    pub const UPLOAD_RESUME: u8 = 0x08;
}

impl<C: Channel> Engine<C> {
    pub(crate) fn dispatch(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        use events::*;

        match frame.event {
            INSTRUCTION_FAILED => tracing::warn!("display rejected the instruction"),
            INSTRUCTION_OK => self.handle_ack(),
            INVALID_COMPONENT => self.pop_head_for_error("component id or name invalid"),
            INVALID_PAGE => tracing::warn!("display reported page id invalid"),
            INVALID_PICTURE => tracing::warn!("display reported picture id invalid"),
            INVALID_FONT => tracing::warn!("display reported font id invalid"),
            FILE_OPERATION_FAILED => tracing::warn!("display reported file operation failure"),
            CRC_CHECK_FAILED => tracing::warn!("display reported instruction CRC failure"),
            INVALID_BAUD => tracing::warn!("display reported baud rate invalid"),
            INVALID_WAVEFORM => self.handle_invalid_waveform(),
            INVALID_VARIABLE => self.pop_head_for_error("variable name invalid"),
            INVALID_OPERATION => tracing::warn!("display reported variable operation invalid"),
            ASSIGN_FAILED => tracing::warn!("display reported failure to assign variable"),
            EEPROM_FAILED => tracing::warn!("display reported EEPROM operation failure"),
            INVALID_PARAMETER_COUNT => {
                tracing::warn!("display reported parameter quantity invalid")
            }
            IO_OPERATION_FAILED => {
                tracing::warn!("display reported component I/O operation failure")
            }
            INVALID_ESCAPE => tracing::warn!("display reported undefined escape characters"),
            VARIABLE_NAME_TOO_LONG => self.pop_head_for_error("variable name too long"),
            SERIAL_BUFFER_OVERFLOW => tracing::warn!("display reported serial buffer overflow"),
            TOUCH => self.handle_touch(&frame.payload),
            TOUCH_COORDINATE | TOUCH_COORDINATE_SLEEP => {
                self.handle_touch_coordinates(&frame.payload)
            }
            STRING_RETURN => self.handle_string_return(&frame.payload),
            NUMERIC_RETURN => self.handle_numeric_return(&frame.payload),
            AUTO_SLEEP => {
                tracing::debug!("display entered sleep");
                self.notify_sleep(true);
                self.is_sleeping = true;
            }
            AUTO_WAKE => {
                tracing::debug!("display woke up");
                self.notify_wake(true);
                self.is_sleeping = false;
                self.send_all_states(false)?;
            }
            STARTUP_BANNER => tracing::debug!("display startup banner"),
            SWITCH_PUSH => self.handle_bool_push(ComponentKind::Switch, &frame.payload),
            SENSOR_PUSH => self.handle_sensor_push(&frame.payload),
            TEXT_PUSH => self.handle_text_push(&frame.payload),
            BINARY_SENSOR_PUSH => {
                self.handle_bool_push(ComponentKind::BinarySensor, &frame.payload)
            }
            TRANSMIT_FINISHED => tracing::debug!("display reported transmit finished"),
            TRANSMIT_READY => self.handle_transmit_ready()?,
            other => tracing::warn!("unknown event code 0x{other:02X}"),
        }
        Ok(())
    }

    /// 0x01: ack for the oldest pending fire-and-forget command. Draining the
    /// queue while setup is incomplete completes the setup handshake.
    fn handle_ack(&mut self) {
        match self.queue.front() {
            Some(QueueEntry::NoResult(_)) => {
                if let Some(QueueEntry::NoResult(label)) = self.queue.pop_front() {
                    tracing::trace!(label = %label, "command acknowledged");
                }
                if !self.is_setup && self.queue.is_empty() {
                    tracing::info!("display setup complete");
                    self.is_setup = true;
                }
            }
            Some(other) => {
                tracing::error!(head = %other.describe(), "ack does not match queue head");
            }
            None => tracing::error!("ack received but queue is empty"),
        }
    }

    /// Device-reported errors that consume the offending request
    fn pop_head_for_error(&mut self, reason: &str) {
        match self.queue.pop_front() {
            Some(entry) => {
                tracing::warn!(reason, entry = %entry.describe(), "display reported error");
            }
            None => tracing::error!(reason, "error reported but queue is empty"),
        }
    }

    /// 0x12: waveform errors are not ordered with ordinary replies, so the
    /// whole queue is scanned for the first waveform entry
    fn handle_invalid_waveform(&mut self) {
        match self.queue.first_waveform() {
            Some((index, key, _)) => {
                let (component_id, channel_id) = self
                    .registry
                    .get(key)
                    .map(|c| (c.component_id, c.wave_channel_id))
                    .unwrap_or((0, 0));
                tracing::warn!(
                    component_id,
                    channel_id,
                    "display reported invalid waveform id or channel"
                );
                self.queue.remove(index);
            }
            None => {
                tracing::warn!("invalid waveform reported but no waveform entry is queued");
            }
        }
    }

    /// 0x65: page id, component id, press state
    fn handle_touch(&mut self, payload: &[u8]) {
        if payload.len() != 3 {
            tracing::warn!(len = payload.len(), "touch event expects 3 payload bytes");
            return;
        }
        let (page_id, component_id, pressed) = (payload[0], payload[1], payload[2] != 0);
        tracing::debug!(page_id, component_id, pressed, "touch event");
        self.notify_touch(page_id, component_id, pressed);

        let keys: Vec<_> = self
            .registry
            .iter()
            .filter(|(_, c)| c.touch_binding == Some((page_id, component_id)))
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            if let Some(comp) = self.registry.get_mut(key) {
                comp.state = Some(StateValue::Bool(pressed));
            }
            self.notify_state(key, &StateValue::Bool(pressed));
        }
    }

    /// 0x67/0x68: raw coordinates. Logged only; wiring these anywhere is an
    /// extension point (register a touch callback and enable `sendxy`).
    fn handle_touch_coordinates(&mut self, payload: &[u8]) {
        match codec::decode_coordinates(payload) {
            Some((x, y, pressed)) => {
                tracing::debug!(x, y, pressed, "touch coordinates");
            }
            None => {
                tracing::warn!(len = payload.len(), "coordinate event expects 5 payload bytes");
            }
        }
    }

    /// 0x70: string value for the component at the queue head
    fn handle_string_return(&mut self, payload: &[u8]) {
        if self.queue.is_empty() {
            tracing::warn!("string return but the queue is empty");
            return;
        }
        if payload.is_empty() {
            tracing::error!("string return with no data");
            return;
        }

        let key = match self.queue.front() {
            Some(QueueEntry::Component(key))
                if self
                    .registry
                    .get(*key)
                    .map(|c| c.kind() == ComponentKind::TextSensor)
                    .unwrap_or(false) =>
            {
                *key
            }
            Some(other) => {
                tracing::error!(
                    head = %other.describe(),
                    "string return but queue head is not a text sensor"
                );
                return;
            }
            None => return,
        };

        let value = StateValue::Text(String::from_utf8_lossy(payload).into_owned());
        self.queue.pop_front();
        if let Some(comp) = self.registry.get_mut(key) {
            comp.state = Some(value.clone());
        }
        self.notify_state(key, &value);
    }

    /// 0x71: little-endian numeric value for the component at the queue head
    fn handle_numeric_return(&mut self, payload: &[u8]) {
        if self.queue.is_empty() {
            tracing::error!("numeric return but the queue is empty");
            return;
        }
        let Some(decoded) = codec::decode_signed_le(payload) else {
            tracing::error!(len = payload.len(), "numeric return expects 1-4 payload bytes");
            return;
        };

        let (key, kind) = match self.queue.front() {
            Some(QueueEntry::Component(key)) => {
                match self.registry.get(*key).map(|c| c.kind()) {
                    Some(kind) if kind.is_numeric() => (*key, kind),
                    _ => {
                        tracing::error!(
                            component = key.index(),
                            "numeric return but queue head is not a numeric component"
                        );
                        return;
                    }
                }
            }
            Some(other) => {
                tracing::error!(
                    head = %other.describe(),
                    "numeric return but queue head is not a numeric component"
                );
                return;
            }
            None => return,
        };

        let value = match kind {
            ComponentKind::Sensor => StateValue::Int(decoded),
            _ => StateValue::Bool(decoded != 0),
        };
        self.queue.pop_front();
        if let Some(comp) = self.registry.get_mut(key) {
            comp.state = Some(value.clone());
        }
        self.notify_state(key, &value);
    }

    /// 0x90/0x93: NUL-terminated name followed by one status byte
    fn handle_bool_push(&mut self, kind: ComponentKind, payload: &[u8]) {
        let Some((name, rest)) = codec::split_nul(payload) else {
            tracing::warn!(kind = kind.as_str(), "boolean push without NUL-terminated name");
            return;
        };
        if rest.is_empty() {
            tracing::warn!(kind = kind.as_str(), "boolean push without a status byte");
            return;
        }
        let name = String::from_utf8_lossy(name).into_owned();
        let on = rest[0] != 0;
        tracing::debug!(kind = kind.as_str(), name = %name, on, "boolean push");
        self.route_value(kind, &name, StateValue::Bool(on));
    }

    /// 0x91: NUL-terminated name followed by a 1-4 byte little-endian value
    fn handle_sensor_push(&mut self, payload: &[u8]) {
        let Some((name, rest)) = codec::split_nul(payload) else {
            tracing::warn!("sensor push without NUL-terminated name");
            return;
        };
        let Some(decoded) = codec::decode_signed_le(rest) else {
            tracing::warn!(len = rest.len(), "sensor push value expects 1-4 bytes");
            return;
        };
        let name = String::from_utf8_lossy(name).into_owned();
        tracing::debug!(name = %name, value = decoded, "sensor push");
        self.route_value(ComponentKind::Sensor, &name, StateValue::Int(decoded));
    }

    /// 0x92: NUL-terminated name followed by NUL-terminated text, accumulated
    /// incrementally rather than written at fixed indices
    fn handle_text_push(&mut self, payload: &[u8]) {
        let Some((name, rest)) = codec::split_nul(payload) else {
            tracing::warn!("text push without NUL-terminated name");
            return;
        };
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            tracing::warn!("text push without terminated text");
            return;
        };
        let name = String::from_utf8_lossy(name).into_owned();
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        tracing::debug!(name = %name, text = %text, "text push");
        self.route_value(ComponentKind::TextSensor, &name, StateValue::Text(text));
    }

    /// 0xFE: the display wants the announced waveform bytes now
    fn handle_transmit_ready(&mut self) -> Result<(), ProtocolError> {
        let Some((index, key, announced)) = self.queue.first_waveform() else {
            tracing::error!("transmit ready but no waveform entry is queued");
            return Ok(());
        };

        let Some(comp) = self.registry.get_mut(key) else {
            tracing::error!(component = key.index(), "queued waveform component is unknown");
            self.queue.remove(index);
            return Ok(());
        };

        let n = announced.min(comp.wave_buffer.len());
        self.channel.write_all(&comp.wave_buffer[..n])?;
        comp.wave_buffer.drain(..n);
        tracing::debug!(
            component_id = comp.component_id,
            channel_id = comp.wave_channel_id,
            bytes = n,
            "waveform data written"
        );
        self.queue.remove(index);
        Ok(())
    }

    /// Deliver a pushed value to every matching registered component
    fn route_value(&mut self, kind: ComponentKind, name: &str, value: StateValue) {
        let keys = self.registry.find_by_name(kind, name);
        if keys.is_empty() {
            tracing::debug!(kind = kind.as_str(), name, "push for unregistered component");
            return;
        }
        for key in keys {
            if let Some(comp) = self.registry.get_mut(key) {
                comp.state = Some(value.clone());
            }
            self.notify_state(key, &value);
        }
    }
}
