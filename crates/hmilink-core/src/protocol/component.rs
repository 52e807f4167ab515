//! Downstream component registry
//!
//! Each display object the host mirrors (sensor, switch, text field, waveform
//! channel) is registered once and addressed afterwards by [`ComponentKey`].
//! The registry is owned by the engine; queue entries and callers hold only
//! keys, so no queue pop ever has to free a component.

/// What a registered component expects to receive from the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Sensor,
    BinarySensor,
    Switch,
    TextSensor,
    WaveformSensor,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Sensor => "sensor",
            ComponentKind::BinarySensor => "binary_sensor",
            ComponentKind::Switch => "switch",
            ComponentKind::TextSensor => "text_sensor",
            ComponentKind::WaveformSensor => "waveform_sensor",
        }
    }

    /// Kinds delivered by a numeric (0x71) return
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ComponentKind::Sensor | ComponentKind::BinarySensor | ComponentKind::Switch
        )
    }
}

/// Typed state value delivered to or read from a component
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Int(i32),
    Bool(bool),
    Text(String),
}

/// Handle for a registered component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey(pub(crate) usize);

impl ComponentKey {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Registration-time description of a component
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    pub kind: ComponentKind,
    /// Name used to match unsolicited pushes and identify the component
    pub variable_name: String,
    /// Name written in set/get commands; defaults to `variable_name`
    pub variable_name_to_send: Option<String>,
    /// Display component id (waveform and touch components)
    pub component_id: u8,
    /// Waveform channel on the display component
    pub wave_channel_id: u8,
    /// Cap on buffered waveform samples awaiting transmission
    pub wave_max_length: usize,
    /// Touch binding: deliver 0x65 events matching (page id, component id)
    pub touch_binding: Option<(u8, u8)>,
}

impl ComponentConfig {
    fn new(kind: ComponentKind, variable_name: &str) -> Self {
        Self {
            kind,
            variable_name: variable_name.to_string(),
            variable_name_to_send: None,
            component_id: 0,
            wave_channel_id: 0,
            wave_max_length: 255,
            touch_binding: None,
        }
    }

    pub fn sensor(variable_name: &str) -> Self {
        Self::new(ComponentKind::Sensor, variable_name)
    }

    pub fn binary_sensor(variable_name: &str) -> Self {
        Self::new(ComponentKind::BinarySensor, variable_name)
    }

    pub fn switch(variable_name: &str) -> Self {
        Self::new(ComponentKind::Switch, variable_name)
    }

    pub fn text_sensor(variable_name: &str) -> Self {
        Self::new(ComponentKind::TextSensor, variable_name)
    }

    pub fn waveform(variable_name: &str, component_id: u8, wave_channel_id: u8) -> Self {
        let mut cfg = Self::new(ComponentKind::WaveformSensor, variable_name);
        cfg.component_id = component_id;
        cfg.wave_channel_id = wave_channel_id;
        cfg
    }

    /// Use a different name on the wire than for push matching,
    /// e.g. `temp` vs `page0.temp.val`
    pub fn with_send_name(mut self, name: &str) -> Self {
        self.variable_name_to_send = Some(name.to_string());
        self
    }

    /// Bind touch events from (page id, component id) to this component
    pub fn with_touch_binding(mut self, page_id: u8, component_id: u8) -> Self {
        self.touch_binding = Some((page_id, component_id));
        self
    }

    pub fn with_wave_max_length(mut self, len: usize) -> Self {
        self.wave_max_length = len;
        self
    }
}

/// A registered component and its host-side mirror state
#[derive(Debug)]
pub struct Component {
    pub(crate) kind: ComponentKind,
    pub(crate) variable_name: String,
    pub(crate) variable_name_to_send: String,
    pub(crate) component_id: u8,
    pub(crate) wave_channel_id: u8,
    pub(crate) wave_max_length: usize,
    pub(crate) touch_binding: Option<(u8, u8)>,
    pub(crate) state: Option<StateValue>,
    /// Set when a device write was deferred (sleeping or hidden component)
    pub(crate) needs_send: bool,
    pub(crate) visible: bool,
    pub(crate) wave_buffer: Vec<u8>,
}

impl Component {
    fn from_config(config: ComponentConfig) -> Self {
        let variable_name_to_send = config
            .variable_name_to_send
            .unwrap_or_else(|| config.variable_name.clone());
        Self {
            kind: config.kind,
            variable_name: config.variable_name,
            variable_name_to_send,
            component_id: config.component_id,
            wave_channel_id: config.wave_channel_id,
            wave_max_length: config.wave_max_length,
            touch_binding: config.touch_binding,
            state: None,
            needs_send: false,
            visible: true,
            wave_buffer: Vec::new(),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn variable_name(&self) -> &str {
        &self.variable_name
    }

    pub fn variable_name_to_send(&self) -> &str {
        &self.variable_name_to_send
    }

    pub fn state(&self) -> Option<&StateValue> {
        self.state.as_ref()
    }

    pub fn needs_send(&self) -> bool {
        self.needs_send
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Buffered waveform samples not yet written to the display
    pub fn wave_buffer_len(&self) -> usize {
        self.wave_buffer.len()
    }

    /// Append waveform samples, dropping the oldest when over the cap
    pub(crate) fn push_wave_samples(&mut self, samples: &[u8]) {
        self.wave_buffer.extend_from_slice(samples);
        if self.wave_buffer.len() > self.wave_max_length {
            let excess = self.wave_buffer.len() - self.wave_max_length;
            self.wave_buffer.drain(..excess);
        }
    }
}

/// Engine-owned collection of registered components
#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Component>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, config: ComponentConfig) -> ComponentKey {
        self.slots.push(Component::from_config(config));
        ComponentKey(self.slots.len() - 1)
    }

    pub fn get(&self, key: ComponentKey) -> Option<&Component> {
        self.slots.get(key.0)
    }

    pub fn get_mut(&mut self, key: ComponentKey) -> Option<&mut Component> {
        self.slots.get_mut(key.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentKey, &Component)> {
        self.slots.iter().enumerate().map(|(i, c)| (ComponentKey(i), c))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ComponentKey, &mut Component)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, c)| (ComponentKey(i), c))
    }

    /// Keys of components of `kind` whose variable name matches exactly
    pub fn find_by_name(&self, kind: ComponentKind, name: &str) -> Vec<ComponentKey> {
        self.iter()
            .filter(|(_, c)| c.kind == kind && c.variable_name == name)
            .map(|(k, _)| k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_send_name_defaults_to_variable_name() {
        let mut registry = Registry::new();
        let key = registry.add(ComponentConfig::sensor("temp"));
        assert_eq!(registry.get(key).unwrap().variable_name_to_send(), "temp");

        let key = registry.add(ComponentConfig::sensor("temp2").with_send_name("page0.temp2.val"));
        assert_eq!(
            registry.get(key).unwrap().variable_name_to_send(),
            "page0.temp2.val"
        );
    }

    #[test]
    fn test_find_by_name_filters_kind() {
        let mut registry = Registry::new();
        let s = registry.add(ComponentConfig::sensor("shared"));
        let _t = registry.add(ComponentConfig::text_sensor("shared"));

        let found = registry.find_by_name(ComponentKind::Sensor, "shared");
        assert_eq!(found, vec![s]);
    }

    #[test]
    fn test_wave_buffer_cap_drops_oldest() {
        let mut registry = Registry::new();
        let key = registry.add(ComponentConfig::waveform("wave", 2, 0).with_wave_max_length(4));
        let comp = registry.get_mut(key).unwrap();
        comp.push_wave_samples(&[1, 2, 3]);
        comp.push_wave_samples(&[4, 5, 6]);
        assert_eq!(comp.wave_buffer, vec![3, 4, 5, 6]);
    }
}
