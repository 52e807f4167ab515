//! Outbound command formatting
//!
//! Commands are ASCII text with comma-separated arguments, terminated by three
//! 0xFF bytes. This module is pure formatting; gating (setup/sleep) lives in
//! the engine.

use super::FRAME_TERMINATOR;

/// Serialize a command string with its terminator
pub fn encode(command: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(command.len() + FRAME_TERMINATOR.len());
    out.extend_from_slice(command.as_bytes());
    out.extend_from_slice(&FRAME_TERMINATOR);
    out
}

/// `get <variable>` — request a variable's value
pub fn get_value(variable: &str) -> String {
    format!("get {variable}")
}

/// Numeric assignment: `<variable>=<value>`
pub fn set_int(variable: &str, value: i32) -> String {
    format!("{variable}={value}")
}

/// Quoted string assignment: `<variable>="<value>"`
pub fn set_text(variable: &str, value: &str) -> String {
    format!("{variable}=\"{value}\"")
}

/// `addt <component>,<channel>,<len>` — announce a waveform transfer
pub fn add_waveform_data(component_id: u8, channel_id: u8, len: usize) -> String {
    format!("addt {component_id},{channel_id},{len}")
}

/// `page <name>` — switch the active page
pub fn goto_page(page: &str) -> String {
    format!("page {page}")
}

/// Backlight brightness in percent; `dims` also persists it to device flash
pub fn backlight(brightness_pct: u8, persist: bool) -> String {
    let pct = brightness_pct.min(100);
    if persist {
        format!("dims={pct}")
    } else {
        format!("dim={pct}")
    }
}

/// `vis <component>,<0|1>` — show or hide a component
pub fn visibility(component: &str, visible: bool) -> String {
    format!("vis {component},{}", u8::from(visible))
}

/// `sleep=<0|1>` — enter or leave sleep mode
pub fn sleep(enter: bool) -> String {
    format!("sleep={}", u8::from(enter))
}

/// `thsp=<seconds>` — sleep after this many seconds without touch (0 disables)
pub fn touch_sleep_timeout(seconds: u16) -> String {
    format!("thsp={seconds}")
}

/// `thup=<0|1>` — wake on touch while sleeping
pub fn auto_wake_on_touch(enabled: bool) -> String {
    format!("thup={}", u8::from(enabled))
}

/// `wup=<page>` — page shown on wake-up
pub fn wake_up_page(page: u8) -> String {
    format!("wup={page}")
}

/// `whmi-wris <size>,<baud>,1` — firmware upload announce
pub fn upload_announce(total_size: u64, baud_rate: u32) -> String {
    format!("whmi-wris {total_size},{baud_rate},1")
}

/// Device soft reset
pub const SOFT_RESET: &str = "rest";

/// Result notification level: report both failures and successes
pub const ACK_ALWAYS: &str = "bkcmd=3";

/// Result notification level: no serial acks (used transiently during setup)
pub const ACK_OFF: &str = "bkcmd=0";

/// Whether a command may reach the display while it sleeps.
///
/// The sleeping interpreter only honors sleep/wake control, backlight and
/// visibility commands; anything else is dropped by the device, so the engine
/// defers it instead of writing it.
pub fn is_sleep_safe(command: &str) -> bool {
    command.starts_with("sleep=")
        || command.starts_with("dim=")
        || command.starts_with("dims=")
        || command.starts_with("vis ")
        || command.starts_with("thup=")
        || command.starts_with("wup=")
        || command == SOFT_RESET
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_appends_terminator() {
        assert_eq!(
            encode("page 0"),
            vec![b'p', b'a', b'g', b'e', b' ', b'0', 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_assignments() {
        assert_eq!(set_int("temp.val", -4), "temp.val=-4");
        assert_eq!(set_text("label.txt", "on"), "label.txt=\"on\"");
        assert_eq!(get_value("temp.val"), "get temp.val");
        assert_eq!(add_waveform_data(2, 0, 128), "addt 2,0,128");
    }

    #[test]
    fn test_backlight_clamps_percentage() {
        assert_eq!(backlight(150, false), "dim=100");
        assert_eq!(backlight(30, true), "dims=30");
    }

    #[test]
    fn test_sleep_safe_classification() {
        assert!(is_sleep_safe("sleep=0"));
        assert!(is_sleep_safe("dim=100"));
        assert!(is_sleep_safe("vis btn0,1"));
        assert!(is_sleep_safe("rest"));
        assert!(!is_sleep_safe("temp.val=42"));
        assert!(!is_sleep_safe("get temp.val"));
        assert!(!is_sleep_safe("page 0"));
    }

    #[test]
    fn test_upload_announce() {
        assert_eq!(upload_announce(1048576, 115200), "whmi-wris 1048576,115200,1");
    }
}
