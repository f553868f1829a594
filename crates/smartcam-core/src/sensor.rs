/// Shared motion state with edge-triggered change detection.
///
/// Backed by a `watch` channel: `send_if_modified` runs the compare and the
/// update under the channel's lock, so concurrent writers cannot interleave
/// a read-modify-write and readers always see a whole value.

use tokio::sync::watch;

pub struct SensorState {
    motion: watch::Sender<bool>,
}

impl Default for SensorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorState {
    pub fn new() -> Self {
        let (motion, _) = watch::channel(false);
        Self { motion }
    }

    /// Feed a raw sensor payload. Returns true only when the parsed value is
    /// a transition; unparseable payloads leave the state untouched.
    pub fn set_motion(&self, raw: &str) -> bool {
        match parse_motion(raw) {
            Some(value) => self.store(value),
            None => false,
        }
    }

    /// Store an already-typed value with the same edge semantics.
    pub fn store(&self, value: bool) -> bool {
        self.motion.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    pub fn get_motion(&self) -> bool {
        *self.motion.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.motion.subscribe()
    }
}

/// Parse a boolean-ish payload.
///
/// Accepts integers (non-zero = motion), `true`/`false`, `on`/`off`,
/// `yes`/`no` in any case, and a JSON object carrying any of those under
/// `"value"`.
pub fn parse_motion(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(n) = raw.parse::<i64>() {
        return Some(n != 0);
    }

    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" => return Some(true),
        "false" | "off" | "no" => return Some(false),
        _ => {}
    }

    if raw.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        return match value.get("value")? {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => n.as_i64().map(|n| n != 0),
            serde_json::Value::String(s) if !s.trim_start().starts_with('{') => parse_motion(s),
            _ => None,
        };
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_value_reports_change_once() {
        let state = SensorState::new();
        assert!(state.set_motion("1"));
        assert!(!state.set_motion("1"));
        assert!(state.get_motion());
        assert!(state.set_motion("0"));
        assert!(!state.get_motion());
    }

    #[test]
    fn initial_false_is_not_a_transition() {
        let state = SensorState::new();
        assert!(!state.set_motion("0"));
        assert!(!state.get_motion());
    }

    #[test]
    fn garbage_leaves_state_untouched() {
        let state = SensorState::new();
        state.set_motion("1");
        assert!(!state.set_motion("motion!"));
        assert!(!state.set_motion(""));
        assert!(!state.set_motion("{\"other\": 0}"));
        assert!(state.get_motion());
    }

    #[test]
    fn parses_boolean_forms() {
        assert_eq!(parse_motion(" 1\n"), Some(true));
        assert_eq!(parse_motion("2"), Some(true));
        assert_eq!(parse_motion("0"), Some(false));
        assert_eq!(parse_motion("TRUE"), Some(true));
        assert_eq!(parse_motion("off"), Some(false));
        assert_eq!(parse_motion("{\"value\": 1}"), Some(true));
        assert_eq!(parse_motion("{\"value\": false}"), Some(false));
        assert_eq!(parse_motion("{\"value\": \"on\"}"), Some(true));
        assert_eq!(parse_motion("1.5"), None);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let state = SensorState::new();
        let mut rx = state.subscribe();
        state.set_motion("1");
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
