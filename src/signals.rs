//! Control-signal (handshake line) types.
//!
//! Serial transports split their control lines into a writable subset
//! (DTR, RTS, break) and a read-only input subset (CTS, DSR, RI, DCD).
//! Hardware cannot read back the writable lines, so the session caches the
//! last written values and merges them with fresh input reads into a full
//! [`ControlSignals`] snapshot.

use serde::{Deserialize, Serialize};

/// A partial update of the writable control lines.
///
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalUpdate {
    pub data_terminal_ready: Option<bool>,
    pub request_to_send: Option<bool>,
    #[serde(rename = "break")]
    pub break_level: Option<bool>,
}

impl SignalUpdate {
    /// True if the update names no lines at all.
    pub fn is_empty(&self) -> bool {
        self.data_terminal_ready.is_none()
            && self.request_to_send.is_none()
            && self.break_level.is_none()
    }

    pub fn data_terminal_ready(value: bool) -> Self {
        Self {
            data_terminal_ready: Some(value),
            ..Self::default()
        }
    }

    pub fn request_to_send(value: bool) -> Self {
        Self {
            request_to_send: Some(value),
            ..Self::default()
        }
    }

    pub fn break_level(value: bool) -> Self {
        Self {
            break_level: Some(value),
            ..Self::default()
        }
    }
}

/// Current values of the writable lines, as last commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSignals {
    pub data_terminal_ready: bool,
    pub request_to_send: bool,
    pub break_level: bool,
}

impl Default for OutputSignals {
    // DTR and RTS are asserted when a port opens; break starts clear.
    fn default() -> Self {
        Self {
            data_terminal_ready: true,
            request_to_send: true,
            break_level: false,
        }
    }
}

impl OutputSignals {
    /// Merge a partial update into this snapshot.
    pub fn apply(&mut self, update: &SignalUpdate) {
        if let Some(dtr) = update.data_terminal_ready {
            self.data_terminal_ready = dtr;
        }
        if let Some(rts) = update.request_to_send {
            self.request_to_send = rts;
        }
        if let Some(brk) = update.break_level {
            self.break_level = brk;
        }
    }
}

/// Current values of the read-only input lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSignals {
    pub clear_to_send: bool,
    pub data_set_ready: bool,
    pub ring_indicator: bool,
    pub data_carrier_detect: bool,
}

/// Full control-signal snapshot: cached outputs plus fresh inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignals {
    pub data_terminal_ready: bool,
    pub request_to_send: bool,
    pub break_level: bool,
    pub clear_to_send: bool,
    pub data_set_ready: bool,
    pub ring_indicator: bool,
    pub data_carrier_detect: bool,
}

impl ControlSignals {
    /// Combine cached output values with fresh input readings.
    pub fn merge(outputs: OutputSignals, inputs: InputSignals) -> Self {
        Self {
            data_terminal_ready: outputs.data_terminal_ready,
            request_to_send: outputs.request_to_send,
            break_level: outputs.break_level,
            clear_to_send: inputs.clear_to_send,
            data_set_ready: inputs.data_set_ready,
            ring_indicator: inputs.ring_indicator,
            data_carrier_detect: inputs.data_carrier_detect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_update_leaves_others_unchanged() {
        let mut outputs = OutputSignals::default();
        assert!(outputs.data_terminal_ready);
        assert!(outputs.request_to_send);

        outputs.apply(&SignalUpdate::data_terminal_ready(false));
        assert!(!outputs.data_terminal_ready);
        assert!(outputs.request_to_send);
        assert!(!outputs.break_level);

        outputs.apply(&SignalUpdate::data_terminal_ready(true));
        assert!(outputs.data_terminal_ready);
        assert!(outputs.request_to_send);
        assert!(!outputs.break_level);
    }

    #[test]
    fn test_empty_update() {
        assert!(SignalUpdate::default().is_empty());
        assert!(!SignalUpdate::request_to_send(true).is_empty());
    }

    #[test]
    fn test_merge_snapshot() {
        let outputs = OutputSignals {
            data_terminal_ready: false,
            request_to_send: true,
            break_level: false,
        };
        let inputs = InputSignals {
            clear_to_send: true,
            ..InputSignals::default()
        };
        let snapshot = ControlSignals::merge(outputs, inputs);
        assert!(!snapshot.data_terminal_ready);
        assert!(snapshot.request_to_send);
        assert!(snapshot.clear_to_send);
        assert!(!snapshot.data_carrier_detect);
    }
}
