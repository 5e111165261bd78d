//! Session configuration with serde support and validated defaults.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};

/// Default baud rate for serial sessions (9600 bps).
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default capacity of each channel's internal byte buffer (64 KiB).
///
/// A full buffer suspends the producing side until the consumer drains it.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Configuration for opening a port session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Baud rate (bits per second). Must be positive.
    #[serde(default = "default_baud")]
    pub baud_rate: u32,

    /// Number of data bits per character.
    #[serde(default = "default_data_bits")]
    pub data_bits: DataBits,

    /// Parity checking mode.
    #[serde(default = "default_parity")]
    pub parity: Parity,

    /// Number of stop bits.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: StopBits,

    /// Flow control mode.
    #[serde(default = "default_flow_control")]
    pub flow_control: FlowControl,

    /// Capacity hint for each channel's internal buffer, in bytes.
    #[serde(default)]
    pub buffer_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            buffer_capacity: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with the given baud rate and 8N1 framing.
    pub fn with_baud(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// Validate the configuration before opening.
    pub fn validate(&self) -> SessionResult<()> {
        if self.baud_rate == 0 {
            return Err(SessionError::invalid_config("baud rate must be positive"));
        }
        if self.buffer_capacity == Some(0) {
            return Err(SessionError::invalid_config(
                "buffer capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Effective channel buffer capacity in bytes.
    pub fn effective_capacity(&self) -> usize {
        self.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY)
    }
}

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_data_bits() -> DataBits {
    DataBits::Eight
}

fn default_parity() -> Parity {
    Parity::None
}

fn default_stop_bits() -> StopBits {
    StopBits::One
}

fn default_flow_control() -> FlowControl {
    FlowControl::None
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Flow control modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = SessionConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);
        assert_eq!(config.effective_capacity(), DEFAULT_BUFFER_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_baud_rejected() {
        let config = SessionConfig::with_baud(0);
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SessionConfig {
            buffer_capacity: Some(0),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_serde_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"baud_rate": 115200}"#).unwrap();
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.buffer_capacity, None);
    }

    #[test]
    fn test_data_bits_conversion() {
        let bits: serialport::DataBits = DataBits::Seven.into();
        assert_eq!(bits, serialport::DataBits::Seven);
    }

    #[test]
    fn test_flow_control_conversion() {
        let flow: serialport::FlowControl = FlowControl::Hardware.into();
        assert_eq!(flow, serialport::FlowControl::Hardware);
    }
}
