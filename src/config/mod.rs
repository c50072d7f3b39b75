pub mod dcb;
pub mod settings;
pub mod timeouts;

pub use dcb::{apply_configuration, read_configuration};
pub use settings::{PortSettings, SettingsError};
pub use timeouts::{apply_timeouts, read_timeouts, TimeoutSettings, RETURN_IMMEDIATELY};

use serde::{Deserialize, Serialize};

use crate::serial::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

/// How the DTR line is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtrMode {
    Disabled,
    #[default]
    Enabled,
    Handshake,
}

/// How the RTS line is driven. `Toggle` asserts RTS only while bytes are
/// being transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtsMode {
    Disabled,
    #[default]
    Enabled,
    Handshake,
    Toggle,
}

/// Common flow-control presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handshake {
    #[default]
    None,
    XOnXOff,
    RequestToSend,
    RequestToSendXOnXOff,
}

/// Symbolic line settings pushed to the device as one DCB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfiguration {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub dtr_mode: DtrMode,
    pub rts_mode: RtsMode,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub error_char: u8,
    pub eof_char: u8,
    pub event_char: u8,
    /// Hold transmission while CTS is low.
    pub cts_flow: bool,
    /// Hold transmission while DSR is low.
    pub dsr_flow: bool,
    pub xon_xoff_flow: bool,
    /// Drop received NUL bytes.
    pub discard_null: bool,
}

impl Default for LineConfiguration {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            dtr_mode: DtrMode::Enabled,
            rts_mode: RtsMode::Enabled,
            xon_char: 0x11,
            xoff_char: 0x13,
            error_char: 0,
            eof_char: 0x1A,
            event_char: 0x1A,
            cts_flow: false,
            dsr_flow: false,
            xon_xoff_flow: false,
            discard_null: false,
        }
    }
}

impl LineConfiguration {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Checks the rules that hold regardless of the device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidParameter(
                "baud rate must be positive".into(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::InvalidParameter(format!(
                "data bits must be 5 to 8, got {}",
                self.data_bits
            )));
        }
        match (self.stop_bits, self.data_bits) {
            (StopBits::OnePointFive, bits) if bits != 5 => {
                return Err(ConfigError::InvalidParameter(
                    "1.5 stop bits require 5 data bits".into(),
                ))
            }
            (StopBits::Two, 5) => {
                return Err(ConfigError::InvalidParameter(
                    "2 stop bits cannot be used with 5 data bits".into(),
                ))
            }
            _ => {}
        }
        if self.xon_xoff_flow && self.xon_char == self.xoff_char {
            return Err(ConfigError::InvalidParameter(
                "XON and XOFF characters must differ".into(),
            ));
        }
        Ok(())
    }

    /// Applies a flow-control preset, leaving unrelated fields alone.
    pub fn set_handshake(&mut self, handshake: Handshake) {
        let (hardware, software) = match handshake {
            Handshake::None => (false, false),
            Handshake::XOnXOff => (false, true),
            Handshake::RequestToSend => (true, false),
            Handshake::RequestToSendXOnXOff => (true, true),
        };
        self.cts_flow = hardware;
        self.xon_xoff_flow = software;
        if hardware {
            self.rts_mode = RtsMode::Handshake;
        } else if self.rts_mode == RtsMode::Handshake {
            self.rts_mode = RtsMode::Enabled;
        }
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.set_handshake(handshake);
        self
    }

    pub fn handshake(&self) -> Handshake {
        match (self.cts_flow, self.xon_xoff_flow) {
            (false, false) => Handshake::None,
            (false, true) => Handshake::XOnXOff,
            (true, false) => Handshake::RequestToSend,
            (true, true) => Handshake::RequestToSendXOnXOff,
        }
    }
}
