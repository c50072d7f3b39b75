//! Translation between `LineConfiguration` and the native DCB.
//!
//! The DCB flag word is packed and unpacked here and nowhere else on the
//! configuration path. Applying a configuration is a read-modify-write: only
//! fields implied by the symbolic settings change, everything else in the
//! block (driver-private bits, XON/XOFF limits, DSR sensitivity) is written
//! back as the driver reported it.

use super::{DtrMode, LineConfiguration, Parity, RtsMode, StopBits};
use crate::device::native::*;
use crate::device::{DeviceError, DeviceHandle};
use crate::serial::ConfigError;

fn set_flag(flags: &mut u32, flag: u32, on: bool) {
    if on {
        *flags |= flag;
    } else {
        *flags &= !flag;
    }
}

fn set_field(flags: &mut u32, mask: u32, shift: u32, value: u32) {
    *flags = (*flags & !mask) | ((value << shift) & mask);
}

/// Writes the symbolic settings into `dcb`, leaving unrelated fields intact.
pub fn encode(config: &LineConfiguration, dcb: &mut Dcb) {
    dcb.baud_rate = config.baud_rate;
    dcb.byte_size = config.data_bits;
    dcb.parity = match config.parity {
        Parity::None => NOPARITY,
        Parity::Odd => ODDPARITY,
        Parity::Even => EVENPARITY,
        Parity::Mark => MARKPARITY,
        Parity::Space => SPACEPARITY,
    };
    dcb.stop_bits = match config.stop_bits {
        StopBits::One => ONESTOPBIT,
        StopBits::OnePointFive => ONE5STOPBITS,
        StopBits::Two => TWOSTOPBITS,
    };
    dcb.xon_char = config.xon_char;
    dcb.xoff_char = config.xoff_char;
    dcb.error_char = config.error_char;
    dcb.eof_char = config.eof_char;
    dcb.evt_char = config.event_char;

    let dtr = match config.dtr_mode {
        DtrMode::Disabled => DTR_CONTROL_DISABLE,
        DtrMode::Enabled => DTR_CONTROL_ENABLE,
        DtrMode::Handshake => DTR_CONTROL_HANDSHAKE,
    };
    let rts = match config.rts_mode {
        RtsMode::Disabled => RTS_CONTROL_DISABLE,
        RtsMode::Enabled => RTS_CONTROL_ENABLE,
        RtsMode::Handshake => RTS_CONTROL_HANDSHAKE,
        RtsMode::Toggle => RTS_CONTROL_TOGGLE,
    };

    let flags = &mut dcb.flags;
    set_flag(flags, DCB_F_BINARY, true);
    set_flag(flags, DCB_F_PARITY, config.parity != Parity::None);
    set_flag(flags, DCB_F_OUTX_CTS_FLOW, config.cts_flow);
    set_flag(flags, DCB_F_OUTX_DSR_FLOW, config.dsr_flow);
    set_field(flags, DCB_DTR_CONTROL_MASK, DCB_DTR_CONTROL_SHIFT, dtr);
    set_field(flags, DCB_RTS_CONTROL_MASK, DCB_RTS_CONTROL_SHIFT, rts);
    set_flag(flags, DCB_F_OUTX, config.xon_xoff_flow);
    set_flag(flags, DCB_F_INX, config.xon_xoff_flow);
    set_flag(flags, DCB_F_NULL, config.discard_null);
    // Replacement only happens for bytes with parity errors.
    set_flag(
        flags,
        DCB_F_ERROR_CHAR,
        config.parity != Parity::None && config.error_char != 0,
    );
    // A latched line error must never suspend I/O until it is cleared.
    set_flag(flags, DCB_F_ABORT_ON_ERROR, false);
}

/// Reads the symbolic settings back out of a DCB.
pub fn decode(dcb: &Dcb) -> LineConfiguration {
    LineConfiguration {
        baud_rate: dcb.baud_rate,
        data_bits: dcb.byte_size,
        parity: match dcb.parity {
            ODDPARITY => Parity::Odd,
            EVENPARITY => Parity::Even,
            MARKPARITY => Parity::Mark,
            SPACEPARITY => Parity::Space,
            _ => Parity::None,
        },
        stop_bits: match dcb.stop_bits {
            ONE5STOPBITS => StopBits::OnePointFive,
            TWOSTOPBITS => StopBits::Two,
            _ => StopBits::One,
        },
        dtr_mode: match dcb.dtr_control() {
            DTR_CONTROL_DISABLE => DtrMode::Disabled,
            DTR_CONTROL_ENABLE => DtrMode::Enabled,
            _ => DtrMode::Handshake,
        },
        rts_mode: match dcb.rts_control() {
            RTS_CONTROL_DISABLE => RtsMode::Disabled,
            RTS_CONTROL_ENABLE => RtsMode::Enabled,
            RTS_CONTROL_HANDSHAKE => RtsMode::Handshake,
            _ => RtsMode::Toggle,
        },
        xon_char: dcb.xon_char,
        xoff_char: dcb.xoff_char,
        error_char: dcb.error_char,
        eof_char: dcb.eof_char,
        event_char: dcb.evt_char,
        cts_flow: dcb.has(DCB_F_OUTX_CTS_FLOW),
        dsr_flow: dcb.has(DCB_F_OUTX_DSR_FLOW),
        xon_xoff_flow: dcb.has(DCB_F_OUTX) && dcb.has(DCB_F_INX),
        discard_null: dcb.has(DCB_F_NULL),
    }
}

/// Pushes `config` to the device in one DCB write.
///
/// The baud rate is checked against the device ceiling before anything is
/// written, so a rejected configuration leaves the previous one in effect.
pub fn apply_configuration(
    handle: &DeviceHandle,
    config: &LineConfiguration,
) -> Result<(), ConfigError> {
    config.validate()?;
    let _exclusive = handle.configure();
    handle.ensure_live()?;
    let device = handle.device();

    let properties = device.properties()?;
    if properties.max_baud != 0 && config.baud_rate > properties.max_baud {
        return Err(ConfigError::UnsupportedBaudRate {
            requested: config.baud_rate,
            maximum: properties.max_baud,
        });
    }

    let mut dcb = device.get_dcb()?;
    encode(config, &mut dcb);
    device.set_dcb(&dcb)?;
    log::debug!(
        "{}: applied {} baud, {} data bits, {:?} parity, {:?} stop bits",
        handle.name(),
        config.baud_rate,
        config.data_bits,
        config.parity,
        config.stop_bits
    );
    Ok(())
}

/// The configuration currently in effect on the device.
pub fn read_configuration(handle: &DeviceHandle) -> Result<LineConfiguration, DeviceError> {
    handle.ensure_live()?;
    Ok(decode(&handle.device().get_dcb()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Handshake;

    const DRIVER_BITS: u32 = 0xABCD_0000;

    fn driver_dcb() -> Dcb {
        Dcb {
            baud_rate: 9600,
            flags: DRIVER_BITS
                | DCB_F_BINARY
                | DCB_F_DSR_SENSITIVITY
                | DCB_F_TX_CONTINUE_ON_XOFF
                | DCB_F_ABORT_ON_ERROR,
            xon_lim: 1234,
            xoff_lim: 321,
            byte_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_preserves_unrelated_bits() {
        let mut dcb = driver_dcb();
        let config = LineConfiguration::new(115_200).with_handshake(Handshake::RequestToSend);
        encode(&config, &mut dcb);

        assert_eq!(dcb.flags & 0xFFFF_8000, DRIVER_BITS);
        assert!(dcb.has(DCB_F_DSR_SENSITIVITY));
        assert!(dcb.has(DCB_F_TX_CONTINUE_ON_XOFF));
        assert!(!dcb.has(DCB_F_ABORT_ON_ERROR));
        assert_eq!(dcb.xon_lim, 1234);
        assert_eq!(dcb.xoff_lim, 321);
        assert_eq!(dcb.baud_rate, 115_200);
        assert!(dcb.has(DCB_F_OUTX_CTS_FLOW));
        assert_eq!(dcb.rts_control(), RTS_CONTROL_HANDSHAKE);
    }

    #[test]
    fn test_parity_flag_follows_parity() {
        let mut dcb = driver_dcb();
        let mut config = LineConfiguration::default();
        config.parity = Parity::Even;
        encode(&config, &mut dcb);
        assert!(dcb.has(DCB_F_PARITY));
        assert_eq!(dcb.parity, EVENPARITY);

        config.parity = Parity::None;
        encode(&config, &mut dcb);
        assert!(!dcb.has(DCB_F_PARITY));
        assert_eq!(dcb.parity, NOPARITY);
    }

    #[test]
    fn test_error_char_replacement_needs_parity() {
        let mut dcb = driver_dcb();
        let mut config = LineConfiguration::default();
        config.error_char = b'?';
        encode(&config, &mut dcb);
        assert!(!dcb.has(DCB_F_ERROR_CHAR));
        assert_eq!(dcb.error_char, b'?');

        config.parity = Parity::Odd;
        encode(&config, &mut dcb);
        assert!(dcb.has(DCB_F_ERROR_CHAR));

        config.error_char = 0;
        encode(&config, &mut dcb);
        assert!(!dcb.has(DCB_F_ERROR_CHAR));
    }

    #[test]
    fn test_decode_reads_back_encoded_settings() {
        let config = LineConfiguration {
            baud_rate: 57_600,
            data_bits: 5,
            parity: Parity::Mark,
            stop_bits: StopBits::OnePointFive,
            dtr_mode: DtrMode::Handshake,
            rts_mode: RtsMode::Toggle,
            event_char: b'\n',
            dsr_flow: true,
            discard_null: true,
            ..Default::default()
        }
        .with_handshake(Handshake::XOnXOff);

        let mut dcb = driver_dcb();
        encode(&config, &mut dcb);
        assert_eq!(decode(&dcb), config);
    }
}
