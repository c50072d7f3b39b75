mod common;

use std::sync::Arc;
use std::time::Duration;

use comport_lib::{
    Handshake, IoError, LineConfiguration, PinState, PortSettings, SerialPort, VirtualBus,
};
use common::{init_logging, open_pair, open_pair_with};

const PATIENCE: Duration = Duration::from_secs(1);

#[test]
fn test_control_lines_require_open_port() {
    init_logging();
    let bus = VirtualBus::new();
    bus.create_pair("COM1", "COM2");
    let port = SerialPort::with_backend(Arc::new(bus));
    assert_eq!(port.set_dtr(true), Err(IoError::NotOpen));
    assert_eq!(port.set_rts(true), Err(IoError::NotOpen));
    assert_eq!(port.set_break(true), Err(IoError::NotOpen));
    assert_eq!(port.send_xoff(), Err(IoError::NotOpen));
    assert_eq!(port.pins(), Err(IoError::NotOpen));
    assert_eq!(port.break_state(), Err(IoError::NotOpen));
}

#[test]
fn test_lines_drive_peer_pins() {
    let pair = open_pair();
    let both = PinState::CTS | PinState::DSR | PinState::RLSD;
    assert!(pair.a.pins().unwrap().contains(both));

    pair.b.set_rts(false).unwrap();
    let pins = pair.a.pins().unwrap();
    assert!(!pins.contains(PinState::CTS));
    assert!(pins.contains(PinState::DSR));

    pair.b.set_dtr(false).unwrap();
    let pins = pair.a.pins().unwrap();
    assert!(!pins.intersects(PinState::DSR | PinState::RLSD));

    pair.b.set_rts(true).unwrap();
    pair.b.set_dtr(true).unwrap();
    assert!(pair.a.pins().unwrap().contains(both));
}

#[test]
fn test_line_commands_leave_configuration_alone() {
    let pair = open_pair();
    let before = pair.bus.line("COM1").unwrap().dcb();
    pair.a.set_dtr(false).unwrap();
    pair.a.set_rts(false).unwrap();
    let line = pair.bus.line("COM1").unwrap();
    assert!(!line.dtr());
    assert!(!line.rts());
    assert_eq!(line.dcb(), before);
}

#[test]
fn test_rts_owned_by_handshake() {
    let mut settings = PortSettings::default();
    settings.line = LineConfiguration::default().with_handshake(Handshake::RequestToSend);
    let pair = open_pair_with(settings, PortSettings::default());
    assert!(matches!(
        pair.a.set_rts(false),
        Err(IoError::InvalidOperation(_))
    ));
    // DTR is still ours to drive.
    pair.a.set_dtr(false).unwrap();
}

#[test]
fn test_ring_indicator() {
    let pair = open_pair();
    let line = pair.bus.line("COM1").unwrap();
    line.set_ring(true);
    assert!(pair.a.pins().unwrap().contains(PinState::RING));
    line.set_ring(false);
    assert!(!pair.a.pins().unwrap().contains(PinState::RING));
}

#[test]
fn test_break_tracks_state() {
    let pair = open_pair();
    assert_eq!(pair.a.break_state(), Ok(false));
    pair.a.set_break(true).unwrap();
    assert!(pair.bus.line("COM1").unwrap().break_active());
    assert_eq!(pair.a.break_state(), Ok(true));

    // Transmission is held while the line is in break.
    assert_eq!(
        pair.a.write(b"x", Duration::from_millis(50)),
        Err(IoError::TimedOut { transferred: 0 })
    );

    pair.a.set_break(false).unwrap();
    assert_eq!(pair.a.break_state(), Ok(false));
    assert_eq!(pair.a.write(b"x", PATIENCE), Ok(1));
}

#[test]
fn test_xoff_holds_writes_until_xon() {
    let pair = open_pair();
    pair.a.send_xoff().unwrap();
    assert_eq!(
        pair.a.write(b"held", Duration::from_millis(50)),
        Err(IoError::TimedOut { transferred: 0 })
    );
    let (_, status) = pair.a.clear_and_snapshot().unwrap();
    assert!(!status.hold.is_empty());

    pair.a.send_xon().unwrap();
    assert_eq!(pair.a.write(b"sent", PATIENCE), Ok(4));
    let mut buf = [0u8; 4];
    assert_eq!(pair.b.read(&mut buf, PATIENCE), Ok(4));
    assert_eq!(&buf, b"sent");
}
