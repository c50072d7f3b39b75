mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use comport_lib::config::RETURN_IMMEDIATELY;
use comport_lib::device::{SerialDevice, DCB_F_NULL};
use comport_lib::{
    Backend, ConfigError, DeviceError, DtrMode, Handshake, LineConfiguration, OpenError, Parity,
    PortSettings, PortState, RtsMode, SerialDeviceInfo, SerialPort, StopBits, TimeoutSettings,
    VirtualBus,
};
use common::{init_logging, open_pair, wait_until};

fn single_port() -> (VirtualBus, SerialPort) {
    init_logging();
    let bus = VirtualBus::new();
    bus.create_pair("COM1", "COM2");
    let port = SerialPort::with_backend(Arc::new(bus.clone()));
    (bus, port)
}

#[test]
fn test_configuration_reaches_device() {
    let pair = open_pair();
    let mut config = LineConfiguration::new(57_600);
    config.data_bits = 7;
    config.parity = Parity::Even;
    config.stop_bits = StopBits::Two;
    pair.a.set_configuration(config.clone()).unwrap();

    assert_eq!(pair.a.configuration(), config);
    assert_eq!(pair.a.applied_configuration().unwrap(), config);
    let dcb = pair.bus.line("COM1").unwrap().dcb();
    assert_eq!(dcb.baud_rate, 57_600);
    assert_eq!(dcb.byte_size, 7);
}

#[test]
fn test_unsupported_baud_rate_leaves_previous_configuration() {
    let pair = open_pair();
    let line = pair.bus.line("COM1").unwrap();
    line.set_max_baud(115_200);
    pair.a.set_configuration(LineConfiguration::new(115_200)).unwrap();

    let err = pair
        .a
        .set_configuration(LineConfiguration::new(230_400))
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::UnsupportedBaudRate {
            requested: 230_400,
            maximum: 115_200
        }
    );
    assert_eq!(line.dcb().baud_rate, 115_200);
    assert_eq!(pair.a.configuration().baud_rate, 115_200);
    assert_eq!(pair.a.applied_configuration().unwrap().baud_rate, 115_200);
}

#[test]
fn test_invalid_configuration_rejected() {
    let pair = open_pair();
    let mut config = LineConfiguration::default();
    config.data_bits = 4;
    assert!(matches!(
        pair.a.set_configuration(config),
        Err(ConfigError::InvalidParameter(_))
    ));

    let mut config = LineConfiguration::default();
    config.stop_bits = StopBits::OnePointFive;
    assert!(pair.a.set_configuration(config).is_err());
    assert_eq!(pair.a.configuration(), LineConfiguration::default());
}

#[test]
fn test_private_dcb_bits_survive_reconfiguration() {
    let pair = open_pair();
    let line = pair.bus.line("COM1").unwrap();
    line.set_private_dcb_bits(0x8000_0000);
    pair.a
        .set_configuration(LineConfiguration::new(19_200).with_handshake(Handshake::XOnXOff))
        .unwrap();
    assert_eq!(line.dcb().flags & 0x8000_0000, 0x8000_0000);
}

#[test]
fn test_discard_null_is_applied() {
    let pair = open_pair();
    let mut config = LineConfiguration::default();
    config.discard_null = true;
    pair.b.set_configuration(config).unwrap();
    assert!(pair.bus.line("COM2").unwrap().dcb().flags & DCB_F_NULL != 0);

    pair.a.write(&[b'a', 0, b'b'], Duration::from_secs(1)).unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(pair.b.read(&mut buf, Duration::from_secs(1)), Ok(2));
    assert_eq!(&buf, b"ab");
}

#[test]
fn test_configuration_buffered_while_closed() {
    let (bus, port) = single_port();
    port.set_configuration(LineConfiguration::new(38_400)).unwrap();
    assert_eq!(port.applied_configuration(), Err(ConfigError::NotOpen));

    port.open("COM1").unwrap();
    assert_eq!(bus.line("COM1").unwrap().dcb().baud_rate, 38_400);
    assert_eq!(port.applied_configuration().unwrap().baud_rate, 38_400);
}

#[test]
fn test_open_rejects_baud_over_device_maximum() {
    let (bus, port) = single_port();
    bus.line("COM1").unwrap().set_max_baud(9_600);
    port.set_configuration(LineConfiguration::new(115_200)).unwrap();
    assert!(matches!(
        port.open("COM1"),
        Err(OpenError::InvalidParameter(_))
    ));
    assert!(!port.is_open());
    // The failed open released the device.
    assert!(!bus.line("COM1").unwrap().is_open());
}

#[test]
fn test_timeouts_reach_device() {
    let pair = open_pair();
    let timeouts = TimeoutSettings {
        read_interval_ms: 20,
        read_total_multiplier_ms: 2,
        read_total_constant_ms: 100,
        write_total_multiplier_ms: 1,
        write_total_constant_ms: 50,
    };
    pair.a.set_timeouts(timeouts).unwrap();
    assert_eq!(pair.a.timeouts(), timeouts);
    let native = pair.bus.line("COM1").unwrap().timeouts();
    assert_eq!(native.read_interval_timeout, 20);
    assert_eq!(native.read_total_timeout_constant, 100);
    assert_eq!(native.write_total_timeout_constant, 50);
}

#[test]
fn test_update_timeouts_keeps_other_fields() {
    let pair = open_pair();
    pair.a
        .set_timeouts(TimeoutSettings {
            write_total_constant_ms: 250,
            ..TimeoutSettings::default()
        })
        .unwrap();
    pair.a
        .update_timeouts(|t| t.read_interval_ms = RETURN_IMMEDIATELY)
        .unwrap();

    let timeouts = pair.a.timeouts();
    assert!(timeouts.is_immediate());
    assert_eq!(timeouts.write_total_constant_ms, 250);
    let native = pair.bus.line("COM1").unwrap().timeouts();
    assert_eq!(native.read_interval_timeout, RETURN_IMMEDIATELY);
    assert_eq!(native.write_total_timeout_constant, 250);
}

#[test]
fn test_settings_file_round_trip_opens_port() {
    let path = std::env::temp_dir().join(format!(
        "comport-config-test-{}.json",
        std::process::id()
    ));
    let mut settings = PortSettings::default();
    settings.line = LineConfiguration::new(4_800);
    settings.timeouts = TimeoutSettings::first_byte_within(75);
    settings.save(&path).unwrap();

    let loaded = PortSettings::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(loaded, settings);

    let (bus, port) = single_port();
    port.set_settings(loaded).unwrap();
    port.open("COM1").unwrap();
    let line = bus.line("COM1").unwrap();
    assert_eq!(line.dcb().baud_rate, 4_800);
    assert_eq!(line.timeouts().read_total_timeout_constant, 75);
}

#[test]
fn test_set_settings_rejects_zero_threshold() {
    let (_bus, port) = single_port();
    let mut settings = PortSettings::default();
    settings.received_bytes_threshold = 0;
    assert!(matches!(
        port.set_settings(settings),
        Err(ConfigError::InvalidParameter(_))
    ));
    assert_eq!(port.settings(), PortSettings::default());
}

/// Virtual bus whose devices take a while to open.
struct SlowBackend {
    bus: VirtualBus,
    delay: Duration,
}

impl Backend for SlowBackend {
    fn open(&self, name: &str) -> Result<Box<dyn SerialDevice>, DeviceError> {
        thread::sleep(self.delay);
        self.bus.open(name)
    }

    fn enumerate(&self) -> Result<Vec<SerialDeviceInfo>, DeviceError> {
        self.bus.enumerate()
    }
}

#[test]
fn test_settings_changed_during_open_reach_device() {
    init_logging();
    let bus = VirtualBus::new();
    bus.create_pair("COM1", "COM2");
    let port = Arc::new(SerialPort::with_backend(Arc::new(SlowBackend {
        bus: bus.clone(),
        delay: Duration::from_millis(200),
    })));

    let opener = {
        let port = Arc::clone(&port);
        thread::spawn(move || port.open("COM1"))
    };
    assert!(wait_until(Duration::from_secs(2), || port.state() == PortState::Opening));
    port.set_configuration(LineConfiguration::new(57_600)).unwrap();
    port.set_timeouts(TimeoutSettings::first_byte_within(250)).unwrap();
    opener.join().unwrap().unwrap();

    assert_eq!(port.configuration().baud_rate, 57_600);
    assert_eq!(port.applied_configuration().unwrap().baud_rate, 57_600);
    let line = bus.line("COM1").unwrap();
    assert_eq!(line.dcb().baud_rate, 57_600);
    assert_eq!(line.timeouts().read_total_timeout_constant, 250);
}

#[test]
fn test_rejected_change_during_open_is_dropped() {
    init_logging();
    let bus = VirtualBus::new();
    bus.create_pair("COM1", "COM2");
    bus.line("COM1").unwrap().set_max_baud(115_200);
    let port = Arc::new(SerialPort::with_backend(Arc::new(SlowBackend {
        bus: bus.clone(),
        delay: Duration::from_millis(200),
    })));

    let opener = {
        let port = Arc::clone(&port);
        thread::spawn(move || port.open("COM1"))
    };
    assert!(wait_until(Duration::from_secs(2), || port.state() == PortState::Opening));
    port.set_configuration(LineConfiguration::new(230_400)).unwrap();
    opener.join().unwrap().unwrap();

    // Stored settings keep describing the device.
    assert_eq!(port.configuration().baud_rate, 9600);
    assert_eq!(port.applied_configuration().unwrap().baud_rate, 9600);
}

#[test]
fn test_every_line_configuration_round_trips() {
    let (_bus, port) = single_port();
    port.open("COM1").unwrap();

    let parities = [Parity::None, Parity::Odd, Parity::Even, Parity::Mark, Parity::Space];
    let stops = [StopBits::One, StopBits::OnePointFive, StopBits::Two];
    let dtr_modes = [DtrMode::Disabled, DtrMode::Enabled, DtrMode::Handshake];
    let rts_modes = [RtsMode::Disabled, RtsMode::Enabled, RtsMode::Handshake, RtsMode::Toggle];

    let mut applied = 0;
    for data_bits in 5..=8u8 {
        for parity in parities {
            for stop_bits in stops {
                for dtr_mode in dtr_modes {
                    for rts_mode in rts_modes {
                        for switches in 0..32u8 {
                            let config = LineConfiguration {
                                baud_rate: 19_200,
                                data_bits,
                                parity,
                                stop_bits,
                                dtr_mode,
                                rts_mode,
                                cts_flow: switches & 1 != 0,
                                dsr_flow: switches & 2 != 0,
                                xon_xoff_flow: switches & 4 != 0,
                                discard_null: switches & 8 != 0,
                                error_char: if switches & 16 != 0 { b'?' } else { 0 },
                                ..Default::default()
                            };
                            if config.validate().is_err() {
                                continue;
                            }
                            port.set_configuration(config.clone())
                                .unwrap_or_else(|e| panic!("{:?} rejected: {}", config, e));
                            assert_eq!(port.applied_configuration().unwrap(), config);
                            applied += 1;
                        }
                    }
                }
            }
        }
    }
    // 5 data bits allow 1 and 1.5 stop bits, 6 to 8 allow 1 and 2.
    assert_eq!(applied, 4 * 2 * 5 * 3 * 4 * 32);
}
