use validator::Validate;

use super::{ChannelSettings, OptimizerKind, ProtocolSettings, Settings};
use crate::channel::{PartyId, Role};

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            key_length: 1024,
            max_iter: 30,
            tol: 1e-4,
            n_iter_no_change: 3,
            batch_size: 0,
            learning_rate: 0.15,
            optimizer: OptimizerKind::Sgd,
            momentum: 0.9,
            alpha: 0.0001,
            seed: None,
        }
    }
}

#[test]
fn test_settings_new() {
    assert!(Settings::new("configs/arbiter.toml").is_ok());
    assert!(Settings::new("configs/guest.toml").is_ok());
    assert!(Settings::new("configs/host.toml").is_ok());
    assert!(Settings::new("").is_err());
}

#[test]
fn test_settings_parties() {
    let settings = Settings::new("configs/guest.toml").unwrap();
    let guest = PartyId::new(Role::Guest, 0);
    assert_eq!(settings.party(), guest);
    assert_eq!(settings.local_endpoint().unwrap().port, 9372);

    let remotes = settings.remote_endpoints();
    assert_eq!(remotes.len(), 2);
    assert!(remotes.iter().all(|e| e.party() != guest));
    assert_eq!(settings.channel, ChannelSettings::default());
    assert!(settings.data.path.is_some());
}

#[test]
fn test_validate_settings() {
    let mut settings = Settings::new("configs/host.toml").unwrap();
    settings.data.path = None;
    assert!(settings.validate().is_err());

    let mut settings = Settings::new("configs/host.toml").unwrap();
    let duplicate = settings.endpoints[2].clone();
    settings.endpoints.push(duplicate);
    assert!(settings.validate().is_err());

    let mut settings = Settings::new("configs/arbiter.toml").unwrap();
    settings.endpoints.retain(|e| e.role != Role::Guest);
    assert!(settings.validate().is_err());

    let mut settings = Settings::new("configs/arbiter.toml").unwrap();
    settings.party.index = 1;
    assert!(settings.validate().is_err());

    let mut settings = Settings::new("configs/arbiter.toml").unwrap();
    settings.endpoints.retain(|e| e.role != Role::Host);
    assert!(settings.validate().is_err());

    // a second guest is not supported
    let mut settings = Settings::new("configs/arbiter.toml").unwrap();
    let mut second_guest = settings.endpoints[1].clone();
    second_guest.index = 1;
    settings.endpoints.push(second_guest);
    assert!(settings.validate().is_err());

    // 2 * 32 * 10^12 * 10^32 needs 153 bits
    let mut settings = Settings::new("configs/arbiter.toml").unwrap();
    settings.protocol.key_length = 128;
    settings.mask.bound_type = crate::mask::BoundType::B6;
    settings.mask.precision = 16;
    assert!(settings.validate().is_err());
    settings.mask.bound_type = crate::mask::BoundType::B0;
    settings.mask.precision = 4;
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_channel() {
    assert!(ChannelSettings::default().validate().is_ok());
    assert!(ChannelSettings {
        poll_interval: 0,
        ..ChannelSettings::default()
    }
    .validate()
    .is_err());
    assert!(ChannelSettings {
        send_workers: 0,
        ..ChannelSettings::default()
    }
    .validate()
    .is_err());
}

#[test]
fn test_validate_protocol() {
    assert!(ProtocolSettings::default().validate_protocol().is_ok());
    assert!(ProtocolSettings {
        key_length: 64,
        ..ProtocolSettings::default()
    }
    .validate_protocol()
    .is_err());
    assert!(ProtocolSettings {
        key_length: 1023,
        ..ProtocolSettings::default()
    }
    .validate_protocol()
    .is_err());
    assert!(ProtocolSettings {
        learning_rate: 0.,
        ..ProtocolSettings::default()
    }
    .validate_protocol()
    .is_err());
    assert!(ProtocolSettings {
        tol: f64::NAN,
        ..ProtocolSettings::default()
    }
    .validate_protocol()
    .is_err());
    assert!(ProtocolSettings {
        momentum: 1.,
        ..ProtocolSettings::default()
    }
    .validate_protocol()
    .is_err());
    assert!(ProtocolSettings {
        max_iter: 0,
        ..ProtocolSettings::default()
    }
    .validate()
    .is_err());
}
