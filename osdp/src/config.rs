//! Bus and peripheral configuration

use std::sync::Arc;
use std::time::Duration;

use osdp_core::constants::{DEFAULT_REPLY_TIMEOUT, DEFAULT_SECURE_CHANNEL_KEY};
use osdp_core::{Key, PeripheralOptions};
use osdp_types::{Capability, CapabilityFunction, DeviceCapabilities, DeviceIdentification};
use parking_lot::RwLock;
use tracing::debug;

/// Settings for one bus (one physical connection)
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// How long to wait for a reply before counting the command as lost
    pub reply_timeout: Duration,

    /// Pause after every device on the bus has had its turn
    pub poll_interval: Duration,

    /// Wait between attempts to reopen a failed transport
    pub reconnect_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            poll_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl BusOptions {
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Everything a PD needs to answer the ACU
#[derive(Debug, Clone)]
pub struct DeviceConfiguration {
    /// Bus address (0-126)
    pub address: u8,

    /// Baud rate reported in osdp_COM
    pub baud_rate: u32,

    /// Refuse unsecured commands other than the discovery set
    pub require_security: bool,

    /// Accept a handshake keyed with the installation key
    pub default_key_allowed: bool,

    pub secure_channel_key: Key,
    pub default_key: Key,

    /// Client UID sent in osdp_CCRYPT
    pub client_uid: [u8; 8],

    pub identification: DeviceIdentification,
    pub capabilities: DeviceCapabilities,
}

impl DeviceConfiguration {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            baud_rate: 9600,
            require_security: false,
            default_key_allowed: true,
            secure_channel_key: DEFAULT_SECURE_CHANNEL_KEY,
            default_key: DEFAULT_SECURE_CHANNEL_KEY,
            client_uid: [0u8; 8],
            identification: DeviceIdentification {
                vendor_code: [0x00, 0x00, 0x00],
                model_number: 1,
                version: 1,
                serial_number: 0,
                firmware_version: (1, 0, 0),
            },
            capabilities: DeviceCapabilities::new(vec![
                Capability::new(CapabilityFunction::CheckCharacterSupport, 1, 0),
                Capability::new(CapabilityFunction::CommunicationSecurity, 1, 1),
                Capability::new(CapabilityFunction::ReceiveBufferSize, 0x40, 0x00),
            ]),
        }
    }

    /// Require a secure channel keyed with `key`
    pub fn with_secure_channel_key(mut self, key: Key) -> Self {
        self.secure_channel_key = key;
        self
    }

    pub fn with_require_security(mut self, require: bool) -> Self {
        self.require_security = require;
        self
    }

    pub fn with_default_key_allowed(mut self, allowed: bool) -> Self {
        self.default_key_allowed = allowed;
        self
    }

    pub fn with_default_key(mut self, key: Key) -> Self {
        self.default_key = key;
        self
    }

    pub fn with_client_uid(mut self, uid: [u8; 8]) -> Self {
        self.client_uid = uid;
        self
    }

    pub fn with_identification(mut self, identification: DeviceIdentification) -> Self {
        self.identification = identification;
        self
    }

    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Protocol-level settings for the peripheral session
    pub fn peripheral_options(&self) -> PeripheralOptions {
        PeripheralOptions::new(self.address)
            .with_require_security(self.require_security)
            .with_default_key_allowed(self.default_key_allowed)
            .with_secure_channel_key(self.secure_channel_key)
            .with_default_key(self.default_key)
            .with_client_uid(self.client_uid)
    }
}

/// Versioned, shareable PD configuration
///
/// Readers get an immutable snapshot; every replacement bumps the version so
/// a serving loop can tell its snapshot is stale.
#[derive(Debug)]
pub struct ConfigurationStore {
    current: RwLock<(u64, Arc<DeviceConfiguration>)>,
}

impl ConfigurationStore {
    pub fn new(configuration: DeviceConfiguration) -> Self {
        Self {
            current: RwLock::new((0, Arc::new(configuration))),
        }
    }

    /// Current configuration and its version
    pub fn snapshot(&self) -> (u64, Arc<DeviceConfiguration>) {
        let current = self.current.read();
        (current.0, Arc::clone(&current.1))
    }

    pub fn version(&self) -> u64 {
        self.current.read().0
    }

    /// Replace the configuration
    pub fn replace(&self, configuration: DeviceConfiguration) -> u64 {
        let mut current = self.current.write();
        current.0 += 1;
        current.1 = Arc::new(configuration);
        debug!("Configuration version {}", current.0);
        current.0
    }

    /// Modify a copy of the configuration and publish it
    pub fn update(&self, f: impl FnOnce(&mut DeviceConfiguration)) -> u64 {
        let mut current = self.current.write();
        let mut configuration = DeviceConfiguration::clone(&current.1);
        f(&mut configuration);
        current.0 += 1;
        current.1 = Arc::new(configuration);
        debug!("Configuration version {}", current.0);
        current.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_survives_update() {
        let store = ConfigurationStore::new(DeviceConfiguration::new(1));
        let (version, before) = store.snapshot();
        assert_eq!(version, 0);

        let new_version = store.update(|c| c.address = 5);
        assert_eq!(new_version, 1);
        assert_eq!(store.version(), 1);

        // An old snapshot is never mutated
        assert_eq!(before.address, 1);
        assert_eq!(store.snapshot().1.address, 5);
    }

    #[test]
    fn test_peripheral_options() {
        let key = [0x11u8; 16];
        let configuration = DeviceConfiguration::new(3)
            .with_secure_channel_key(key)
            .with_require_security(true)
            .with_default_key_allowed(false);

        let options = configuration.peripheral_options();
        assert_eq!(options.address, 3);
        assert!(options.require_security);
        assert!(!options.default_key_allowed);
        assert_eq!(options.secure_channel_key, key);
    }

    #[test]
    fn test_bus_options_builders() {
        let options = BusOptions::default()
            .with_reply_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::ZERO);
        assert_eq!(options.reply_timeout, Duration::from_millis(100));
        assert_eq!(options.poll_interval, Duration::ZERO);
    }
}
