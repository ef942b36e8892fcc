//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

#[cfg(test)]
mod tests;

use std::{collections::HashSet, fmt, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    channel::{Endpoint, PartyId, Role, TaskContext},
    crypto::MIN_KEY_LENGTH,
    mask::{MaskConfig, MAX_PRECISION},
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub log: LoggingSettings,
    pub task: TaskContext,
    pub party: PartySettings,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    #[validate]
    pub channel: ChannelSettings,
    #[validate]
    pub protocol: ProtocolSettings,
    pub mask: MaskConfig,
    #[serde(default)]
    pub data: DataSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("secagg").separator("__"))?;
        config.try_into()
    }

    /// Gets the identity of the local party.
    pub fn party(&self) -> PartyId {
        self.party.id()
    }

    /// Gets the endpoint of the local party.
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        let party = self.party();
        self.endpoints.iter().find(|e| e.party() == party)
    }

    /// Gets the endpoints of all the other parties.
    pub fn remote_endpoints(&self) -> Vec<Endpoint> {
        let party = self.party();
        self.endpoints
            .iter()
            .filter(|e| e.party() != party)
            .cloned()
            .collect()
    }

    /// Checks the consistency of the sections.
    fn validate_settings(&self) -> Result<(), ValidationError> {
        self.validate_endpoints()?;
        self.validate_data()?;
        self.validate_mask()
    }

    /// Checks that every party has exactly one endpoint, including the local party, and that the
    /// run consists of one arbiter, one guest and one host.
    fn validate_endpoints(&self) -> Result<(), ValidationError> {
        let mut parties = HashSet::new();
        if !self.endpoints.iter().all(|e| parties.insert(e.party())) {
            return Err(ValidationError::new("duplicate endpoints"));
        }
        let count = |role: Role| parties.iter().filter(|p| p.role == role).count();
        if count(Role::Arbiter) == 1
            && count(Role::Guest) == 1
            && count(Role::Host) == 1
            && parties.contains(&self.party())
        {
            Ok(())
        } else {
            Err(ValidationError::new("incomplete endpoints"))
        }
    }

    /// Checks that data parties have a dataset.
    fn validate_data(&self) -> Result<(), ValidationError> {
        if self.party.role == Role::Arbiter || self.data.path.is_some() {
            Ok(())
        } else {
            Err(ValidationError::new("missing dataset"))
        }
    }

    /// Checks that the masking configuration fits the key length for batches of a single row.
    /// Larger batches are checked by the data parties once the public key is known.
    fn validate_mask(&self) -> Result<(), ValidationError> {
        // a key of `key_length` bits has a modulus of at least `key_length - 1` bits
        let required_bits = self.mask.min_modulus(1).bits() as usize;
        if self.mask.precision <= MAX_PRECISION
            && required_bits < self.protocol.key_length.saturating_sub(1)
        {
            Ok(())
        } else {
            Err(ValidationError::new("masking configuration exceeds the key"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_settings()
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// The identity of the local party.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [party]
/// role = "guest"
/// index = 0
/// ```
///
/// **Environment variable**
/// ```text
/// SECAGG_PARTY__ROLE=guest
/// SECAGG_PARTY__INDEX=0
/// ```
pub struct PartySettings {
    pub role: Role,
    #[serde(default)]
    pub index: u32,
}

impl PartySettings {
    pub fn id(&self) -> PartyId {
        PartyId::new(self.role, self.index)
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
/// Session settings.
pub struct ChannelSettings {
    /// The delay between two polls of a mailbox and the timeout of a single transport read, in
    /// milliseconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [channel]
    /// poll_interval = 300
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SECAGG_CHANNEL__POLL_INTERVAL=300
    /// ```
    #[validate(range(min = 1))]
    pub poll_interval: u64,

    /// The number of polls before waiting for a value from a party times out.
    ///
    /// The wait lasts up to `get_retries * poll_interval` milliseconds, which must cover the
    /// slowest phase of the other parties, e.g. key generation and encryption.
    #[validate(range(min = 1))]
    pub get_retries: u32,

    /// The number of attempts to connect to a party before giving up.
    #[validate(range(min = 1))]
    pub connect_retries: u32,

    /// The number of concurrent background sends.
    #[validate(range(min = 1))]
    pub send_workers: u32,
}

impl ChannelSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// Gets the time to wait for the answer to a hello.
    pub fn handshake_timeout(&self) -> Duration {
        self.poll_interval() * self.connect_retries
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            poll_interval: 300,
            get_retries: 1000,
            connect_retries: 100,
            send_workers: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// The rule to update the parameters with the aggregated gradient.
pub enum OptimizerKind {
    /// Plain gradient descent with a constant learning rate.
    Sgd,
    /// Gradient descent with momentum.
    Momentum,
    /// Gradient descent with the learning rate decaying as `lr / (1 + alpha * lr * t)`.
    Optimal,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq)]
#[validate(schema(function = "validate_protocol"))]
/// Training settings, identical for all parties of a run.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [protocol]
/// key_length = 1024
/// max_iter = 100
/// tol = 1e-4
/// n_iter_no_change = 5
/// batch_size = 0
/// learning_rate = 0.15
/// optimizer = "sgd"
/// ```
pub struct ProtocolSettings {
    /// The length of the Paillier modulus in bits.
    pub key_length: usize,
    /// The maximal number of epochs.
    #[validate(range(min = 1))]
    pub max_iter: u32,
    /// The minimal improvement of the loss which counts as progress.
    pub tol: f64,
    /// The number of consecutive epochs without progress after which the run converges.
    #[validate(range(min = 1))]
    pub n_iter_no_change: u32,
    /// The number of rows per epoch. `0` selects all rows.
    #[serde(default)]
    pub batch_size: usize,
    pub learning_rate: f64,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,
    /// The momentum coefficient of the `momentum` optimizer.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// The decay of the `optimal` optimizer.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Seeds the batch sampling. Drawn from the OS if missing.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Sgd
}

fn default_momentum() -> f64 {
    0.9
}

fn default_alpha() -> f64 {
    0.0001
}

impl ProtocolSettings {
    /// Checks the training settings.
    fn validate_protocol(&self) -> Result<(), ValidationError> {
        if self.key_length < MIN_KEY_LENGTH || self.key_length % 2 != 0 {
            return Err(ValidationError::new("invalid key length"));
        }
        if !(self.tol >= 0. && self.learning_rate > 0. && self.alpha >= 0.) {
            return Err(ValidationError::new("invalid learning parameters"));
        }
        if !(0. ..1.).contains(&self.momentum) {
            return Err(ValidationError::new("invalid momentum"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_protocol(s: &ProtocolSettings) -> Result<(), ValidationError> {
    s.validate_protocol()
}

#[derive(Debug, Default, Deserialize, Clone)]
/// Dataset settings of a data party.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [data]
/// path = "data/guest.json"
/// ```
pub struct DataSettings {
    /// The JSON file holding the local partition of the dataset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// SECAGG_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
