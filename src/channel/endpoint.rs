//! Party identities and network endpoints.
//!
//! See the [channel module] documentation since this is a private module anyways.
//!
//! [channel module]: crate::channel

use std::convert::TryFrom;

use anyhow::anyhow;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{channel::ChannelError, message::DecodeError};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The role of a party in a training run.
///
/// Roles are ordered: the arbiter comes first, then guests, then hosts.
pub enum Role {
    /// Holds the private key and decrypts masked contributions.
    #[display(fmt = "arbiter")]
    Arbiter,
    /// Holds a data partition and coordinates batching.
    #[display(fmt = "guest")]
    Guest,
    /// Holds a data partition.
    #[display(fmt = "host")]
    Host,
}

impl TryFrom<u8> for Role {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Role::Arbiter,
            2 => Role::Guest,
            3 => Role::Host,
            _ => return Err(anyhow!("invalid role {}", value)),
        })
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        match role {
            Role::Arbiter => 1,
            Role::Guest => 2,
            Role::Host => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display(fmt = "{}-{}", role, index)]
/// The identity of one party of a run, e.g. `guest-0`.
pub struct PartyId {
    pub role: Role,
    pub index: u32,
}

impl PartyId {
    pub fn new(role: Role, index: u32) -> Self {
        Self { role, index }
    }

    /// Whether this party listens for the connection of `remote`, rather than connecting to it.
    ///
    /// Of any two parties, the one which orders first accepts.
    pub fn accepts(&self, remote: &PartyId) -> bool {
        self < remote
    }
}

#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[display(fmt = "{}/{}/{}", task_id, job_id, request_id)]
/// Scopes all the messages of one training run.
///
/// Sessions opened under different contexts never exchange messages, even when the endpoints are
/// reused.
pub struct TaskContext {
    pub task_id: String,
    pub job_id: String,
    pub request_id: String,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        job_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            job_id: job_id.into(),
            request_id: request_id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
/// The network identity of one party for one task.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [[endpoints]]
/// role = "guest"
/// index = 0
/// host = "127.0.0.1"
/// port = 9371
/// ```
pub struct Endpoint {
    pub role: Role,
    #[serde(default)]
    pub index: u32,
    pub host: String,
    pub port: u16,
    /// TLS is the business of the surrounding transport layer. Sessions refuse endpoints which
    /// require it.
    #[serde(default)]
    pub use_tls: bool,
}

impl Endpoint {
    pub fn new(party: PartyId, host: impl Into<String>, port: u16) -> Self {
        Self {
            role: party.role,
            index: party.index,
            host: host.into(),
            port,
            use_tls: false,
        }
    }

    /// Gets the identity of the party behind this endpoint.
    pub fn party(&self) -> PartyId {
        PartyId::new(self.role, self.index)
    }

    /// Checks that a plain TCP session can be opened for this endpoint.
    pub fn check_transport(&self) -> Result<(), ChannelError> {
        if self.use_tls {
            Err(ChannelError::TlsUnsupported(self.party()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_ordering() {
        let arbiter = PartyId::new(Role::Arbiter, 0);
        let guest = PartyId::new(Role::Guest, 0);
        let host_0 = PartyId::new(Role::Host, 0);
        let host_1 = PartyId::new(Role::Host, 1);

        assert!(arbiter.accepts(&guest));
        assert!(arbiter.accepts(&host_1));
        assert!(guest.accepts(&host_0));
        assert!(host_0.accepts(&host_1));
        assert!(!host_0.accepts(&guest));
        assert!(!guest.accepts(&guest));
    }

    #[test]
    fn test_display() {
        assert_eq!(PartyId::new(Role::Guest, 2).to_string(), "guest-2");
        assert_eq!(
            TaskContext::new("task", "job", "request").to_string(),
            "task/job/request"
        );
    }

    #[test]
    fn test_tls_endpoint() {
        let mut endpoint = Endpoint::new(PartyId::new(Role::Host, 0), "localhost", 9372);
        assert!(endpoint.check_transport().is_ok());
        endpoint.use_tls = true;
        assert!(matches!(
            endpoint.check_transport(),
            Err(ChannelError::TlsUnsupported(party)) if party == PartyId::new(Role::Host, 0)
        ));
    }
}
