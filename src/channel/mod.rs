//! Point-to-point sessions with tagged mailboxes.
//!
//! A [`Session`] connects two parties of a run over one TCP connection. Every payload is sent
//! under a tag and acknowledged by the peer once it has been stored in the peer's [`Mailbox`], so a
//! completed [`Session::send()`] means the value is waiting for the peer to take it.
//!
//! # Establishing sessions
//! Of any two parties, the one which orders first (see [`PartyId::accepts()`]) listens with a
//! [`SessionListener`] and the other one connects with [`Session::connect()`]. The connecting party
//! opens with a hello frame naming itself and the [`TaskContext`] of the run; the listener refuses
//! connections from other runs or from unexpected parties.
//!
//! # Receiving
//! Each session runs a receive loop on its own task. The loop stores incoming payloads in the
//! mailbox, acknowledges them and resolves the acknowledgments of outgoing payloads. It checks a
//! stop flag once per iteration, polling the transport with a timeout in between.
//!
//! # Failures
//! A transport error ends the receive loop and closes the session for good: pending and later
//! sends fail with [`ChannelError::Closed`], as do receives of tags that have not been delivered
//! before the failure. There is no reconnection.

pub(crate) mod endpoint;
pub(crate) mod listener;
pub(crate) mod mailbox;
pub(crate) mod session;

use std::io;

use thiserror::Error;

pub use self::{
    endpoint::{Endpoint, PartyId, Role, TaskContext},
    listener::SessionListener,
    mailbox::Mailbox,
    session::{Session, SessionRole},
};
use crate::message::{AckStatus, DecodeError};

#[derive(Debug, Error)]
/// Errors related to the sessions between parties.
pub enum ChannelError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("the session with {0} is closed")]
    Closed(PartyId),

    #[error("{party} rejected the message: {status}")]
    Rejected { party: PartyId, status: AckStatus },

    #[error("handshake with {party} failed: {reason}")]
    Handshake { party: String, reason: String },

    #[error("could not connect to {party} after {attempts} attempts")]
    Unreachable { party: PartyId, attempts: u32 },

    #[error("{0} must accept sessions but has no listener")]
    NoListener(PartyId),

    #[error("TLS is required for {0} but not supported by this transport")]
    TlsUnsupported(PartyId),

    #[error("invalid payload: {0:#}")]
    Decode(DecodeError),

    #[error("send worker failed: {0}")]
    Worker(String),
}
