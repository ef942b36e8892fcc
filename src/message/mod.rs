//! The wire formats of the mailbox channel.
//!
//! # Values
//! A [`Value`] is the typed payload which a party sends under a tag. Its encoding starts with a
//! header carrying an encoding version and a [`ValueKind`] discriminant, followed by a body whose
//! layout depends on the kind. Decoding dispatches on the discriminant, so any value can be decoded
//! without knowing in advance what the peer sent.
//!
//! # Frames
//! A [`Frame`] is the unit exchanged on the transport of a session: a handshake, a tagged payload,
//! or an acknowledgment.
//!
//! # Tags
//! Tags name the logical values of the protocol and are conventionally built as
//! `"<sender role>_<logical key>"`, see [`tag()`].

pub(crate) mod frame;
pub(crate) mod traits;
pub(crate) mod value;

use std::ops::Range;

pub use self::{
    frame::{AckStatus, Frame},
    traits::{FromBytes, LengthValueBuffer, ToBytes},
    value::{ConvergenceFlags, Value, ValueBuffer, ValueKind, VALUE_VERSION},
};
use crate::channel::Role;

/// An error that signals a failure when trying to parse a value or a frame.
pub type DecodeError = anyhow::Error;

/// Creates a range from `start` to `start + length`.
pub(crate) const fn range(start: usize, length: usize) -> Range<usize> {
    start..(start + length)
}

/// Builds the tag under which `role` sends the value of the logical `key`.
///
/// # Examples
///
/// ```rust
/// # use xaynet_secagg::{channel::Role, message::tag};
/// assert_eq!(tag(Role::Guest, "masked_gradient"), "guest_masked_gradient");
/// ```
pub fn tag(role: Role, key: &str) -> String {
    format!("{}_{}", role, key)
}
