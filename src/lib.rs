#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Secure vertical logistic regression
//!
//! Three parties train a logistic-regression model on row-aligned, vertically partitioned data
//! without revealing their data or gradients:
//! - the **arbiter** owns a Paillier key pair, decrypts masked gradients and the joint loss and
//!   decides when the training has converged.
//! - the **guest** holds the labels and some features. It samples the batches and combines the
//!   host's encrypted predictors with its own into the encrypted residuals of the joint model.
//! - the **host** holds further features. It computes its encrypted gradient from the residuals.
//!
//! Both data parties mask their encrypted gradients, let the arbiter decrypt them and unmask the
//! results locally.
//!
//! ## Layers
//! - [`message`]: the typed [`Value`]s exchanged between parties and their binary representation.
//! - [`channel`]: point-to-point [`Session`]s between two parties. Every received value lands in a
//!   tagged [`Mailbox`], from which it is taken by tag.
//! - [`proxy`]: a [`PartyProxy`] puts and gets values of a single remote party.
//! - [`fanout`]: a [`FanoutClient`] addresses all the other parties of a run at once.
//! - [`crypto`] and [`mask`]: the Paillier cryptosystem and the masking of encrypted vectors.
//! - [`protocol`]: the arbiter and data party drivers.
//! - [`settings`]: loading and validation of the configuration.
//!
//! [`Value`]: crate::message::Value
//! [`Session`]: crate::channel::Session
//! [`Mailbox`]: crate::channel::Mailbox
//! [`PartyProxy`]: crate::proxy::PartyProxy
//! [`FanoutClient`]: crate::fanout::FanoutClient

#[macro_use]
extern crate tracing;

pub mod channel;
pub mod crypto;
pub mod fanout;
pub mod mask;
pub mod message;
pub mod protocol;
pub mod proxy;
pub mod settings;

pub use self::{
    channel::{ChannelError, PartyId, Role, TaskContext},
    fanout::{FanoutClient, FanoutError},
    protocol::{Arbiter, DataParty, ProtocolError},
    settings::{Settings, SettingsError},
};
