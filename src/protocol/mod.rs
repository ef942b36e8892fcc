//! Secure training of a vertically partitioned logistic-regression model.
//!
//! The guest holds the labels and some features of every sample, the host holds other features of
//! the same, row-aligned samples. Both train their own weights of one joint linear predictor
//! `u = u_g + u_h`, where only the guest owns the intercept. The logistic loss is replaced by its
//! second order Taylor expansion at zero, `l(u) = ln 2 - y' u / 2 + u^2 / 8` with `y' = 2 y - 1`,
//! whose residual `d = u / 4 - y' / 2` is linear in `u` and can therefore be computed under
//! additively homomorphic encryption.
//!
//! The arbiter holds a Paillier key pair. Every epoch runs through the following phases:
//!
//! - **KeyGen** (arbiter, once): generate the key pair.
//! - **Distribute** (once): the arbiter sends the public key to the data parties.
//! - **LocalCompute**: the guest samples the batch and shares its row indices with the host and
//!   the arbiter. The host encrypts its predictors `u_h` and their squares and sends them to the
//!   guest. The guest adds its own part to obtain the encrypted fore gradient `4 d` of every row,
//!   which it returns to the host, and the encrypted batch loss. Each data party then computes its
//!   encrypted gradient `sum_i 4 d_i x_ij` from the fore gradient and its own features and masks
//!   it, see the [mask module].
//! - **Submit**: each data party sends its masked gradient to the arbiter, the guest also sends the
//!   encrypted loss.
//! - **DecryptCombine**: the arbiter decrypts every masked gradient separately and the loss.
//! - **Broadcast**: the arbiter returns to each data party its own decrypted, still masked
//!   gradient.
//! - **LocalUpdate**: each data party unmasks its gradient and updates its parameters.
//! - **ConvergenceCheck**: the arbiter checks the loss and sends the [`ConvergenceFlags`] to the
//!   data parties, which then either start the next epoch or terminate.
//!
//! The arbiter never holds an unmasked gradient and the data parties never hold a plaintext of the
//! other one. Only the arbiter learns the joint loss.
//!
//! # Parties
//! A run consists of exactly one arbiter, one guest and one host. The squared predictor of a
//! second host could not be combined with the first one's under encryption.
//!
//! # Failures
//! A party which fails tells all parties it can still reach that it aborts the run. Parties
//! waiting for a value also watch for an abort of its sender.
//!
//! [mask module]: crate::mask
//! [`ConvergenceFlags`]: crate::message::ConvergenceFlags

pub(crate) mod arbiter;
pub(crate) mod batch;
pub(crate) mod convergence;
pub(crate) mod encrypted;
pub(crate) mod model;
pub(crate) mod optimizer;
pub(crate) mod party;
pub(crate) mod round;
#[cfg(test)]
mod tests;

use derive_more::Display;
use thiserror::Error;
use tracing::Span;

pub use self::{
    arbiter::{Arbiter, ArbiterOutcome},
    batch::BatchGenerator,
    convergence::ConvergenceChecker,
    encrypted::Cipher,
    model::{linear_predictors, taylor_loss, taylor_residual, Dataset},
    optimizer::Optimizer,
    party::{DataParty, PartyOutcome, Training},
    round::ProtocolRound,
};
use crate::{
    channel::{ChannelError, PartyId, Role},
    crypto::PaillierError,
    fanout::FanoutError,
    mask::MaskError,
    message::{Value, ValueKind},
};

/// The logical keys of the values exchanged by the protocol.
pub mod keys {
    /// The public key, sent by the arbiter.
    pub const PUBLIC_KEY: &str = "public_key";
    /// The row indices of an epoch, sent by the guest.
    pub const BATCH_INDEX: &str = "batch_index";
    /// The encrypted predictors of the host and their squares.
    pub const HOST_FORWARD: &str = "host_forward";
    /// The encrypted fore gradient of every batch row, sent by the guest to the host.
    pub const FORE_GRADIENT: &str = "fore_gradient";
    /// The encrypted and masked gradient of a data party.
    pub const MASKED_GRADIENT: &str = "masked_gradient";
    /// The encrypted batch loss, sent by the guest.
    pub const LOSS: &str = "loss";
    /// The decrypted but still masked gradient, returned to its originator.
    pub const MASKED_GRADIENT_DECRYPTED: &str = "masked_gradient_decrypted";
    /// The convergence status of an epoch, sent by the arbiter.
    pub const CONVERGENCE: &str = "convergence";
}

/// Name of the current phase
#[derive(Debug, Display, Clone, Copy, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "KeyGen")]
    KeyGen,
    #[display(fmt = "Distribute")]
    Distribute,
    #[display(fmt = "LocalCompute")]
    LocalCompute,
    #[display(fmt = "Submit")]
    Submit,
    #[display(fmt = "DecryptCombine")]
    DecryptCombine,
    #[display(fmt = "Broadcast")]
    Broadcast,
    #[display(fmt = "LocalUpdate")]
    LocalUpdate,
    #[display(fmt = "ConvergenceCheck")]
    ConvergenceCheck,
}

#[derive(Debug, Error)]
/// Errors which end a run.
pub enum ProtocolError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Fanout(FanoutError),

    #[error("{party} aborted the run: {reason}")]
    Aborted { party: PartyId, reason: String },

    #[error("cryptographic failure: {0}")]
    Crypto(#[from] PaillierError),

    #[error("masking failed: {0}")]
    Mask(#[from] MaskError),

    #[error("expected a value of kind {expected:?} under {key}, got {actual:?}")]
    UnexpectedValue {
        key: &'static str,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("background task failed: {0}")]
    Worker(String),
}

impl From<FanoutError> for ProtocolError {
    fn from(error: FanoutError) -> Self {
        match error {
            FanoutError::Aborted { party, reason } => Self::Aborted { party, reason },
            error => Self::Fanout(error),
        }
    }
}

impl ProtocolError {
    /// Whether another party aborted the run.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Runs a CPU-heavy closure on the blocking thread pool.
pub(crate) async fn run_blocking<F, T>(f: F) -> Result<T, ProtocolError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ProtocolError::Worker(err.to_string()))
}

/// Checks that the `parties` are exactly one arbiter, one guest and one host, and returns them in
/// this order.
pub(crate) fn check_roles(
    parties: &[PartyId],
) -> Result<(PartyId, PartyId, PartyId), ProtocolError> {
    let single = |role: Role| {
        let mut matching = parties.iter().copied().filter(|party| party.role == role);
        match (matching.next(), matching.next()) {
            (Some(party), None) => Ok(party),
            (None, _) => Err(ProtocolError::Precondition(format!("the run has no {}", role))),
            (Some(_), Some(second)) => Err(ProtocolError::Precondition(format!(
                "{} is a second {}",
                second, role
            ))),
        }
    };
    Ok((
        single(Role::Arbiter)?,
        single(Role::Guest)?,
        single(Role::Host)?,
    ))
}

/// Creates the span of a phase.
pub(crate) fn phase_span(phase: PhaseName) -> Span {
    error_span!("phase", name = %phase)
}

pub(crate) fn unexpected(key: &'static str, expected: ValueKind, actual: &Value) -> ProtocolError {
    ProtocolError::UnexpectedValue {
        key,
        expected,
        actual: actual.kind(),
    }
}
