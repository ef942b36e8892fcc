//! The arbiter driver.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use futures::future;
use tracing_futures::Instrument;

use crate::{
    channel::{PartyId, Role},
    crypto::{Ciphertext, KeyPair, SecretKey},
    fanout::FanoutClient,
    mask::MaskConfig,
    message::{ConvergenceFlags, Value, ValueKind},
    protocol::{
        check_roles,
        encrypted::Cipher,
        keys,
        phase_span,
        run_blocking,
        unexpected,
        ConvergenceChecker,
        PhaseName,
        ProtocolError,
        ProtocolRound,
    },
    settings::ProtocolSettings,
};

#[derive(Debug, Clone, PartialEq)]
/// The result of the arbiter's run.
pub struct ArbiterOutcome {
    /// The number of completed epochs.
    pub iterations: u32,
    pub converged: bool,
    pub best_iter: Option<u32>,
    pub best_loss: Option<f64>,
    /// The aggregated loss of every epoch.
    pub losses: Vec<f64>,
}

/// Drives the training as the arbiter.
///
/// The arbiter owns the key pair, decrypts the masked gradients and the joint loss and decides on
/// convergence.
pub struct Arbiter {
    client: FanoutClient,
    settings: ProtocolSettings,
    mask: MaskConfig,
    guest: PartyId,
}

impl Arbiter {
    /// Creates the driver of the local party of the `client`.
    ///
    /// # Errors
    /// Fails if the local party is no arbiter or if the remote parties are not exactly one guest
    /// and one host.
    pub fn new(
        client: FanoutClient,
        settings: ProtocolSettings,
        mask: MaskConfig,
    ) -> Result<Self, ProtocolError> {
        let local = client.local();
        if local.role != Role::Arbiter {
            return Err(ProtocolError::Precondition(format!(
                "{} is no arbiter",
                local
            )));
        }
        let mut parties = client.parties();
        parties.push(local);
        let (_, guest, _) = check_roles(&parties)?;
        Ok(Self {
            client,
            settings,
            mask,
            guest,
        })
    }

    /// Runs the training until convergence or `max_iter` epochs and closes all sessions.
    ///
    /// A failure is announced to all data parties.
    pub async fn run(self) -> Result<ArbiterOutcome, ProtocolError> {
        let local = self.client.local();
        let result = self
            .train()
            .instrument(error_span!("arbiter", party = %local))
            .await;
        match &result {
            Ok(outcome) => info!(
                "training finished after {} epochs (converged: {}, best epoch: {:?})",
                outcome.iterations, outcome.converged, outcome.best_iter
            ),
            Err(err) => {
                error!("training failed: {}", err);
                self.client.broadcast_abort(&err.to_string()).await;
            }
        }
        self.client.shutdown().await;
        result
    }

    async fn train(&self) -> Result<ArbiterOutcome, ProtocolError> {
        let key_length = self.settings.key_length;
        let key_pair = run_blocking(move || KeyPair::generate(key_length))
            .instrument(phase_span(PhaseName::KeyGen))
            .await??;
        self.mask.check_modulus(key_pair.public.n(), 1)?;
        info!("generated a {} bit key pair", key_length);

        self.client
            .send_all(keys::PUBLIC_KEY, &Value::PublicKey(key_pair.public.clone()))
            .instrument(phase_span(PhaseName::Distribute))
            .await?;
        let cipher = Cipher::new(key_pair.public.clone(), self.mask);

        let mut checker = ConvergenceChecker::new(&self.settings);
        let mut losses = Vec::new();
        let mut converged = false;
        for epoch in 0..self.settings.max_iter {
            let (flags, loss) = self
                .epoch(epoch, &cipher, &key_pair.secret, &mut checker)
                .instrument(debug_span!("epoch", epoch))
                .await?;
            losses.push(loss);
            if flags.contains(ConvergenceFlags::CONVERGED) {
                converged = true;
                break;
            }
        }
        Ok(ArbiterOutcome {
            iterations: checker.iterations(),
            converged,
            best_iter: checker.best_iter(),
            best_loss: checker.best_loss(),
            losses,
        })
    }

    /// Runs one epoch and returns its convergence status and aggregated loss.
    async fn epoch(
        &self,
        epoch: u32,
        cipher: &Cipher,
        secret: &SecretKey,
        checker: &mut ConvergenceChecker,
    ) -> Result<(ConvergenceFlags, f64), ProtocolError> {
        let mut round = ProtocolRound::new(epoch);
        let (rows, loss) = self
            .collect(&mut round)
            .instrument(phase_span(PhaseName::Submit))
            .await?;

        let decrypted = self
            .decrypt(&mut round, cipher, secret, rows, loss)
            .instrument(phase_span(PhaseName::DecryptCombine))
            .await?;
        self.client
            .send_distinct(keys::MASKED_GRADIENT_DECRYPTED, decrypted)
            .instrument(phase_span(PhaseName::Broadcast))
            .await?;

        let loss = round.aggregate.ok_or_else(|| {
            ProtocolError::Precondition(format!("no loss in epoch {}", epoch))
        })?;
        let flags = checker.check(loss);
        round.converged = flags.contains(ConvergenceFlags::CONVERGED);
        info!("epoch {}: loss {:.6}, status {:?}", epoch, loss, flags);
        self.client
            .send_all(keys::CONVERGENCE, &Value::Status(flags))
            .instrument(phase_span(PhaseName::ConvergenceCheck))
            .await?;
        Ok((flags, loss))
    }

    /// Collects the batch size, the masked gradients of all data parties and the encrypted loss.
    async fn collect(
        &self,
        round: &mut ProtocolRound,
    ) -> Result<(usize, Ciphertext), ProtocolError> {
        let rows = match self.client.recv_from(self.guest, keys::BATCH_INDEX).await? {
            Value::Indices(batch) => batch.len(),
            other => return Err(unexpected(keys::BATCH_INDEX, ValueKind::Indices, &other)),
        };
        for (party, value) in self.client.recv_all(keys::MASKED_GRADIENT).await? {
            match value {
                Value::Ciphertexts(masked) => round.add_contribution(party, masked),
                other => {
                    return Err(unexpected(
                        keys::MASKED_GRADIENT,
                        ValueKind::Ciphertexts,
                        &other,
                    ))
                }
            }
        }
        match self.client.recv_from(self.guest, keys::LOSS).await? {
            Value::Ciphertexts(loss) => match loss.as_slice() {
                [loss] => Ok((rows, loss.clone())),
                _ => Err(ProtocolError::Precondition(format!(
                    "{} encrypted losses instead of one",
                    loss.len()
                ))),
            },
            other => Err(unexpected(keys::LOSS, ValueKind::Ciphertexts, &other)),
        }
    }

    /// Decrypts the loss into the aggregate of the `round` and the masked gradient of every
    /// party separately, in registration order.
    async fn decrypt(
        &self,
        round: &mut ProtocolRound,
        cipher: &Cipher,
        secret: &SecretKey,
        rows: usize,
        loss: Ciphertext,
    ) -> Result<Vec<Value>, ProtocolError> {
        let parties = self.client.parties();
        let contributors = round.contributors();
        if let Some(party) = parties.iter().find(|party| !contributors.contains(*party)) {
            return Err(missing(*party));
        }

        let loss_secret = secret.clone();
        let decrypted_loss = run_blocking(move || loss_secret.decrypt(&loss)).await??;
        round.add_loss(cipher.decode_loss(&decrypted_loss, rows)?);

        let decryptions = parties.into_iter().map(|party| {
            let masked = round.masked_contributions.get(&party).cloned();
            let secret = secret.clone();
            async move {
                let masked = masked.ok_or_else(|| missing(party))?;
                let plaintexts = run_blocking(move || {
                    masked
                        .iter()
                        .map(|ciphertext| secret.decrypt(ciphertext))
                        .collect::<Result<Vec<_>, _>>()
                })
                .await??;
                Ok::<_, ProtocolError>(Value::Plaintexts(plaintexts))
            }
        });
        future::try_join_all(decryptions).await
    }
}

fn missing(party: PartyId) -> ProtocolError {
    ProtocolError::Precondition(format!("no masked gradient from {}", party))
}
