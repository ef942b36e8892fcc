//! The data party driver, run by the guest and the host.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use tracing_futures::Instrument;

use crate::{
    channel::{PartyId, Role},
    crypto::Ciphertext,
    fanout::FanoutClient,
    mask::{unmask, MaskConfig, MaskSeed, Masker},
    message::{tag, ConvergenceFlags, Value, ValueKind},
    protocol::{
        check_roles,
        encrypted::Cipher,
        keys,
        linear_predictors,
        phase_span,
        run_blocking,
        unexpected,
        BatchGenerator,
        Dataset,
        Optimizer,
        PhaseName,
        ProtocolError,
    },
    settings::ProtocolSettings,
};

#[derive(Debug, Clone, PartialEq)]
/// The local model of a data party.
pub struct Training {
    params: Vec<f64>,
    optimizer: Optimizer,
    best: Option<(u32, Vec<f64>)>,
    iterations: u32,
    converged: bool,
}

impl Training {
    /// Starts from all-zero parameters.
    pub fn new(n_params: usize, optimizer: Optimizer) -> Self {
        Self {
            params: vec![0.; n_params],
            optimizer,
            best: None,
            iterations: 0,
            converged: false,
        }
    }

    /// Gets the current parameters.
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Applies the `gradient` and returns the parameters it was computed with.
    pub fn update(&mut self, gradient: &[f64]) -> Vec<f64> {
        let evaluated = self.params.clone();
        self.optimizer.step(&mut self.params, gradient);
        evaluated
    }

    /// Records the convergence status of `epoch`, whose loss was computed with the `evaluated`
    /// parameters. Returns whether the run has converged.
    pub fn record(&mut self, epoch: u32, flags: ConvergenceFlags, evaluated: Vec<f64>) -> bool {
        self.iterations = epoch + 1;
        if flags.contains(ConvergenceFlags::BEST_ITER_CHANGED) {
            self.best = Some((epoch, evaluated));
        }
        self.converged = flags.contains(ConvergenceFlags::CONVERGED);
        self.converged
    }

    /// Gets the epoch with the lowest aggregated loss so far and the parameters it evaluated.
    pub fn best(&self) -> Option<(u32, &[f64])> {
        self.best
            .as_ref()
            .map(|(epoch, params)| (*epoch, params.as_slice()))
    }

    /// Ends the training. The final parameters are the best ones, or the current ones if no epoch
    /// completed.
    pub fn finish(self, party: PartyId) -> PartyOutcome {
        let (best_iter, params) = match self.best {
            Some((epoch, params)) => (Some(epoch), params),
            None => (None, self.params),
        };
        PartyOutcome {
            party,
            params,
            best_iter,
            iterations: self.iterations,
            converged: self.converged,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The result of a data party's run.
pub struct PartyOutcome {
    pub party: PartyId,
    /// One weight per local feature, followed by the intercept for the guest.
    pub params: Vec<f64>,
    pub best_iter: Option<u32>,
    /// The number of completed epochs.
    pub iterations: u32,
    pub converged: bool,
}

/// Drives the training of the guest or the host.
pub struct DataParty {
    client: FanoutClient,
    data: Dataset,
    settings: ProtocolSettings,
    mask: MaskConfig,
    arbiter: PartyId,
    peer: PartyId,
}

impl DataParty {
    /// Creates the driver of the local party of the `client`.
    ///
    /// # Errors
    /// Fails if the local party is no data party, if the run doesn't consist of one arbiter, one
    /// guest and one host, or if the data is malformed, out of the bounds of the masking
    /// configuration or labeled differently than the role requires.
    pub fn new(
        client: FanoutClient,
        data: Dataset,
        settings: ProtocolSettings,
        mask: MaskConfig,
    ) -> Result<Self, ProtocolError> {
        let local = client.local();
        if local.role == Role::Arbiter {
            return Err(ProtocolError::Precondition(format!(
                "{} is no data party",
                local
            )));
        }
        let mut parties = client.parties();
        parties.push(local);
        let (arbiter, guest, host) = check_roles(&parties)?;
        let peer = if local == guest { host } else { guest };

        data.check()?;
        if data.is_labeled() != (local.role == Role::Guest) {
            return Err(ProtocolError::Precondition(format!(
                "{} must {}hold the labels",
                local,
                if local.role == Role::Guest { "" } else { "not " }
            )));
        }
        for row in &data.features {
            mask.check_bounds(row)?;
        }
        Ok(Self {
            client,
            data,
            settings,
            mask,
            arbiter,
            peer,
        })
    }

    /// Whether the local party samples the batches, which is the guest.
    pub fn is_batch_leader(&self) -> bool {
        self.client.local().role == Role::Guest
    }

    /// Runs the training until convergence or `max_iter` epochs and closes all sessions.
    ///
    /// A failing party tells the other parties that it aborts.
    pub async fn run(self) -> Result<PartyOutcome, ProtocolError> {
        let local = self.client.local();
        let result = self
            .train()
            .instrument(error_span!("party", party = %local))
            .await;
        match &result {
            Ok(outcome) => info!(
                "{} finished after {} epochs (converged: {})",
                local, outcome.iterations, outcome.converged
            ),
            Err(err) => {
                error!("{} failed: {}", local, err);
                self.client.broadcast_abort(&err.to_string()).await;
            }
        }
        self.client.shutdown().await;
        result
    }

    async fn train(&self) -> Result<PartyOutcome, ProtocolError> {
        let cipher = self
            .receive_public_key()
            .instrument(phase_span(PhaseName::Distribute))
            .await?;

        let mut batches = if self.is_batch_leader() {
            Some(BatchGenerator::new(
                self.data.rows(),
                self.settings.batch_size,
                self.settings.seed,
            ))
        } else {
            None
        };
        let mut training = Training::new(self.data.n_params(), Optimizer::new(&self.settings));
        for epoch in 0..self.settings.max_iter {
            let converged = self
                .epoch(epoch, &cipher, batches.as_mut(), &mut training)
                .instrument(debug_span!("epoch", epoch))
                .await?;
            if converged {
                break;
            }
        }
        Ok(training.finish(self.client.local()))
    }

    async fn receive_public_key(&self) -> Result<Cipher, ProtocolError> {
        match self
            .client
            .recv_from(self.arbiter, keys::PUBLIC_KEY)
            .await?
        {
            Value::PublicKey(public) => {
                self.mask.check_modulus(public.n(), 1)?;
                debug!("received a {} bit public key", public.n().bits());
                Ok(Cipher::new(public, self.mask))
            }
            other => Err(unexpected(keys::PUBLIC_KEY, ValueKind::PublicKey, &other)),
        }
    }

    async fn epoch(
        &self,
        epoch: u32,
        cipher: &Cipher,
        batches: Option<&mut BatchGenerator>,
        training: &mut Training,
    ) -> Result<bool, ProtocolError> {
        let batch = self.batch(batches).await?;
        self.mask.check_modulus(cipher.public_key().n(), batch.len())?;
        let (seed, masked) = self
            .local_compute(cipher, training.params(), &batch)
            .instrument(phase_span(PhaseName::LocalCompute))
            .await?;
        let n_params = masked.len();
        self.submit(masked)
            .instrument(phase_span(PhaseName::Submit))
            .await?;
        let gradient = self
            .local_update(cipher, &seed, n_params, batch.len())
            .instrument(phase_span(PhaseName::LocalUpdate))
            .await?;
        let evaluated = training.update(&gradient);

        let flags = self
            .convergence_status()
            .instrument(phase_span(PhaseName::ConvergenceCheck))
            .await?;
        debug!("epoch {}: status {:?}", epoch, flags);
        Ok(training.record(epoch, flags, evaluated))
    }

    /// Samples the batch and shares it, or waits for the batch of the guest.
    async fn batch(
        &self,
        batches: Option<&mut BatchGenerator>,
    ) -> Result<Vec<u64>, ProtocolError> {
        if let Some(batches) = batches {
            let batch = batches.next_batch();
            self.client
                .send_selected(
                    keys::BATCH_INDEX,
                    &Value::Indices(batch.clone()),
                    &[self.peer, self.arbiter],
                )
                .await?;
            return Ok(batch);
        }
        match self.client.recv_from(self.peer, keys::BATCH_INDEX).await? {
            Value::Indices(batch) => Ok(batch),
            other => Err(unexpected(keys::BATCH_INDEX, ValueKind::Indices, &other)),
        }
    }

    /// Computes the local predictors, exchanges the encrypted fore gradient with the peer and
    /// masks the encrypted local gradient.
    async fn local_compute(
        &self,
        cipher: &Cipher,
        params: &[f64],
        batch: &[u64],
    ) -> Result<(MaskSeed, Vec<Ciphertext>), ProtocolError> {
        let predictors = linear_predictors(&self.data, params, batch)?;
        self.mask.check_bounds(&predictors)?;
        let fore = if self.is_batch_leader() {
            self.guest_fore_gradient(cipher, predictors, batch).await?
        } else {
            self.host_fore_gradient(cipher, predictors).await?
        };

        let rows = self
            .data
            .batch_rows(batch)?
            .into_iter()
            .map(<[f64]>::to_vec)
            .collect::<Vec<_>>();
        let intercept = self.data.is_labeled();
        let cipher = cipher.clone();
        let masked = run_blocking(move || {
            let rows = rows.iter().map(Vec::as_slice).collect::<Vec<_>>();
            let gradient = cipher.gradient(&fore, &rows, intercept)?;
            Ok::<_, ProtocolError>(Masker::new().mask(cipher.public_key(), &gradient)?)
        })
        .await??;
        Ok(masked)
    }

    /// Combines the encrypted host predictors with the local ones into the fore gradient, which
    /// is shared with the host, and into the batch loss, which is sent to the arbiter.
    async fn guest_fore_gradient(
        &self,
        cipher: &Cipher,
        predictors: Vec<f64>,
        batch: &[u64],
    ) -> Result<Vec<Ciphertext>, ProtocolError> {
        let labels = self.data.batch_labels(batch)?;
        let forward = match self.client.recv_from(self.peer, keys::HOST_FORWARD).await? {
            Value::Ciphertexts(forward) => forward,
            other => {
                return Err(unexpected(
                    keys::HOST_FORWARD,
                    ValueKind::Ciphertexts,
                    &other,
                ))
            }
        };
        let cipher = cipher.clone();
        let (fore, loss) = run_blocking(move || {
            let fore = cipher.fore_gradient(&forward, &predictors, &labels)?;
            let loss = cipher.loss(&forward, &predictors, &labels)?;
            Ok::<_, ProtocolError>((fore, loss))
        })
        .await??;

        let forwarded = self.client.proxy(self.peer)?.remote_async(
            Value::Ciphertexts(fore.clone()),
            tag(self.client.local().role, keys::FORE_GRADIENT),
        );
        self.client
            .send_selected(keys::LOSS, &Value::Ciphertexts(vec![loss]), &[self.arbiter])
            .await?;
        forwarded.result().await?;
        Ok(fore)
    }

    /// Shares the encrypted local predictors with the guest and waits for the fore gradient.
    async fn host_fore_gradient(
        &self,
        cipher: &Cipher,
        predictors: Vec<f64>,
    ) -> Result<Vec<Ciphertext>, ProtocolError> {
        let rows = predictors.len();
        let cipher = cipher.clone();
        let forward = run_blocking(move || cipher.encrypt_forward(&predictors)).await??;
        self.client
            .send_selected(keys::HOST_FORWARD, &Value::Ciphertexts(forward), &[self.peer])
            .await?;
        match self.client.recv_from(self.peer, keys::FORE_GRADIENT).await? {
            Value::Ciphertexts(fore) if fore.len() == rows => Ok(fore),
            Value::Ciphertexts(fore) => Err(ProtocolError::Precondition(format!(
                "{} fore gradients for a batch of {} rows",
                fore.len(),
                rows
            ))),
            other => Err(unexpected(
                keys::FORE_GRADIENT,
                ValueKind::Ciphertexts,
                &other,
            )),
        }
    }

    async fn submit(&self, masked: Vec<Ciphertext>) -> Result<(), ProtocolError> {
        let local = self.client.local();
        self.client
            .proxy(self.arbiter)?
            .remote_async(
                Value::Ciphertexts(masked),
                tag(local.role, keys::MASKED_GRADIENT),
            )
            .result()
            .await?;
        Ok(())
    }

    async fn local_update(
        &self,
        cipher: &Cipher,
        seed: &MaskSeed,
        n_params: usize,
        rows: usize,
    ) -> Result<Vec<f64>, ProtocolError> {
        match self
            .client
            .recv_from(self.arbiter, keys::MASKED_GRADIENT_DECRYPTED)
            .await?
        {
            Value::Plaintexts(masked) => {
                let encoded = unmask(seed, cipher.public_key().n(), &masked, n_params)?;
                cipher.decode_gradient(&encoded, rows)
            }
            other => Err(unexpected(
                keys::MASKED_GRADIENT_DECRYPTED,
                ValueKind::Plaintexts,
                &other,
            )),
        }
    }

    async fn convergence_status(&self) -> Result<ConvergenceFlags, ProtocolError> {
        match self
            .client
            .recv_from(self.arbiter, keys::CONVERGENCE)
            .await?
        {
            Value::Status(flags) => Ok(flags),
            other => Err(unexpected(keys::CONVERGENCE, ValueKind::Status, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fanout::tests::{connect_parties, settings},
        mask::{BoundType, MaskError},
    };

    fn sgd(learning_rate: f64) -> Optimizer {
        Optimizer::Sgd { learning_rate }
    }

    #[test]
    fn test_training_update() {
        let mut training = Training::new(2, sgd(0.5));
        assert_eq!(training.params(), &[0., 0.]);
        let evaluated = training.update(&[1., -2.]);
        assert_eq!(evaluated, vec![0., 0.]);
        assert_eq!(training.params(), &[-0.5, 1.]);
    }

    #[test]
    fn test_training_keeps_best() {
        let party = PartyId::new(Role::Guest, 0);
        let mut training = Training::new(1, sgd(1.));

        let evaluated = training.update(&[-1.]);
        assert!(!training.record(0, ConvergenceFlags::BEST_ITER_CHANGED, evaluated));
        let evaluated = training.update(&[-1.]);
        assert!(!training.record(1, ConvergenceFlags::BEST_ITER_CHANGED, evaluated));
        // a worse epoch keeps the snapshot of epoch 1
        let evaluated = training.update(&[-1.]);
        assert!(training.record(2, ConvergenceFlags::CONVERGED, evaluated));
        assert_eq!(training.best(), Some((1, &[1.][..])));

        let outcome = training.finish(party);
        assert_eq!(outcome.params, vec![1.]);
        assert_eq!(outcome.best_iter, Some(1));
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.converged);
    }

    #[test]
    fn test_training_without_epochs() {
        let outcome = Training::new(3, sgd(1.)).finish(PartyId::new(Role::Host, 0));
        assert_eq!(outcome.params, vec![0.; 3]);
        assert_eq!(outcome.best_iter, None);
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.converged);
    }

    fn labeled() -> Dataset {
        Dataset {
            features: vec![vec![1.], vec![-1.]],
            labels: Some(vec![1., 0.]),
        }
    }

    fn unlabeled() -> Dataset {
        Dataset {
            features: vec![vec![0.5, 2.], vec![-1., 0.]],
            labels: None,
        }
    }

    fn mask() -> MaskConfig {
        MaskConfig {
            bound_type: BoundType::B2,
            precision: 8,
        }
    }

    #[tokio::test]
    async fn test_new_checks_parties() {
        let arbiter = PartyId::new(Role::Arbiter, 0);
        let guest = PartyId::new(Role::Guest, 0);
        let host = PartyId::new(Role::Host, 0);
        let mut clients = connect_parties(&[arbiter, host], &settings()).await;

        // no guest
        let host_client = clients.pop().unwrap();
        let arbiter_client = clients.pop().unwrap();
        let err = DataParty::new(host_client, unlabeled(), ProtocolSettings::default(), mask())
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::Precondition(_)));
        let err = DataParty::new(arbiter_client, labeled(), ProtocolSettings::default(), mask())
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::Precondition(_)));

        let mut clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        let host = DataParty::new(
            clients.pop().unwrap(),
            unlabeled(),
            ProtocolSettings::default(),
            mask(),
        )
        .unwrap();
        let guest = DataParty::new(
            clients.pop().unwrap(),
            labeled(),
            ProtocolSettings::default(),
            mask(),
        )
        .unwrap();
        assert!(guest.is_batch_leader());
        assert!(!host.is_batch_leader());
    }

    #[tokio::test]
    async fn test_new_checks_data() {
        let arbiter = PartyId::new(Role::Arbiter, 0);
        let guest = PartyId::new(Role::Guest, 0);
        let host = PartyId::new(Role::Host, 0);
        let mut clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        let host_client = clients.pop().unwrap();
        let guest_client = clients.pop().unwrap();

        // the host must not hold labels, the guest must
        let err = DataParty::new(host_client, labeled(), ProtocolSettings::default(), mask())
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::Precondition(_)));
        let err = DataParty::new(guest_client, unlabeled(), ProtocolSettings::default(), mask())
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::Precondition(_)));

        // features beyond the bound are rejected instead of clamped
        let mut clients = connect_parties(&[arbiter, guest, host], &settings()).await;
        let _ = clients.pop();
        let out_of_bounds = Dataset {
            features: vec![vec![1.], vec![-250.]],
            labels: Some(vec![1., 0.]),
        };
        let err = DataParty::new(
            clients.pop().unwrap(),
            out_of_bounds,
            ProtocolSettings::default(),
            mask(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            ProtocolError::Mask(MaskError::OutOfBounds { index: 0 })
        ));
    }
}
