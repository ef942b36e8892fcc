use crate::{
    channel::{PartyId, Role},
    fanout::tests::{connect_parties, settings as channel_settings},
    mask::{BoundType, MaskConfig},
    protocol::{
        check_roles,
        linear_predictors,
        taylor_loss,
        taylor_residual,
        Arbiter,
        ArbiterOutcome,
        BatchGenerator,
        ConvergenceChecker,
        DataParty,
        Dataset,
        Optimizer,
        PartyOutcome,
        ProtocolError,
        Training,
    },
    settings::{OptimizerKind, ProtocolSettings},
};

const ROWS: usize = 12;

fn protocol_settings() -> ProtocolSettings {
    ProtocolSettings {
        key_length: 256,
        max_iter: 6,
        tol: 1e-4,
        n_iter_no_change: 100,
        batch_size: 8,
        learning_rate: 0.3,
        optimizer: OptimizerKind::Momentum,
        seed: Some(17),
        ..ProtocolSettings::default()
    }
}

fn mask() -> MaskConfig {
    MaskConfig {
        bound_type: BoundType::B2,
        precision: 8,
    }
}

fn label(row: usize) -> f64 {
    if row % 3 == 0 {
        0.
    } else {
        1.
    }
}

fn guest_data() -> Dataset {
    Dataset {
        features: (0..ROWS)
            .map(|i| {
                vec![
                    i as f64 / ROWS as f64 - 0.5,
                    ((i * 5) % ROWS) as f64 / ROWS as f64,
                ]
            })
            .collect(),
        labels: Some((0..ROWS).map(label).collect()),
    }
}

fn host_data(rows: usize) -> Dataset {
    Dataset {
        features: (0..rows)
            .map(|i| {
                let x = ((i * 7) % ROWS) as f64 / ROWS as f64 - 0.25;
                // the host's feature is informative about the label
                vec![x, label(i) - 0.5]
            })
            .collect(),
        labels: None,
    }
}

fn parties() -> [PartyId; 3] {
    [
        PartyId::new(Role::Arbiter, 0),
        PartyId::new(Role::Guest, 0),
        PartyId::new(Role::Host, 0),
    ]
}

/// Computes the mean gradient of the `rows` for the given residuals.
fn gradient(rows: &[&[f64]], residuals: &[f64], intercept: bool) -> Vec<f64> {
    let n = rows.len() as f64;
    let mut gradient = (0..rows[0].len())
        .map(|j| {
            rows.iter()
                .zip(residuals)
                .map(|(row, d)| d * row[j])
                .sum::<f64>()
                / n
        })
        .collect::<Vec<_>>();
    if intercept {
        gradient.push(residuals.iter().sum::<f64>() / n);
    }
    gradient
}

/// Trains the joint model in the clear, exactly as the parties do under encryption.
fn simulate(
    settings: &ProtocolSettings,
    guest: &Dataset,
    host: &Dataset,
) -> (Training, Training, Vec<f64>) {
    let mut batches = BatchGenerator::new(ROWS, settings.batch_size, settings.seed);
    let mut checker = ConvergenceChecker::new(settings);
    let mut guest_training = Training::new(guest.n_params(), Optimizer::new(settings));
    let mut host_training = Training::new(host.n_params(), Optimizer::new(settings));
    let mut losses = Vec::new();
    for epoch in 0..settings.max_iter {
        let batch = batches.next_batch();
        let u_g = linear_predictors(guest, guest_training.params(), &batch).unwrap();
        let u_h = linear_predictors(host, host_training.params(), &batch).unwrap();
        let labels = guest.batch_labels(&batch).unwrap();
        let u = u_g.iter().zip(&u_h).map(|(g, h)| g + h).collect::<Vec<_>>();
        let residuals = u
            .iter()
            .zip(&labels)
            .map(|(u, y)| taylor_residual(*u, *y))
            .collect::<Vec<_>>();
        let loss = u
            .iter()
            .zip(&labels)
            .map(|(u, y)| taylor_loss(*u, *y))
            .sum::<f64>()
            / batch.len() as f64;
        losses.push(loss);

        let guest_gradient = gradient(&guest.batch_rows(&batch).unwrap(), &residuals, true);
        let host_gradient = gradient(&host.batch_rows(&batch).unwrap(), &residuals, false);
        let flags = checker.check(loss);
        let evaluated = guest_training.update(&guest_gradient);
        guest_training.record(epoch, flags, evaluated);
        let evaluated = host_training.update(&host_gradient);
        if host_training.record(epoch, flags, evaluated) {
            break;
        }
    }
    (guest_training, host_training, losses)
}

/// Runs the protocol with one arbiter, one guest and one host.
async fn run(
    settings: ProtocolSettings,
    guest: Dataset,
    host: Dataset,
) -> (
    Result<ArbiterOutcome, ProtocolError>,
    Result<PartyOutcome, ProtocolError>,
    Result<PartyOutcome, ProtocolError>,
) {
    let [arbiter, guest_id, host_id] = parties();
    let mut clients =
        connect_parties(&[arbiter, guest_id, host_id], &channel_settings()).await;
    let host_party = DataParty::new(clients.pop().unwrap(), host, settings, mask()).unwrap();
    let guest_party = DataParty::new(clients.pop().unwrap(), guest, settings, mask()).unwrap();
    let arbiter_party = Arbiter::new(clients.pop().unwrap(), settings, mask()).unwrap();
    tokio::join!(arbiter_party.run(), guest_party.run(), host_party.run())
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-6, "{:?} != {:?}", actual, expected);
    }
}

fn max_distance(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter()
        .zip(rhs)
        .map(|(l, r)| (l - r).abs())
        .fold(0., f64::max)
}

#[tokio::test]
async fn test_training_run() {
    let [_, guest, host] = parties();
    let settings = protocol_settings();
    let (arbiter_outcome, guest_outcome, host_outcome) =
        run(settings, guest_data(), host_data(ROWS)).await;
    let arbiter_outcome = arbiter_outcome.unwrap();
    let guest_outcome = guest_outcome.unwrap();
    let host_outcome = host_outcome.unwrap();

    let (guest_training, host_training, losses) =
        simulate(&settings, &guest_data(), &host_data(ROWS));
    assert_eq!(arbiter_outcome.iterations, settings.max_iter);
    assert!(!arbiter_outcome.converged);
    assert_close(&arbiter_outcome.losses, &losses);

    let guest_expected = guest_training.finish(guest);
    let host_expected = host_training.finish(host);
    assert_eq!(guest_outcome.party, guest);
    assert_eq!(guest_outcome.iterations, settings.max_iter);
    assert_eq!(guest_outcome.params.len(), 3);
    assert_eq!(host_outcome.params.len(), 2);
    assert_eq!(guest_outcome.best_iter, arbiter_outcome.best_iter);
    assert_eq!(host_outcome.best_iter, arbiter_outcome.best_iter);
    assert_close(&guest_outcome.params, &guest_expected.params);
    assert_close(&host_outcome.params, &host_expected.params);
    assert!(host_outcome.params.iter().any(|theta| *theta != 0.));
}

#[tokio::test]
async fn test_guest_model_depends_on_host_data() {
    let [_, guest, _] = parties();
    let settings = protocol_settings();
    let (_, with_host, _) = run(settings, guest_data(), host_data(ROWS)).await;
    let blank_host = Dataset {
        features: vec![vec![0., 0.]; ROWS],
        labels: None,
    };
    let (arbiter_outcome, without_host, host_outcome) =
        run(settings, guest_data(), blank_host.clone()).await;
    let with_host = with_host.unwrap();
    let without_host = without_host.unwrap();

    // a host without information learns nothing and leaves the guest on its own
    assert_eq!(host_outcome.unwrap().params, vec![0., 0.]);
    let (guest_alone, _, losses) = simulate(&settings, &guest_data(), &blank_host);
    assert_close(&without_host.params, &guest_alone.finish(guest).params);
    assert_close(&arbiter_outcome.unwrap().losses, &losses);

    // the host's features move the guest's weights through the joint residuals
    assert!(max_distance(&with_host.params, &without_host.params) > 1e-4);
}

#[tokio::test]
async fn test_training_converges() {
    let settings = ProtocolSettings {
        max_iter: 50,
        tol: 10.,
        n_iter_no_change: 2,
        ..protocol_settings()
    };
    let (arbiter_outcome, guest_outcome, host_outcome) =
        run(settings, guest_data(), host_data(ROWS)).await;
    let arbiter_outcome = arbiter_outcome.unwrap();
    let guest_outcome = guest_outcome.unwrap();
    let host_outcome = host_outcome.unwrap();

    // no epoch improves by the tolerance, so the run stops after the third epoch
    assert!(arbiter_outcome.converged);
    assert_eq!(arbiter_outcome.iterations, 3);
    assert_eq!(arbiter_outcome.losses.len(), 3);
    assert!(guest_outcome.converged && host_outcome.converged);
    assert_eq!(guest_outcome.iterations, 3);
    assert_eq!(host_outcome.iterations, 3);
    assert_eq!(guest_outcome.best_iter, arbiter_outcome.best_iter);
}

#[tokio::test]
async fn test_failing_party_aborts_run() {
    let [_, _, host] = parties();
    let settings = ProtocolSettings {
        batch_size: 0,
        ..protocol_settings()
    };
    // the host misses rows, so the first full batch fails locally
    let (arbiter_outcome, guest_outcome, host_outcome) =
        run(settings, guest_data(), host_data(4)).await;
    assert!(matches!(host_outcome, Err(ProtocolError::Precondition(_))));
    match guest_outcome {
        Err(ProtocolError::Aborted { party, .. }) => assert_eq!(party, host),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(arbiter_outcome.unwrap_err().is_abort());
}

#[tokio::test]
async fn test_arbiter_checks_parties() {
    let [arbiter, guest, host] = parties();
    let mut clients = connect_parties(&[arbiter, guest], &channel_settings()).await;
    let guest_client = clients.pop().unwrap();
    assert!(matches!(
        Arbiter::new(guest_client, protocol_settings(), mask()),
        Err(ProtocolError::Precondition(_))
    ));
    // the run has no host
    let arbiter_client = clients.pop().unwrap();
    assert!(matches!(
        Arbiter::new(arbiter_client, protocol_settings(), mask()),
        Err(ProtocolError::Precondition(_))
    ));

    let mut clients = connect_parties(&[arbiter, guest, host], &channel_settings()).await;
    let _ = clients.split_off(1);
    assert!(Arbiter::new(clients.pop().unwrap(), protocol_settings(), mask()).is_ok());
}

#[test]
fn test_check_roles() {
    let [arbiter, guest, host] = parties();
    assert_eq!(
        check_roles(&[host, arbiter, guest]).unwrap(),
        (arbiter, guest, host)
    );
    assert!(check_roles(&[arbiter, guest]).is_err());
    let second_host = PartyId::new(Role::Host, 1);
    assert!(matches!(
        check_roles(&[arbiter, guest, host, second_host]),
        Err(ProtocolError::Precondition(_))
    ));
}
