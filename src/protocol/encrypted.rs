//! Homomorphic computation of the joint loss and gradients.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use num::bigint::BigUint;

use crate::{
    crypto::{Ciphertext, PublicKey},
    mask::MaskConfig,
    protocol::{
        model::{taylor_loss, taylor_residual},
        ProtocolError,
    },
};

/// The factor between the Taylor residual and the exchanged fore gradient, `4 d = u - 2 y'`.
const RESIDUAL_SCALE: f64 = 4.;
/// The factor between the Taylor loss and the exchanged loss, `8 l = 8 ln 2 - 4 y' u + u^2`.
const LOSS_SCALE: f64 = 8.;

#[derive(Clone, Debug)]
/// Encodes and combines values under the public key of a run.
pub struct Cipher {
    public: PublicKey,
    config: MaskConfig,
}

impl Cipher {
    pub fn new(public: PublicKey, config: MaskConfig) -> Self {
        Self { public, config }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn encode(&self, value: f64, degree: u8) -> Result<BigUint, ProtocolError> {
        Ok(self.config.encode(value, degree, self.public.n())?)
    }

    fn encrypt(&self, value: f64, degree: u8) -> Result<Ciphertext, ProtocolError> {
        let encoded = self.encode(value, degree)?;
        Ok(self.public.encrypt(&encoded)?)
    }

    fn sum(&self, ciphertexts: &[Ciphertext]) -> Result<Ciphertext, ProtocolError> {
        self.public
            .sum(ciphertexts)
            .ok_or_else(|| ProtocolError::Precondition("nothing to sum up".into()))
    }

    /// Encrypts the host's predictors `u_h`, followed by their squares.
    pub fn encrypt_forward(&self, predictors: &[f64]) -> Result<Vec<Ciphertext>, ProtocolError> {
        let linear = predictors.iter().map(|u| self.encrypt(*u, 1));
        let squares = predictors.iter().map(|u| self.encrypt(u * u, 2));
        linear.chain(squares).collect()
    }

    /// Splits the host's forward values into the encrypted predictors and their squares.
    fn split_forward<'f>(
        forward: &'f [Ciphertext],
        rows: usize,
    ) -> Result<(&'f [Ciphertext], &'f [Ciphertext]), ProtocolError> {
        if forward.len() != 2 * rows {
            return Err(ProtocolError::Precondition(format!(
                "{} forward values for a batch of {} rows",
                forward.len(),
                rows
            )));
        }
        Ok(forward.split_at(rows))
    }

    /// Computes the encrypted fore gradient `4 d_i = u_i - 2 y'_i` of every row from the guest's
    /// `predictors` and `labels` and the host's `forward` values.
    pub fn fore_gradient(
        &self,
        forward: &[Ciphertext],
        predictors: &[f64],
        labels: &[f64],
    ) -> Result<Vec<Ciphertext>, ProtocolError> {
        let (host_predictors, _) = Self::split_forward(forward, predictors.len())?;
        host_predictors
            .iter()
            .zip(predictors.iter().zip(labels))
            .map(|(host, (u, y))| {
                let guest = self.encrypt(RESIDUAL_SCALE * taylor_residual(*u, *y), 1)?;
                Ok(self.public.add(host, &guest))
            })
            .collect()
    }

    /// Computes the encrypted batch loss `sum_i 8 l_i` at degree 2.
    ///
    /// With `u = u_g + u_h`, the scaled loss of a row splits into the guest's local part
    /// `8 l(u_g)`, the cross term `u_h * 8 d(u_g)` and the host's square `u_h^2`.
    pub fn loss(
        &self,
        forward: &[Ciphertext],
        predictors: &[f64],
        labels: &[f64],
    ) -> Result<Ciphertext, ProtocolError> {
        let (host_predictors, host_squares) = Self::split_forward(forward, predictors.len())?;
        let local = predictors
            .iter()
            .zip(labels)
            .map(|(u, y)| taylor_loss(*u, *y))
            .sum::<f64>();
        let mut terms = vec![self.encrypt(LOSS_SCALE * local, 2)?];
        for (host, (u, y)) in host_predictors.iter().zip(predictors.iter().zip(labels)) {
            let factor = self.encode(LOSS_SCALE * taylor_residual(*u, *y), 1)?;
            terms.push(self.public.mul_plain(host, &factor));
        }
        terms.extend_from_slice(host_squares);
        self.sum(&terms)
    }

    /// Computes the encrypted gradient `sum_i 4 d_i x_ij` of every local feature at degree 2,
    /// followed by `sum_i 4 d_i` if the party owns the `intercept`.
    pub fn gradient(
        &self,
        fore: &[Ciphertext],
        rows: &[&[f64]],
        intercept: bool,
    ) -> Result<Vec<Ciphertext>, ProtocolError> {
        if fore.len() != rows.len() {
            return Err(ProtocolError::Precondition(format!(
                "{} fore gradients for a batch of {} rows",
                fore.len(),
                rows.len()
            )));
        }
        let n_features = rows.first().map(|row| row.len()).unwrap_or_default();
        let mut gradient = (0..n_features)
            .map(|j| {
                let terms = fore
                    .iter()
                    .zip(rows)
                    .map(|(d, row)| Ok(self.public.mul_plain(d, &self.encode(row[j], 1)?)))
                    .collect::<Result<Vec<_>, ProtocolError>>()?;
                self.sum(&terms)
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        if intercept {
            let one = self.encode(1., 1)?;
            let terms = fore
                .iter()
                .map(|d| self.public.mul_plain(d, &one))
                .collect::<Vec<_>>();
            gradient.push(self.sum(&terms)?);
        }
        Ok(gradient)
    }

    /// Decodes an unmasked gradient of a batch of `rows` rows.
    pub fn decode_gradient(
        &self,
        encoded: &[BigUint],
        rows: usize,
    ) -> Result<Vec<f64>, ProtocolError> {
        let denom = RESIDUAL_SCALE * rows as f64;
        encoded
            .iter()
            .map(|g| Ok(self.config.decode(g, 2, self.public.n())? / denom))
            .collect()
    }

    /// Decodes the decrypted loss of a batch of `rows` rows into the mean loss.
    pub fn decode_loss(&self, encoded: &BigUint, rows: usize) -> Result<f64, ProtocolError> {
        Ok(self.config.decode(encoded, 2, self.public.n())? / (LOSS_SCALE * rows as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyPair,
        mask::BoundType,
        protocol::model::{linear_predictors, Dataset},
    };

    fn config() -> MaskConfig {
        MaskConfig {
            bound_type: BoundType::B2,
            precision: 8,
        }
    }

    fn guest() -> Dataset {
        Dataset {
            features: vec![vec![1.0, -0.5], vec![0.25, 2.0], vec![-1.5, 0.0]],
            labels: Some(vec![1.0, 0.0, 1.0]),
        }
    }

    fn host() -> Dataset {
        Dataset {
            features: vec![vec![0.5], vec![-1.0], vec![2.0]],
            labels: None,
        }
    }

    fn decrypt(keys: &KeyPair, ciphertexts: &[Ciphertext]) -> Vec<BigUint> {
        ciphertexts
            .iter()
            .map(|c| keys.secret.decrypt(c).unwrap())
            .collect()
    }

    #[test]
    fn test_joint_loss_and_gradient() {
        let keys = KeyPair::generate(256).unwrap();
        let cipher = Cipher::new(keys.public.clone(), config());
        let (guest, host) = (guest(), host());
        let guest_params = [0.3, -0.2, 0.1];
        let host_params = [0.7];
        let batch = [0, 2, 1];

        let u_g = linear_predictors(&guest, &guest_params, &batch).unwrap();
        let u_h = linear_predictors(&host, &host_params, &batch).unwrap();
        let labels = guest.batch_labels(&batch).unwrap();

        let forward = cipher.encrypt_forward(&u_h).unwrap();
        let fore = cipher.fore_gradient(&forward, &u_g, &labels).unwrap();
        let loss = cipher.loss(&forward, &u_g, &labels).unwrap();
        let guest_gradient = cipher
            .gradient(&fore, &guest.batch_rows(&batch).unwrap(), true)
            .unwrap();
        let host_gradient = cipher
            .gradient(&fore, &host.batch_rows(&batch).unwrap(), false)
            .unwrap();
        assert_eq!(guest_gradient.len(), 3);
        assert_eq!(host_gradient.len(), 1);

        // the same objective in the clear on the joint predictors
        let u = u_g.iter().zip(&u_h).map(|(g, h)| g + h).collect::<Vec<_>>();
        let d = u
            .iter()
            .zip(&labels)
            .map(|(u, y)| taylor_residual(*u, *y))
            .collect::<Vec<_>>();
        let rows = batch.len() as f64;
        let expected_loss = u
            .iter()
            .zip(&labels)
            .map(|(u, y)| taylor_loss(*u, *y))
            .sum::<f64>()
            / rows;
        let guest_rows = guest.batch_rows(&batch).unwrap();
        let host_rows = host.batch_rows(&batch).unwrap();
        let mut expected_guest = (0..2)
            .map(|j| d.iter().zip(&guest_rows).map(|(d, x)| d * x[j]).sum::<f64>() / rows)
            .collect::<Vec<_>>();
        expected_guest.push(d.iter().sum::<f64>() / rows);
        let expected_host = vec![
            d.iter()
                .zip(&host_rows)
                .map(|(d, x)| d * x[0])
                .sum::<f64>()
                / rows,
        ];

        let decrypted_loss = keys.secret.decrypt(&loss).unwrap();
        let actual_loss = cipher.decode_loss(&decrypted_loss, batch.len()).unwrap();
        assert!((actual_loss - expected_loss).abs() < 1e-7);
        let actual_guest = cipher
            .decode_gradient(&decrypt(&keys, &guest_gradient), batch.len())
            .unwrap();
        let actual_host = cipher
            .decode_gradient(&decrypt(&keys, &host_gradient), batch.len())
            .unwrap();
        for (a, e) in actual_guest
            .iter()
            .chain(&actual_host)
            .zip(expected_guest.iter().chain(&expected_host))
        {
            assert!((a - e).abs() < 1e-7, "{} != {}", a, e);
        }
    }

    #[test]
    fn test_guest_gradient_depends_on_host_predictors() {
        let keys = KeyPair::generate(256).unwrap();
        let cipher = Cipher::new(keys.public.clone(), config());
        let guest = guest();
        let batch = [0, 1, 2];
        let u_g = linear_predictors(&guest, &[0.; 3], &batch).unwrap();
        let labels = guest.batch_labels(&batch).unwrap();
        let rows = guest.batch_rows(&batch).unwrap();

        let gradient_for = |u_h: &[f64]| {
            let forward = cipher.encrypt_forward(u_h).unwrap();
            let fore = cipher.fore_gradient(&forward, &u_g, &labels).unwrap();
            let gradient = cipher.gradient(&fore, &rows, true).unwrap();
            cipher
                .decode_gradient(&decrypt(&keys, &gradient), batch.len())
                .unwrap()
        };
        let without_host = gradient_for(&[0., 0., 0.]);
        let with_host = gradient_for(&[3.0, -2.0, -1.0]);
        // the intercept moves by sum(u_h) / (4 * rows), which is zero here
        assert!((without_host[2] - with_host[2]).abs() < 1e-9);
        // the first weight moves by sum(u_h * x) / (4 * rows) = 4 / 12
        assert!((with_host[0] - without_host[0] - 1. / 3.).abs() < 1e-7);
    }

    #[test]
    fn test_rejects_mismatched_inputs() {
        let keys = KeyPair::generate(256).unwrap();
        let cipher = Cipher::new(keys.public.clone(), config());
        let forward = cipher.encrypt_forward(&[0.5]).unwrap();
        assert_eq!(forward.len(), 2);
        assert!(matches!(
            cipher.fore_gradient(&forward, &[0.1, 0.2], &[1., 0.]),
            Err(ProtocolError::Precondition(_))
        ));
        assert!(matches!(
            cipher.gradient(&forward, &[&[1.0][..]], false),
            Err(ProtocolError::Precondition(_))
        ));
        assert_eq!(cipher.public_key(), &keys.public);
    }
}
