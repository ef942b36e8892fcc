//! Local data and the Taylor-approximated logistic objective.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use std::{convert::TryFrom, f64::consts::LN_2, fs, path::Path};

use anyhow::Context;
use serde::Deserialize;

use crate::protocol::ProtocolError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// The local partition of a dataset.
///
/// Partitions of the parties of a run are row-aligned: row `i` of every partition belongs to the
/// same sample. Only the guest holds the labels.
///
/// # Examples
///
/// **JSON**
/// ```text
/// {
///   "features": [[0.5, 1.25], [-1.0, 0.0]],
///   "labels": [1.0, 0.0]
/// }
/// ```
pub struct Dataset {
    pub features: Vec<Vec<f64>>,
    /// Binary labels, `0` or `1`.
    #[serde(default)]
    pub labels: Option<Vec<f64>>,
}

impl Dataset {
    /// Loads a dataset from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read the dataset {}", path.display()))?;
        let dataset: Dataset = serde_json::from_str(&raw)
            .with_context(|| format!("invalid dataset {}", path.display()))?;
        dataset.check()?;
        Ok(dataset)
    }

    pub fn rows(&self) -> usize {
        self.features.len()
    }

    pub fn n_features(&self) -> usize {
        self.features.first().map(Vec::len).unwrap_or_default()
    }

    pub fn is_labeled(&self) -> bool {
        self.labels.is_some()
    }

    /// The number of model parameters: one weight per feature, followed by the intercept if the
    /// dataset is labeled.
    pub fn n_params(&self) -> usize {
        self.n_features() + usize::from(self.is_labeled())
    }

    /// Checks that the dataset is non-empty and rectangular, with finite features and binary
    /// labels for every row.
    pub fn check(&self) -> Result<(), ProtocolError> {
        if self.rows() == 0 {
            return Err(ProtocolError::Precondition("empty dataset".into()));
        }
        if let Some(labels) = &self.labels {
            if labels.len() != self.rows() {
                return Err(ProtocolError::Precondition(format!(
                    "{} rows of features but {} labels",
                    self.rows(),
                    labels.len()
                )));
            }
            if labels.iter().any(|y| *y != 0. && *y != 1.) {
                return Err(ProtocolError::Precondition("labels must be 0 or 1".into()));
            }
        }
        let width = self.n_features();
        if let Some(row) = self.features.iter().position(|row| row.len() != width) {
            return Err(ProtocolError::Precondition(format!(
                "row {} has {} features instead of {}",
                row,
                self.features[row].len(),
                width
            )));
        }
        if self.features.iter().flatten().any(|x| !x.is_finite()) {
            return Err(ProtocolError::Precondition("non-finite feature".into()));
        }
        Ok(())
    }

    /// Gets the feature rows of the `batch`.
    ///
    /// # Errors
    /// Fails if the batch is empty or refers to rows the dataset doesn't have.
    pub fn batch_rows(&self, batch: &[u64]) -> Result<Vec<&[f64]>, ProtocolError> {
        if batch.is_empty() {
            return Err(ProtocolError::Precondition("empty batch".into()));
        }
        batch
            .iter()
            .map(|index| {
                usize::try_from(*index)
                    .ok()
                    .and_then(|i| self.features.get(i))
                    .map(Vec::as_slice)
                    .ok_or_else(|| {
                        ProtocolError::Precondition(format!(
                            "batch row {} exceeds the {} local rows",
                            index,
                            self.rows()
                        ))
                    })
            })
            .collect()
    }

    /// Gets the labels of the `batch`.
    ///
    /// # Errors
    /// Fails if the dataset is unlabeled or the batch is invalid.
    pub fn batch_labels(&self, batch: &[u64]) -> Result<Vec<f64>, ProtocolError> {
        let labels = self
            .labels
            .as_ref()
            .ok_or_else(|| ProtocolError::Precondition("the dataset has no labels".into()))?;
        self.batch_rows(batch)?;
        // safe indexing: batch_rows checked every index
        Ok(batch.iter().map(|index| labels[*index as usize]).collect())
    }
}

/// Computes the local part of the linear predictor of every `batch` row.
///
/// `params` holds one weight per feature, followed by the intercept if the dataset is labeled.
///
/// # Errors
/// Fails if the parameters don't fit the dataset or the batch is invalid.
pub fn linear_predictors(
    data: &Dataset,
    params: &[f64],
    batch: &[u64],
) -> Result<Vec<f64>, ProtocolError> {
    if params.len() != data.n_params() {
        return Err(ProtocolError::Precondition(format!(
            "{} parameters for {} features",
            params.len(),
            data.n_features()
        )));
    }
    let (weights, intercept) = if data.is_labeled() {
        match params.split_last() {
            Some((intercept, weights)) => (weights, *intercept),
            None => (params, 0.),
        }
    } else {
        (params, 0.)
    };
    Ok(data
        .batch_rows(batch)?
        .into_iter()
        .map(|row| weights.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() + intercept)
        .collect())
}

/// Maps a binary label to `-1` or `1`.
fn signed_label(label: f64) -> f64 {
    2. * label - 1.
}

/// Computes the second order Taylor expansion of the logistic loss at zero,
/// `ln 2 - y' u / 2 + u^2 / 8` with `y' = 2 y - 1`.
pub fn taylor_loss(u: f64, label: f64) -> f64 {
    LN_2 - 0.5 * signed_label(label) * u + 0.125 * u * u
}

/// Computes the derivative of [`taylor_loss()`] with respect to the predictor `u`.
pub fn taylor_residual(u: f64, label: f64) -> f64 {
    0.25 * u - 0.5 * signed_label(label)
}
