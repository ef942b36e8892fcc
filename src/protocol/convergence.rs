//! Convergence check of the arbiter.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use crate::{message::ConvergenceFlags, settings::ProtocolSettings};

#[derive(Debug, Clone)]
/// Tracks the aggregated loss of the epochs.
///
/// An epoch improves on the best loss so far if its loss is lower by more than `tol`. The run
/// converges after `n_iter_no_change` consecutive epochs without improvement; with
/// `n_iter_no_change = 1` this is a plain threshold on the loss delta.
pub struct ConvergenceChecker {
    tol: f64,
    n_iter_no_change: u32,
    best_loss: Option<f64>,
    best_iter: Option<u32>,
    no_improvement: u32,
    iterations: u32,
}

impl ConvergenceChecker {
    pub fn new(settings: &ProtocolSettings) -> Self {
        Self {
            tol: settings.tol,
            n_iter_no_change: settings.n_iter_no_change,
            best_loss: None,
            best_iter: None,
            no_improvement: 0,
            iterations: 0,
        }
    }

    /// Records the loss of the next epoch.
    ///
    /// Flags whether the loss is the lowest so far and whether the run has converged.
    pub fn check(&mut self, loss: f64) -> ConvergenceFlags {
        let iteration = self.iterations;
        self.iterations += 1;

        let mut flags = ConvergenceFlags::empty();
        match self.best_loss {
            Some(best) if loss > best - self.tol => self.no_improvement += 1,
            _ => self.no_improvement = 0,
        }
        if self.best_loss.map_or(true, |best| loss < best) {
            self.best_loss = Some(loss);
            self.best_iter = Some(iteration);
            flags |= ConvergenceFlags::BEST_ITER_CHANGED;
        }
        if self.no_improvement >= self.n_iter_no_change {
            flags |= ConvergenceFlags::CONVERGED;
        }
        flags
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    /// Gets the epoch of the best loss, counting from `0`.
    pub fn best_iter(&self) -> Option<u32> {
        self.best_iter
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}
