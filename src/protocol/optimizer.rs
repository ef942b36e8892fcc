//! Parameter update rules.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use crate::settings::{OptimizerKind, ProtocolSettings};

#[derive(Debug, Clone, PartialEq)]
/// Updates the parameters with a gradient. Chosen once per run.
pub enum Optimizer {
    /// `theta -= lr * g`
    Sgd { learning_rate: f64 },
    /// `v = momentum * v - lr * g; theta += v`
    Momentum {
        learning_rate: f64,
        momentum: f64,
        velocity: Vec<f64>,
    },
    /// `theta -= lr / (1 + alpha * lr * t) * g` in step `t`, counting from `0`
    Optimal {
        learning_rate: f64,
        alpha: f64,
        step: u32,
    },
}

impl Optimizer {
    pub fn new(settings: &ProtocolSettings) -> Self {
        let learning_rate = settings.learning_rate;
        match settings.optimizer {
            OptimizerKind::Sgd => Self::Sgd { learning_rate },
            OptimizerKind::Momentum => Self::Momentum {
                learning_rate,
                momentum: settings.momentum,
                velocity: Vec::new(),
            },
            OptimizerKind::Optimal => Self::Optimal {
                learning_rate,
                alpha: settings.alpha,
                step: 0,
            },
        }
    }

    /// Gets the learning rate of the next step.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd { learning_rate } | Self::Momentum { learning_rate, .. } => *learning_rate,
            Self::Optimal {
                learning_rate,
                alpha,
                step,
            } => learning_rate / (1. + alpha * learning_rate * f64::from(*step)),
        }
    }

    /// Applies one update step to the `params`.
    pub fn step(&mut self, params: &mut [f64], gradient: &[f64]) {
        let learning_rate = self.learning_rate();
        match self {
            Self::Sgd { .. } => {
                for (theta, g) in params.iter_mut().zip(gradient) {
                    *theta -= learning_rate * g;
                }
            }
            Self::Momentum {
                momentum, velocity, ..
            } => {
                velocity.resize(params.len(), 0.);
                for ((theta, v), g) in params.iter_mut().zip(velocity.iter_mut()).zip(gradient) {
                    *v = *momentum * *v - learning_rate * g;
                    *theta += *v;
                }
            }
            Self::Optimal { step, .. } => {
                for (theta, g) in params.iter_mut().zip(gradient) {
                    *theta -= learning_rate * g;
                }
                *step += 1;
            }
        }
    }
}
