//! The arbiter's record of one epoch.
//!
//! See the [protocol module] documentation since this is a private module anyways.
//!
//! [protocol module]: crate::protocol

use std::collections::BTreeMap;

use crate::{channel::PartyId, crypto::Ciphertext};

#[derive(Debug, Clone, PartialEq)]
/// The contributions of one epoch, dropped once its convergence status is sent.
pub struct ProtocolRound {
    pub round_index: u32,
    /// The masked and encrypted gradients of the data parties.
    pub masked_contributions: BTreeMap<PartyId, Vec<Ciphertext>>,
    /// The decrypted mean loss of the batch.
    pub aggregate: Option<f64>,
    pub converged: bool,
}

impl ProtocolRound {
    pub fn new(round_index: u32) -> Self {
        Self {
            round_index,
            masked_contributions: BTreeMap::new(),
            aggregate: None,
            converged: false,
        }
    }

    /// Records the masked gradient of a party. Replaces an earlier contribution of the same party.
    pub fn add_contribution(&mut self, party: PartyId, masked: Vec<Ciphertext>) {
        if self.masked_contributions.insert(party, masked).is_some() {
            warn!(
                "contribution of {} replaced in round {}",
                party, self.round_index
            );
        }
    }

    /// Adds a decrypted loss to the aggregate.
    pub fn add_loss(&mut self, loss: f64) {
        self.aggregate = Some(self.aggregate.unwrap_or_default() + loss);
    }

    /// Gets the parties which contributed, in ascending order.
    pub fn contributors(&self) -> Vec<PartyId> {
        self.masked_contributions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use num::BigUint;

    use super::*;
    use crate::channel::Role;

    #[test]
    fn test_round() {
        let guest = PartyId::new(Role::Guest, 0);
        let host = PartyId::new(Role::Host, 0);
        let mut round = ProtocolRound::new(3);
        assert_eq!(round.aggregate, None);

        round.add_contribution(host, vec![Ciphertext::from(BigUint::from(5_u8))]);
        round.add_contribution(guest, vec![]);
        round.add_loss(0.25);
        round.add_loss(0.5);

        assert_eq!(round.contributors(), vec![guest, host]);
        assert_eq!(round.aggregate, Some(0.75));
        assert!(!round.converged);
    }
}
