// backend/api/src/tally.rs
//
// Milestone approval arithmetic.
//
// A milestone is approved only when BOTH hold strictly:
//   yes_votes   / total_votes > 1/2   (headcount)
//   yes_power   / total_power > 1/2   (contribution-weighted)
//
// `yes_power` sums every backer entry whose address currently votes yes, so
// an address that backed twice weighs the sum of both contributions.
// `total_power` is the sum over all backers, voters or not.

use std::collections::HashSet;

use crate::types::{Backer, Vote, VoteChoice, WalletAddress};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tally {
    pub yes_votes: usize,
    pub total_votes: usize,
    pub yes_power: f64,
    pub total_power: f64,
}

impl Tally {
    pub fn compute(backers: &[Backer], votes: &[Vote]) -> Self {
        let yes_voters: HashSet<&WalletAddress> = votes
            .iter()
            .filter(|v| v.vote == VoteChoice::Yes)
            .map(|v| &v.address)
            .collect();

        let (yes_power, total_power) =
            backers.iter().fold((0.0, 0.0), |(yes, total), backer| {
                let weight = if yes_voters.contains(&backer.address) {
                    backer.amount
                } else {
                    0.0
                };
                (yes + weight, total + backer.amount)
            });

        Self {
            yes_votes: yes_voters.len(),
            total_votes: votes.len(),
            yes_power,
            total_power,
        }
    }

    pub fn headcount_ratio(&self) -> Option<f64> {
        (self.total_votes > 0).then(|| self.yes_votes as f64 / self.total_votes as f64)
    }

    pub fn power_ratio(&self) -> Option<f64> {
        (self.total_power > 0.0).then(|| self.yes_power / self.total_power)
    }

    /// Strict majority on both axes. An exact half never passes.
    pub fn approves(&self) -> bool {
        let headcount = self.total_votes > 0 && self.yes_votes * 2 > self.total_votes;
        let power = self.total_power > 0.0 && self.yes_power * 2.0 > self.total_power;
        headcount && power
    }
}
