use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::types::PlayerId;

/// Pair players onto prompt slots so that everyone writes `per_player`
/// answers. Produces `⌈n·per_player/2⌉` pairs of distinct players; when the
/// total is odd one player absorbs a bonus assignment.
///
/// Greedy by remaining need, shuffled within each need tier so repeated
/// games produce different matchups.
pub fn assign_pairs(player_ids: &[PlayerId], per_player: usize) -> Vec<(PlayerId, PlayerId)> {
    let total = player_ids.len() * per_player;
    let slots = total.div_ceil(2);

    let mut need: HashMap<&PlayerId, usize> =
        player_ids.iter().map(|id| (id, per_player)).collect();
    let mut rng = rand::rng();
    let mut pairs = Vec::with_capacity(slots);

    for _ in 0..slots {
        let max_need = need.values().copied().max().unwrap_or(0);

        let mut top: Vec<&PlayerId> = player_ids
            .iter()
            .filter(|id| need[id] == max_need)
            .collect();
        top.shuffle(&mut rng);

        let first = top[0];
        let second = if top.len() >= 2 {
            top[1]
        } else {
            // Only one player left at max need; borrow a partner from the
            // next tier, who accepts a bonus assignment.
            let next_need = need
                .iter()
                .filter(|(id, _)| ***id != *first)
                .map(|(_, n)| *n)
                .max()
                .unwrap_or(0);
            let mut tier: Vec<&PlayerId> = player_ids
                .iter()
                .filter(|id| *id != first && need[id] == next_need)
                .collect();
            tier.shuffle(&mut rng);
            tier[0]
        };

        *need.get_mut(first).unwrap() = need[first].saturating_sub(1);
        *need.get_mut(second).unwrap() = need[second].saturating_sub(1);

        pairs.push((first.clone(), second.clone()));
    }

    let leftover: usize = need.values().sum();
    if leftover != 0 {
        tracing::warn!("Pairing left {} unassigned slots", leftover);
    }

    pairs
}
