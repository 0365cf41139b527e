use std::collections::HashMap;

use crate::config::{LAST_LASH_FIRST, NO_ANSWER, POINTS_PER_VOTE, QUIPWIT_BONUS, SKIPPED};
use crate::types::{FinaleAnswer, Matchup, PlayerId};

/// Outcome of a single matchup, independent of player identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchupOutcome {
    pub player1_points: u32,
    pub player2_points: u32,
    pub is_jinx: bool,
    /// Which side swept the vote, when one did.
    pub quipwit: Option<u8>,
}

fn canonical(answer: &str) -> String {
    answer.trim().to_lowercase()
}

fn is_sentinel(answer: &str) -> bool {
    let c = canonical(answer);
    c == canonical(NO_ANSWER) || c == canonical(SKIPPED)
}

/// Score one matchup from its two answers and vote counts.
///
/// Matching answers are a Jinx and score nothing, unless both sides simply
/// failed to answer. A unanimous vote earns the swept side the QuipWit
/// bonus; sentinel answers never earn it.
pub fn score_matchup(answer1: &str, answer2: &str, votes1: u32, votes2: u32) -> MatchupOutcome {
    if canonical(answer1) == canonical(answer2) && !is_sentinel(answer1) {
        return MatchupOutcome {
            player1_points: 0,
            player2_points: 0,
            is_jinx: true,
            quipwit: None,
        };
    }

    let mut p1 = votes1 * POINTS_PER_VOTE;
    let mut p2 = votes2 * POINTS_PER_VOTE;
    let mut quipwit = None;

    let total = votes1 + votes2;
    if total > 0 {
        if votes2 == 0 && !is_sentinel(answer1) {
            p1 += QUIPWIT_BONUS;
            quipwit = Some(1);
        } else if votes1 == 0 && !is_sentinel(answer2) {
            p2 += QUIPWIT_BONUS;
            quipwit = Some(2);
        }
    }

    MatchupOutcome {
        player1_points: p1,
        player2_points: p2,
        is_jinx: false,
        quipwit,
    }
}

/// Apply a matchup outcome back onto the matchup record and the running
/// score totals.
pub fn apply_matchup_outcome(
    matchup: &mut Matchup,
    outcome: &MatchupOutcome,
    scores: &mut HashMap<PlayerId, u32>,
) {
    matchup.is_jinx = outcome.is_jinx;
    matchup.quipwit = outcome.quipwit;
    *scores.entry(matchup.player1_id.clone()).or_insert(0) += outcome.player1_points;
    *scores.entry(matchup.player2_id.clone()).or_insert(0) += outcome.player2_points;
}

/// Score the finale: plurality voting, one vote per player.
///
/// Every author earns points per vote received; the authors tied at the
/// non-zero maximum additionally earn the winner bonus and are flagged.
pub fn score_finale(
    answers: &mut [FinaleAnswer],
    votes: &HashMap<PlayerId, PlayerId>,
    scores: &mut HashMap<PlayerId, u32>,
) {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for voted_for in votes.values() {
        *counts.entry(voted_for.as_str()).or_insert(0) += 1;
    }

    for answer in answers.iter_mut() {
        answer.votes = counts.get(answer.player_id.as_str()).copied().unwrap_or(0);
    }

    let max_votes = answers.iter().map(|a| a.votes).max().unwrap_or(0);

    for answer in answers.iter_mut() {
        answer.points = answer.votes * POINTS_PER_VOTE;
        answer.is_winner = max_votes > 0 && answer.votes == max_votes;
        if answer.is_winner {
            answer.points += LAST_LASH_FIRST;
        }
        *scores.entry(answer.player_id.clone()).or_insert(0) += answer.points;
    }
}

/// Everyone whose score equals the maximum. Empty iff there are no entries.
pub fn winners<'a>(
    join_order: impl Iterator<Item = &'a PlayerId>,
    scores: &HashMap<PlayerId, u32>,
) -> Vec<PlayerId> {
    let ordered: Vec<&PlayerId> = join_order.collect();
    let max = ordered
        .iter()
        .map(|id| scores.get(*id).copied().unwrap_or(0))
        .max();
    match max {
        Some(max) => ordered
            .into_iter()
            .filter(|id| scores.get(*id).copied().unwrap_or(0) == max)
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unanimous_vote_is_a_quipwit() {
        // Two voters both choosing answer 1.
        let outcome = score_matchup("a", "b", 2, 0);
        assert_eq!(outcome.player1_points, 2 * POINTS_PER_VOTE + QUIPWIT_BONUS);
        assert_eq!(outcome.player2_points, 0);
        assert!(!outcome.is_jinx);
        assert_eq!(outcome.quipwit, Some(1));
    }

    #[test]
    fn split_vote_has_no_bonus() {
        let outcome = score_matchup("a", "b", 2, 1);
        assert_eq!(outcome.player1_points, 200);
        assert_eq!(outcome.player2_points, 100);
        assert_eq!(outcome.quipwit, None);
    }

    #[test]
    fn matching_answers_are_a_jinx() {
        let outcome = score_matchup("Hello World", "hello world", 3, 1);
        assert!(outcome.is_jinx);
        assert_eq!(outcome.player1_points, 0);
        assert_eq!(outcome.player2_points, 0);
        assert_eq!(outcome.quipwit, None);
    }

    #[test]
    fn jinx_ignores_surrounding_whitespace() {
        let outcome = score_matchup("  taco  ", "TACO", 0, 0);
        assert!(outcome.is_jinx);
    }

    #[test]
    fn missing_answers_do_not_jinx() {
        // Both timed out: not a jinx, votes still pay out, no bonus.
        let outcome = score_matchup(NO_ANSWER, NO_ANSWER, 2, 0);
        assert!(!outcome.is_jinx);
        assert_eq!(outcome.player1_points, 200);
        assert_eq!(outcome.player2_points, 0);
        assert_eq!(outcome.quipwit, None);
    }

    #[test]
    fn sweeping_a_missing_answer_still_pays_bonus() {
        let outcome = score_matchup("a real answer", NO_ANSWER, 3, 0);
        assert_eq!(outcome.player1_points, 300 + QUIPWIT_BONUS);
        assert_eq!(outcome.quipwit, Some(1));
    }

    #[test]
    fn outcome_depends_only_on_answers_and_votes() {
        let a = score_matchup("x", "y", 1, 2);
        let b = score_matchup("x", "y", 1, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn vote_counts_are_symmetric() {
        let a = score_matchup("x", "y", 1, 2);
        let b = score_matchup("y", "x", 2, 1);
        assert_eq!(a.player1_points, b.player2_points);
        assert_eq!(a.player2_points, b.player1_points);
    }

    fn finale_answer(player_id: &str, answer: &str) -> FinaleAnswer {
        FinaleAnswer {
            player_id: player_id.to_string(),
            answer: answer.to_string(),
            points: 0,
            votes: 0,
            is_winner: false,
            validation_warning: None,
        }
    }

    #[test]
    fn finale_unanimous_winner() {
        // Four players; three voters all pick player a.
        let mut answers = vec![
            finale_answer("a", "A"),
            finale_answer("b", "B"),
            finale_answer("c", "C"),
            finale_answer("d", "D"),
        ];
        let mut votes = HashMap::new();
        votes.insert("b".to_string(), "a".to_string());
        votes.insert("c".to_string(), "a".to_string());
        votes.insert("d".to_string(), "a".to_string());

        let mut scores = HashMap::new();
        score_finale(&mut answers, &votes, &mut scores);

        assert_eq!(scores["a"], 3 * POINTS_PER_VOTE + LAST_LASH_FIRST);
        assert_eq!(scores.get("b").copied().unwrap_or(0), 0);
        assert_eq!(scores.get("c").copied().unwrap_or(0), 0);
        assert_eq!(scores.get("d").copied().unwrap_or(0), 0);
        assert!(answers[0].is_winner);
        assert!(!answers[1].is_winner);
    }

    #[test]
    fn finale_tie_flags_both_winners() {
        let mut answers = vec![
            finale_answer("a", "A"),
            finale_answer("b", "B"),
            finale_answer("c", "C"),
        ];
        let mut votes = HashMap::new();
        votes.insert("c".to_string(), "a".to_string());
        votes.insert("a".to_string(), "b".to_string());
        votes.insert("b".to_string(), "a".to_string());

        let mut scores = HashMap::new();
        score_finale(&mut answers, &votes, &mut scores);

        // a has 2 votes, b has 1: only a wins.
        assert!(answers[0].is_winner);
        assert!(!answers[1].is_winner);

        // Now a genuine tie.
        let mut answers = vec![finale_answer("a", "A"), finale_answer("b", "B")];
        let mut votes = HashMap::new();
        votes.insert("x".to_string(), "a".to_string());
        votes.insert("y".to_string(), "b".to_string());
        let mut scores = HashMap::new();
        score_finale(&mut answers, &votes, &mut scores);
        assert!(answers[0].is_winner && answers[1].is_winner);
        assert_eq!(scores["a"], POINTS_PER_VOTE + LAST_LASH_FIRST);
        assert_eq!(scores["b"], POINTS_PER_VOTE + LAST_LASH_FIRST);
    }

    #[test]
    fn finale_with_no_votes_has_no_winner() {
        let mut answers = vec![finale_answer("a", "A"), finale_answer("b", "B")];
        let votes = HashMap::new();
        let mut scores = HashMap::new();
        score_finale(&mut answers, &votes, &mut scores);
        assert!(answers.iter().all(|a| !a.is_winner && a.points == 0));
    }

    #[test]
    fn winners_breaks_nothing_on_ties() {
        let order: Vec<PlayerId> = vec!["p0", "p1", "p2", "p3"]
            .into_iter()
            .map(String::from)
            .collect();
        let mut scores = HashMap::new();
        scores.insert("p0".to_string(), 500);
        scores.insert("p1".to_string(), 500);
        scores.insert("p2".to_string(), 300);
        scores.insert("p3".to_string(), 200);

        let w = winners(order.iter(), &scores);
        assert_eq!(w, vec!["p0".to_string(), "p1".to_string()]);
    }

    #[test]
    fn winners_of_empty_room_is_empty() {
        let order: Vec<PlayerId> = Vec::new();
        let scores = HashMap::new();
        assert!(winners(order.iter(), &scores).is_empty());
    }

    #[test]
    fn apply_outcome_accumulates_scores() {
        let mut matchup = Matchup::new(
            "r1_p0".to_string(),
            "prompt".to_string(),
            "a".to_string(),
            "b".to_string(),
        );
        matchup.player1_answer = Some("x".to_string());
        matchup.player2_answer = Some("y".to_string());

        let mut scores = HashMap::new();
        scores.insert("a".to_string(), 100);
        scores.insert("b".to_string(), 0);

        let outcome = score_matchup("x", "y", 2, 0);
        apply_matchup_outcome(&mut matchup, &outcome, &mut scores);

        assert_eq!(scores["a"], 100 + 200 + QUIPWIT_BONUS);
        assert_eq!(scores["b"], 0);
        assert_eq!(matchup.quipwit, Some(1));
    }
}
