//! Grouping of near-simultaneous job completions.
//!
//! Launches across a fleet are never perfectly simultaneous, so one logical
//! batch shows up as several jobs whose expected completions differ by a few
//! milliseconds. A cluster is found by locating one anchor completion and then
//! growing outward through neighbours (in completion order) for as long as the
//! next neighbour lies within epsilon of the cluster's current edge.

use serde::Serialize;

use crate::context::Millis;

/// A group of completions treated as one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Cluster {
    pub threads: u32,
    /// The cluster edge closest to the queried time.
    pub when: Millis,
}

/// The nearest clusters on either side of a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Around {
    pub before: Option<Cluster>,
    pub after: Option<Cluster>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub when: Millis,
    pub threads: u32,
}

fn sorted(mut completions: Vec<Completion>) -> Vec<Completion> {
    completions.sort_by(|a, b| a.when.total_cmp(&b.when));
    completions
}

/// Inclusive index range of the cluster containing `anchor` in a sorted slice.
fn expand(sorted: &[Completion], anchor: usize, epsilon: Millis) -> (usize, usize) {
    let mut lo = anchor;
    while lo > 0 && sorted[lo].when - sorted[lo - 1].when < epsilon {
        lo -= 1;
    }
    let mut hi = anchor;
    while hi + 1 < sorted.len() && sorted[hi + 1].when - sorted[hi].when < epsilon {
        hi += 1;
    }
    (lo, hi)
}

fn tally(members: &[Completion], pick: fn(Millis, Millis) -> Millis) -> Option<Cluster> {
    let first = members.first()?;
    Some(members.iter().skip(1).fold(
        Cluster {
            threads: first.threads,
            when: first.when,
        },
        |acc, c| Cluster {
            threads: acc.threads + c.threads,
            when: pick(acc.when, c.when),
        },
    ))
}

/// The cluster containing a completion within epsilon of `time`.
pub fn at(completions: Vec<Completion>, time: Millis, epsilon: Millis) -> Option<Cluster> {
    let sorted = sorted(completions);
    let anchor = sorted
        .iter()
        .enumerate()
        .filter(|(_, c)| (c.when - time).abs() < epsilon)
        .min_by(|(_, a), (_, b)| (a.when - time).abs().total_cmp(&(b.when - time).abs()))
        .map(|(i, _)| i)?;
    let (lo, hi) = expand(&sorted, anchor, epsilon);
    tally(&sorted[lo..=hi], Millis::max)
}

/// The latest cluster completing strictly before `time`. Its `when` is its
/// latest member, so `when < time`.
pub fn just_before(completions: Vec<Completion>, time: Millis, epsilon: Millis) -> Option<Cluster> {
    let sorted: Vec<_> = sorted(completions)
        .into_iter()
        .filter(|c| c.when < time)
        .collect();
    let anchor = sorted.len().checked_sub(1)?;
    let (lo, hi) = expand(&sorted, anchor, epsilon);
    tally(&sorted[lo..=hi], Millis::max)
}

/// The earliest cluster completing strictly after `time`. Its `when` is its
/// earliest member, so `when > time`.
pub fn just_after(completions: Vec<Completion>, time: Millis, epsilon: Millis) -> Option<Cluster> {
    let sorted: Vec<_> = sorted(completions)
        .into_iter()
        .filter(|c| c.when > time)
        .collect();
    if sorted.is_empty() {
        return None;
    }
    let (lo, hi) = expand(&sorted, 0, epsilon);
    tally(&sorted[lo..=hi], Millis::min)
}

pub fn just_around(completions: Vec<Completion>, time: Millis, epsilon: Millis) -> Around {
    Around {
        before: just_before(completions.clone(), time, epsilon),
        after: just_after(completions, time, epsilon),
    }
}

/// Threads completing within `[from, until]`.
pub fn between(completions: &[Completion], from: Millis, until: Millis) -> u32 {
    completions
        .iter()
        .filter(|c| c.when >= from && c.when <= until)
        .map(|c| c.threads)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(when: Millis, threads: u32) -> Completion {
        Completion { when, threads }
    }

    #[test]
    fn at_chains_through_neighbours() {
        // 1000, 1030, 1060 chain within epsilon 50; 1200 is separate.
        let completions = vec![c(1060.0, 1), c(1000.0, 2), c(1200.0, 8), c(1030.0, 4)];
        let cluster = at(completions, 1010.0, 50.0).unwrap();
        assert_eq!(cluster.threads, 7);
        assert_eq!(cluster.when, 1060.0);
    }

    #[test]
    fn at_misses_when_nothing_close() {
        let completions = vec![c(1000.0, 2), c(1200.0, 8)];
        assert!(at(completions, 1100.0, 50.0).is_none());
    }

    #[test]
    fn around_brackets_the_time() {
        let completions = vec![
            c(900.0, 3),
            c(920.0, 1),
            c(1100.0, 5),
            c(1130.0, 5),
            c(1400.0, 9),
        ];
        let around = just_around(completions, 1000.0, 50.0);
        let before = around.before.unwrap();
        let after = around.after.unwrap();
        assert_eq!(before.threads, 4);
        assert_eq!(before.when, 920.0);
        assert_eq!(after.threads, 10);
        assert_eq!(after.when, 1100.0);
        assert!(before.when <= 1000.0 && 1000.0 <= after.when);
    }

    #[test]
    fn around_never_crosses_the_time() {
        // 990 and 1010 are within epsilon of each other but sit on both sides.
        let completions = vec![c(990.0, 1), c(1010.0, 2)];
        let around = just_around(completions, 1000.0, 50.0);
        assert_eq!(around.before.unwrap().threads, 1);
        assert_eq!(around.after.unwrap().threads, 2);
    }

    #[test]
    fn around_one_sided() {
        let around = just_around(vec![c(1100.0, 5)], 1000.0, 50.0);
        assert!(around.before.is_none());
        assert_eq!(around.after.unwrap().threads, 5);

        let around = just_around(vec![], 1000.0, 50.0);
        assert_eq!(around, Around::default());
    }

    #[test]
    fn between_is_inclusive() {
        let completions = vec![c(100.0, 1), c(200.0, 2), c(300.0, 4)];
        assert_eq!(between(&completions, 100.0, 200.0), 3);
        assert_eq!(between(&completions, 201.0, 299.0), 0);
    }
}
