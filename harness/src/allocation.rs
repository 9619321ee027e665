//! Assignment of machines to participant slots, trial by trial.

use std::{collections::HashSet, ops::Range};

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// Reshuffles tried before accepting a repeat of the previous trial's set.
const MAX_ATTEMPTS: usize = 64;

/// Cycle `pool` from the start until `n` slots are filled.
#[must_use]
pub fn round_robin(pool: &[String], n: usize) -> Vec<String> {
    if pool.is_empty() {
        return Vec::new();
    }
    pool.iter().cycle().take(n).cloned().collect()
}

/// Split `n` participant indices into `k` contiguous chunks whose sizes
/// differ by at most one, larger chunks first.
#[must_use]
pub fn partition(n: usize, k: usize) -> Vec<Range<usize>> {
    if k == 0 {
        return Vec::new();
    }
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Cluster for each participant index, following [`partition`].
#[must_use]
pub fn cluster_assignment(n: usize, clusters: &[String]) -> Vec<String> {
    partition(n, clusters.len())
        .into_iter()
        .zip(clusters)
        .flat_map(|(range, cluster)| std::iter::repeat_n(cluster.clone(), range.len()))
        .collect()
}

/// Produces the participant machines for successive trials.
///
/// Without shuffling every trial gets [`round_robin`]. With shuffling,
/// machines not yet used in this cycle are preferred, so no set repeats until
/// every machine has appeared; then the cycle restarts, avoiding an
/// immediate repeat of the previous set where the pool allows it.
pub struct PartyAllocator {
    pool: Vec<String>,
    n: usize,
    shuffle: bool,
    rng: StdRng,
    covered: HashSet<String>,
    previous: Option<Vec<String>>,
}

impl PartyAllocator {
    #[must_use]
    pub fn new(pool: Vec<String>, n: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            pool,
            n,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            covered: HashSet::new(),
            previous: None,
        }
    }

    /// Machines for the next trial, one per participant index.
    pub fn next_trial(&mut self) -> Vec<String> {
        if !self.shuffle {
            return round_robin(&self.pool, self.n);
        }

        let distinct: HashSet<&String> = self.pool.iter().collect();
        if self.covered.len() >= distinct.len() {
            self.covered.clear();
        }

        let mut pick = Vec::new();
        for _ in 0..MAX_ATTEMPTS {
            let (mut fresh, mut used): (Vec<String>, Vec<String>) = self
                .pool
                .iter()
                .cloned()
                .partition(|m| !self.covered.contains(m));
            fresh.shuffle(&mut self.rng);
            used.shuffle(&mut self.rng);
            fresh.extend(used);
            pick = round_robin(&fresh, self.n);
            if !self.repeats_previous(&pick) {
                break;
            }
        }

        self.covered.extend(pick.iter().cloned());
        let mut key = pick.clone();
        key.sort();
        self.previous = Some(key);
        pick
    }

    fn repeats_previous(&self, pick: &[String]) -> bool {
        let mut key = pick.to_vec();
        key.sort();
        self.previous.as_ref() == Some(&key)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn pool(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("m{i}")).collect()
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_round_robin_short_pool_repeats() {
        assert_eq!(round_robin(&pool(2), 5), ["m1", "m2", "m1", "m2", "m1"]);
    }

    #[test]
    fn test_no_shuffle_same_set_every_trial() {
        let mut allocator = PartyAllocator::new(pool(3), 2, false, 0);
        for _ in 0..4 {
            assert_eq!(allocator.next_trial(), ["m1", "m2"]);
        }
    }

    #[test_case(3, 2, 7 ; "three machines two parties")]
    #[test_case(5, 2, 11 ; "five machines two parties")]
    #[test_case(7, 3, 3 ; "seven machines three parties")]
    fn test_shuffle_no_repeat_before_full_coverage(m: usize, p: usize, seed: u64) {
        let machines = pool(m);
        let mut allocator = PartyAllocator::new(machines.clone(), p, true, seed);
        let mut seen: Vec<Vec<String>> = Vec::new();
        let mut covered = HashSet::new();
        while covered.len() < m {
            let pick = allocator.next_trial();
            assert_eq!(pick.len(), p);
            let key = sorted(pick.clone());
            assert!(!seen.contains(&key), "repeated {key:?} before coverage");
            seen.push(key);
            covered.extend(pick);
        }
        assert!(seen.len() <= m.div_ceil(p));
    }

    #[test]
    fn test_shuffle_avoids_immediate_repeat_after_reset() {
        let mut allocator = PartyAllocator::new(pool(3), 2, true, 42);
        let mut previous = sorted(allocator.next_trial());
        for _ in 0..20 {
            let next = sorted(allocator.next_trial());
            assert_ne!(next, previous);
            previous = next;
        }
    }

    #[test]
    fn test_shuffle_is_deterministic() {
        let mut a = PartyAllocator::new(pool(6), 2, true, 9);
        let mut b = PartyAllocator::new(pool(6), 2, true, 9);
        for _ in 0..6 {
            assert_eq!(a.next_trial(), b.next_trial());
        }
    }

    #[test_case(5, 2, &[3, 2] ; "uneven")]
    #[test_case(6, 3, &[2, 2, 2] ; "even")]
    #[test_case(2, 4, &[1, 1, 0, 0] ; "more clusters than parties")]
    fn test_partition_sizes(n: usize, k: usize, expected: &[usize]) {
        let sizes: Vec<usize> = partition(n, k).iter().map(ExactSizeIterator::len).collect();
        assert_eq!(sizes, expected);
    }

    #[test]
    fn test_cluster_assignment() {
        let clusters = vec!["east".to_string(), "west".to_string()];
        assert_eq!(
            cluster_assignment(3, &clusters),
            ["east", "east", "west"]
        );
    }
}
