//! Grouping of runs according to the run mode

use crate::{config::RunMode, runs::RunList};

/// Group of run indices that execute concurrently
pub type Group = Vec<usize>;

/// Plan the groups of runs to execute, in execution order
///
/// - Sequential: one group per active run.
/// - Parallel: a single group with every active run.
/// - Permute: one group per non-empty subset of the first `permute_cap`
///   active runs, in increasing bit-pattern order.
///
pub fn plan(runs: &RunList, mode: RunMode, permute_cap: usize) -> Vec<Group> {
    let active = runs.active();
    if active.is_empty() {
        return Vec::new();
    }
    match mode {
        RunMode::Sequential => active.into_iter().map(|index| vec![index]).collect(),
        RunMode::Parallel => vec![active],
        RunMode::Permute => {
            let cap = permute_cap.min(MAX_PERMUTE_BITS);
            let mut members = active;
            if members.len() > cap {
                log::warn!(
                    "Permute mode supports at most {cap} stressors, ignoring the last {}",
                    members.len() - cap
                );
                members.truncate(cap);
            }
            permutations(&members)
        }
    }
}

/// Every non-empty subset of `members`, in increasing bit-pattern order
pub fn permutations(members: &[usize]) -> Vec<Group> {
    assert!(members.len() <= MAX_PERMUTE_BITS);
    (1u64..(1u64 << members.len()))
        .map(|mask| {
            members
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << bit) != 0)
                .map(|(_, &index)| index)
                .collect()
        })
        .collect()
}

/// Hard limit on the number of permuted runs, whatever the configuration
const MAX_PERMUTE_BITS: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn three_stressors() {
        assert_eq!(
            permutations(&[0, 1, 2]),
            [
                vec![0],
                vec![1],
                vec![0, 1],
                vec![2],
                vec![0, 2],
                vec![1, 2],
                vec![0, 1, 2]
            ]
        );
    }

    proptest! {
        #[test]
        fn subset_count(n in 0usize..10) {
            let members = (0..n).map(|i| 2 * i).collect::<Vec<_>>();
            let groups = permutations(&members);
            prop_assert_eq!(groups.len(), (1 << n) - 1);
            prop_assert!(groups.iter().all(|g| !g.is_empty()));
            prop_assert!(groups.iter().flatten().all(|i| members.contains(i)));
        }
    }

    #[test]
    fn empty_plan() {
        for mode in [RunMode::Sequential, RunMode::Parallel, RunMode::Permute] {
            assert!(plan(&RunList::default(), mode, 16).is_empty());
        }
    }
}
