//! Best-fit-decreasing assignment of guest groups to tables.

use std::collections::BTreeMap;

/// Can every group be seated at its own table, each table's capacity
/// covering its group?
///
/// Groups are processed largest first; each takes the smallest remaining
/// table that still fits. Pure function of its inputs: same groups and
/// capacities always give the same answer.
pub fn feasible(group_sizes: &[i64], capacities: &[i64]) -> bool {
    let mut groups = group_sizes.to_vec();
    groups.sort_unstable_by(|a, b| b.cmp(a));

    // Capacity multiset: capacity value -> number of such tables.
    let mut bins: BTreeMap<i64, usize> = BTreeMap::new();
    for &cap in capacities {
        *bins.entry(cap).or_insert(0) += 1;
    }

    for group in groups {
        let fit = bins.range(group..).next().map(|(&cap, _)| cap);
        match fit {
            Some(cap) => {
                if let Some(count) = bins.get_mut(&cap) {
                    *count -= 1;
                    if *count == 0 {
                        bins.remove(&cap);
                    }
                }
            }
            None => return false,
        }
    }
    true
}
