//! Assignment engine
//!
//! Pure, synchronous, deterministic planning over a state snapshot. The
//! engine never mutates anything and never triggers itself; the control
//! loop decides when to run it and commits its output.
//!
//! Placement honors the version gate: only runners at the maximum
//! observed version receive new shards, so rolling upgrades drain load
//! off stale binaries instead of feeding them.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use crate::manager::state::{RunnerAddress, ShardId};

/// Immutable snapshot the engine plans over
#[derive(Debug, Clone)]
pub struct EngineView {
    /// Registered runners and their deployed versions
    pub runners: BTreeMap<RunnerAddress, u64>,
    /// Total assignment map; domain is exactly `[1, N]`
    pub assignments: BTreeMap<ShardId, Option<RunnerAddress>>,
}

impl EngineView {
    fn loads(&self) -> BTreeMap<&RunnerAddress, u32> {
        let mut loads: BTreeMap<&RunnerAddress, u32> =
            self.runners.keys().map(|addr| (addr, 0)).collect();
        for owner in self.assignments.values().flatten() {
            if let Some(load) = loads.get_mut(owner) {
                *load += 1;
            }
        }
        loads
    }
}

/// A planned rebalance round: vacates applied before assigns, atomically
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    /// `(shard, current owner)` pairs to unassign
    pub removes: Vec<(ShardId, RunnerAddress)>,
    /// `(shard, new owner)` pairs to assign
    pub adds: Vec<(ShardId, RunnerAddress)>,
    /// True when the move budget cut planning short; another round is
    /// needed to converge
    pub budget_exhausted: bool,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.removes.is_empty() && self.adds.is_empty()
    }

    pub fn move_count(&self) -> usize {
        self.removes.len() + self.adds.len()
    }
}

/// Assign currently-unassigned shards to the least-loaded runners at the
/// maximum observed version
///
/// Unassigned shards are walked in ascending id order; candidates are
/// drawn from a min-heap keyed `(load, address)`, so ties break on the
/// lexicographically smaller address. Runners at `cap` are skipped. An
/// empty fleet, or one with no candidate at the gate, yields an empty map.
pub fn assign_unassigned(
    view: &EngineView,
    cap: Option<u32>,
) -> BTreeMap<ShardId, RunnerAddress> {
    let Some(max_version) = view.runners.values().copied().max() else {
        return BTreeMap::new();
    };

    let loads = view.loads();
    let mut heap: BinaryHeap<Reverse<(u32, &RunnerAddress)>> = view
        .runners
        .iter()
        .filter(|(_, version)| **version == max_version)
        .map(|(addr, _)| Reverse((loads[addr], addr)))
        .collect();

    let mut placed = BTreeMap::new();
    for (&shard, owner) in &view.assignments {
        if owner.is_some() {
            continue;
        }
        let target = loop {
            let Some(Reverse((load, addr))) = heap.pop() else {
                // Every candidate sits at the cap; remaining shards stay
                // unassigned.
                return placed;
            };
            match cap {
                Some(cap) if load >= cap => continue,
                _ => break (load, addr),
            }
        };
        placed.insert(shard, target.1.clone());
        heap.push(Reverse((target.0 + 1, target.1)));
    }
    placed
}

/// Pick shards to vacate so that every runner in each version class ends
/// within one shard of its class target `ceil(owned / runners)`
///
/// Vacating is load-shedding only: the shards are reassigned by a
/// subsequent [`assign_unassigned`] pass, never directly moved. Runners
/// with the largest overload shed first (ties on address); within a
/// runner the highest shard ids go first. At most `move_budget` shards
/// are vacated per round.
pub fn plan_vacates(view: &EngineView, move_budget: usize) -> Vec<(ShardId, RunnerAddress)> {
    let mut owned: BTreeMap<&RunnerAddress, Vec<ShardId>> =
        view.runners.keys().map(|addr| (addr, Vec::new())).collect();
    for (&shard, owner) in &view.assignments {
        if let Some(addr) = owner {
            if let Some(shards) = owned.get_mut(addr) {
                shards.push(shard);
            }
        }
    }

    let mut classes: BTreeMap<u64, Vec<&RunnerAddress>> = BTreeMap::new();
    for (addr, version) in &view.runners {
        classes.entry(*version).or_default().push(addr);
    }

    let mut vacates = Vec::new();
    let mut budget = move_budget;
    for members in classes.values() {
        let class_total: usize = members.iter().map(|addr| owned[*addr].len()).sum();
        if class_total == 0 {
            continue;
        }
        let target = class_total.div_ceil(members.len());

        let mut overloaded: Vec<(&RunnerAddress, usize)> = members
            .iter()
            .map(|addr| (*addr, owned[*addr].len()))
            .filter(|(_, load)| *load > target)
            .collect();
        overloaded.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (addr, load) in overloaded {
            let shards = &owned[addr];
            let shed = (load - target).min(budget);
            for &shard in shards.iter().rev().take(shed) {
                vacates.push((shard, addr.clone()));
            }
            budget -= shed;
            if budget == 0 {
                return vacates;
            }
        }
    }
    vacates
}

/// Compose a full rebalance round: vacate overloaded runners, then assign
/// everything unassigned (including the freshly vacated shards)
///
/// Moves whose destination equals the current owner are cancelled so a
/// runner never sees a spurious revoke/assign pair for a shard it keeps.
pub fn plan_rebalance(
    view: &EngineView,
    move_budget: usize,
    cap: Option<u32>,
) -> RebalancePlan {
    let vacates = plan_vacates(view, move_budget);
    let budget_exhausted = vacates.len() >= move_budget;

    let mut after = view.clone();
    for (shard, _) in &vacates {
        after.assignments.insert(*shard, None);
    }
    let assigns = assign_unassigned(&after, cap);

    let mut vacated: BTreeMap<ShardId, RunnerAddress> = vacates.into_iter().collect();
    let mut plan = RebalancePlan {
        budget_exhausted,
        ..Default::default()
    };
    for (shard, target) in assigns {
        match vacated.remove(&shard) {
            Some(previous) if previous == target => {} // stays put
            Some(previous) => {
                plan.removes.push((shard, previous));
                plan.adds.push((shard, target));
            }
            None => plan.adds.push((shard, target)),
        }
    }
    // Vacated but not reassigned (e.g. budgeted drain with capped or
    // absent candidates): the unassign still commits.
    plan.removes.extend(vacated);
    plan.removes.sort();
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> RunnerAddress {
        RunnerAddress::new("runner", n)
    }

    fn view(total: u32, runners: &[(RunnerAddress, u64)]) -> EngineView {
        EngineView {
            runners: runners.iter().cloned().collect(),
            assignments: (1..=total).map(|s| (s, None)).collect(),
        }
    }

    fn loads(view: &EngineView) -> BTreeMap<RunnerAddress, usize> {
        let mut loads: BTreeMap<RunnerAddress, usize> =
            view.runners.keys().map(|a| (a.clone(), 0)).collect();
        for owner in view.assignments.values().flatten() {
            *loads.get_mut(owner).unwrap() += 1;
        }
        loads
    }

    fn apply(view: &mut EngineView, plan: &RebalancePlan) {
        for (shard, _) in &plan.removes {
            view.assignments.insert(*shard, None);
        }
        for (shard, target) in &plan.adds {
            view.assignments.insert(*shard, Some(target.clone()));
        }
    }

    #[test]
    fn spreads_evenly_across_fleet() {
        let mut v = view(300, &[(addr(1), 1), (addr(2), 1), (addr(3), 1)]);
        let placed = assign_unassigned(&v, None);
        assert_eq!(placed.len(), 300);
        for (shard, owner) in placed {
            v.assignments.insert(shard, Some(owner));
        }
        let loads = loads(&v);
        assert!(loads.values().all(|&l| l == 100));
    }

    #[test]
    fn balance_within_one_for_uneven_split() {
        let mut v = view(10, &[(addr(1), 1), (addr(2), 1), (addr(3), 1)]);
        for (shard, owner) in assign_unassigned(&v, None) {
            v.assignments.insert(shard, Some(owner));
        }
        let loads = loads(&v);
        let max = loads.values().max().unwrap();
        let min = loads.values().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn version_gate_excludes_stale_runners() {
        let v = view(12, &[(addr(1), 1), (addr(2), 1), (addr(3), 2)]);
        let placed = assign_unassigned(&v, None);
        assert_eq!(placed.len(), 12);
        assert!(placed.values().all(|owner| *owner == addr(3)));
    }

    #[test]
    fn empty_fleet_leaves_shards_unassigned() {
        let v = view(8, &[]);
        assert!(assign_unassigned(&v, None).is_empty());
    }

    #[test]
    fn cap_strands_overflow() {
        let v = view(10, &[(addr(1), 1), (addr(2), 1)]);
        let placed = assign_unassigned(&v, Some(3));
        assert_eq!(placed.len(), 6);
    }

    #[test]
    fn deterministic_for_identical_snapshots() {
        let v = view(100, &[(addr(3), 1), (addr(1), 1), (addr(2), 1)]);
        assert_eq!(assign_unassigned(&v, None), assign_unassigned(&v, None));
        assert_eq!(plan_rebalance(&v, 256, None), plan_rebalance(&v, 256, None));
    }

    #[test]
    fn vacates_highest_ids_from_most_overloaded() {
        let mut v = view(9, &[(addr(1), 1), (addr(2), 1), (addr(3), 1)]);
        for s in 1..=7 {
            v.assignments.insert(s, Some(addr(1)));
        }
        for s in 8..=9 {
            v.assignments.insert(s, Some(addr(2)));
        }
        // target = ceil(9/3) = 3; addr(1) sheds 4, highest ids first
        let vacates = plan_vacates(&v, 256);
        assert_eq!(
            vacates,
            vec![(7, addr(1)), (6, addr(1)), (5, addr(1)), (4, addr(1))]
        );
    }

    #[test]
    fn vacate_respects_move_budget() {
        let mut v = view(20, &[(addr(1), 1), (addr(2), 1)]);
        for s in 1..=20 {
            v.assignments.insert(s, Some(addr(1)));
        }
        let vacates = plan_vacates(&v, 3);
        assert_eq!(vacates.len(), 3);
    }

    #[test]
    fn rebalance_converges_after_join() {
        let mut v = view(100, &[(addr(1), 1)]);
        for (shard, owner) in assign_unassigned(&v, None) {
            v.assignments.insert(shard, Some(owner));
        }
        v.runners.insert(addr(2), 1);

        let plan = plan_rebalance(&v, 256, None);
        apply(&mut v, &plan);
        let loads = loads(&v);
        assert_eq!(loads[&addr(1)], 50);
        assert_eq!(loads[&addr(2)], 50);
    }

    #[test]
    fn rebalance_cancels_same_owner_moves() {
        let mut v = view(4, &[(addr(1), 1), (addr(2), 1)]);
        v.assignments.insert(1, Some(addr(1)));
        v.assignments.insert(2, Some(addr(1)));
        v.assignments.insert(3, Some(addr(2)));
        v.assignments.insert(4, Some(addr(2)));

        // Already balanced: the round must be a no-op, not a shuffle
        let plan = plan_rebalance(&v, 256, None);
        assert!(plan.is_empty());
    }

    #[test]
    fn upgrade_drain_moves_vacated_shards_to_new_version() {
        let mut v = view(12, &[(addr(1), 1), (addr(2), 1), (addr(3), 2)]);
        for s in 1..=8 {
            v.assignments.insert(s, Some(addr(1)));
        }
        for s in 9..=12 {
            v.assignments.insert(s, Some(addr(2)));
        }
        // Class v1 target = ceil(12/2) = 6: addr(1) sheds two shards, and
        // the gate sends both to the v2 runner.
        let plan = plan_rebalance(&v, 256, None);
        assert_eq!(plan.removes, vec![(7, addr(1)), (8, addr(1))]);
        assert!(plan.adds.iter().all(|(_, owner)| *owner == addr(3)));
        assert_eq!(plan.adds.len(), 2);
    }
}
