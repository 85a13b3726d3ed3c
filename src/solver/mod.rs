// # Allocation Solver
//
// Deterministic capacity-clearing over a set of bids: baseline floors,
// weighted proportional surplus distribution, per-workload ceilings enforced
// by water-filling, largest-remainder integer rounding, and a scalar shadow
// price reflecting scarcity. Pure function of its inputs; any presentation
// order of the same bids produces the same result.

use crate::common::{WorkloadId, MAX_SHADOW_PRICE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One workload's demand submitted to the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: WorkloadId,
    /// Desired allocation in millicores.
    pub demand: f64,
    /// Relative priority of the surplus share. Non-negative.
    pub weight: f64,
    /// Disagreement floor: the bidder receives at least this much whenever
    /// the floors are jointly feasible.
    pub min: u32,
    /// Ceiling the bidder never exceeds.
    pub max: u32,
}

/// Solver output: integer millicores per id plus the clearing price signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub allocations: BTreeMap<WorkloadId, u32>,
    pub shadow_price: f64,
}

impl Allocation {
    pub fn get(&self, id: &WorkloadId) -> Option<u32> {
        self.allocations.get(id).copied()
    }

    pub fn total(&self) -> u64 {
        self.allocations.values().map(|v| *v as u64).sum()
    }
}

const EPSILON: f64 = 1e-9;

/// Clear `capacity` millicores across `bids`.
pub fn solve(capacity: u32, bids: &[Bid]) -> Allocation {
    if bids.is_empty() || capacity == 0 {
        return Allocation::default();
    }

    // Deterministic working order regardless of presentation order.
    let mut ordered: Vec<Bid> = bids.to_vec();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    for bid in &mut ordered {
        bid.min = bid.min.min(bid.max);
        bid.weight = bid.weight.max(0.0);
        bid.demand = bid.demand.max(0.0);
    }

    let capacity_f = capacity as f64;
    let sum_min: u64 = ordered.iter().map(|b| b.min as u64).sum();

    // Step 1: floor feasibility. Infeasible floors scale down uniformly and
    // the market reports full scarcity.
    if sum_min as f64 > capacity_f {
        let scale = capacity_f / sum_min as f64;
        let targets: Vec<f64> = ordered.iter().map(|b| b.min as f64 * scale).collect();
        let allocations = round_targets(&ordered, &targets, capacity);
        return Allocation {
            allocations,
            shadow_price: 1.0,
        };
    }

    let remaining = capacity_f - sum_min as f64;

    // Step 2: effective bids.
    let effective: Vec<f64> = ordered.iter().map(|b| b.weight * b.demand).collect();
    let total_bid: f64 = effective.iter().sum();
    let total_weight: f64 = ordered.iter().map(|b| b.weight).sum();

    // The proportional key degrades from bid to weight to equal split.
    let keys: Vec<f64> = if total_bid > EPSILON {
        effective
    } else if total_weight > EPSILON {
        ordered.iter().map(|b| b.weight).collect()
    } else {
        vec![1.0; ordered.len()]
    };
    let key_total: f64 = keys.iter().sum();

    // Step 3: proportional surplus distribution over the floors.
    let mut targets: Vec<f64> = ordered
        .iter()
        .zip(&keys)
        .map(|(b, k)| b.min as f64 + k / key_total * remaining)
        .collect();

    // Step 4: water-filling: clamp ceiling-hitters and redistribute their
    // excess over the unsaturated set, proportionally by the same key.
    for _ in 0..ordered.len() {
        let mut excess = 0.0;
        for (target, bid) in targets.iter_mut().zip(&ordered) {
            if *target > bid.max as f64 {
                excess += *target - bid.max as f64;
                *target = bid.max as f64;
            }
        }
        if excess <= EPSILON {
            break;
        }
        let unsaturated: Vec<usize> = (0..ordered.len())
            .filter(|&i| targets[i] + EPSILON < ordered[i].max as f64)
            .collect();
        let key_sum: f64 = unsaturated.iter().map(|&i| keys[i]).sum();
        if key_sum <= EPSILON {
            // Everyone is at their ceiling; the leftover stays unallocated.
            break;
        }
        for &i in &unsaturated {
            targets[i] += keys[i] / key_sum * excess;
        }
    }

    let allocations = round_targets(&ordered, &targets, capacity);

    // Step 6: shadow price from the first interior bidder, in id order;
    // scarcity heuristic when every bidder sits on a bound.
    let mut shadow_price = None;
    for bid in &ordered {
        if let Some(&alloc) = allocations.get(&bid.id) {
            if alloc > bid.min && alloc < bid.max {
                shadow_price = Some(bid.weight / (alloc - bid.min) as f64);
                break;
            }
        }
    }
    let total: u64 = allocations.values().map(|v| *v as u64).sum();
    let shadow_price = shadow_price
        .unwrap_or_else(|| total as f64 / capacity_f * 10.0)
        .clamp(0.0, MAX_SHADOW_PRICE);

    Allocation {
        allocations,
        shadow_price,
    }
}

/// Step 5: largest-remainder rounding of real targets into integer
/// millicores, sum constrained to the capacity. Ties break on id order.
fn round_targets(
    ordered: &[Bid],
    targets: &[f64],
    capacity: u32,
) -> BTreeMap<WorkloadId, u32> {
    let total_target: f64 = targets.iter().sum();
    let budget = (total_target + EPSILON).floor().min(capacity as f64) as u64;

    let mut floors: Vec<u64> = targets.iter().map(|t| t.floor() as u64).collect();
    let floor_sum: u64 = floors.iter().sum();
    let mut leftover = budget.saturating_sub(floor_sum) as usize;

    // Hand out the remaining units by descending fractional part.
    let mut order: Vec<usize> = (0..targets.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = targets[a] - targets[a].floor();
        let fb = targets[b] - targets[b].floor();
        fb.partial_cmp(&fa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ordered[a].id.cmp(&ordered[b].id))
    });
    for &i in &order {
        if leftover == 0 {
            break;
        }
        // Never round above the ceiling.
        if floors[i] < ordered[i].max as u64 {
            floors[i] += 1;
            leftover -= 1;
        }
    }

    ordered
        .iter()
        .zip(&floors)
        .map(|(bid, &alloc)| (bid.id.clone(), alloc.min(u32::MAX as u64) as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(id: &str, demand: f64, weight: f64, min: u32, max: u32) -> Bid {
        Bid {
            id: WorkloadId::from(id),
            demand,
            weight,
            min,
            max,
        }
    }

    fn alloc_of(result: &Allocation, id: &str) -> u32 {
        result.get(&WorkloadId::from(id)).unwrap()
    }

    #[test]
    fn empty_bids_clear_to_nothing() {
        let result = solve(1000, &[]);
        assert!(result.allocations.is_empty());
        assert_eq!(result.shadow_price, 0.0);
    }

    #[test]
    fn zero_capacity_clears_to_nothing() {
        let result = solve(0, &[bid("a", 500.0, 1.0, 100, 1000)]);
        assert!(result.allocations.is_empty());
        assert_eq!(result.shadow_price, 0.0);
    }

    #[test]
    fn exact_clearing_at_capacity() {
        // Two symmetric bidders clearing the whole market: each settles at
        // its demand with a near-zero interior price.
        let bids = [
            bid("a", 500.0, 1.0, 100, 1000),
            bid("b", 500.0, 1.0, 100, 1000),
        ];
        let result = solve(1000, &bids);
        assert_eq!(alloc_of(&result, "a"), 500);
        assert_eq!(alloc_of(&result, "b"), 500);
        assert!(result.shadow_price < 0.01);
    }

    #[test]
    fn abundant_capacity_is_ceiling_bound() {
        let bids = [
            bid("a", 500.0, 1.0, 100, 1000),
            bid("b", 500.0, 1.0, 100, 1000),
        ];
        let result = solve(3000, &bids);
        assert_eq!(alloc_of(&result, "a"), alloc_of(&result, "b"));
        assert!(alloc_of(&result, "a") <= 1000);
        assert!(result.total() <= 3000);
    }

    #[test]
    fn proportional_split_of_surplus() {
        let bids = [
            bid("a", 600.0, 1.0, 100, 800),
            bid("b", 300.0, 1.0, 100, 800),
        ];
        let result = solve(1000, &bids);
        assert_eq!(alloc_of(&result, "a"), 633);
        assert_eq!(alloc_of(&result, "b"), 367);
        assert_eq!(result.total(), 1000);
    }

    #[test]
    fn cap_redistribution_water_fills() {
        let bids = [
            bid("a", 1000.0, 1.0, 100, 400),
            bid("b", 200.0, 1.0, 100, 2000),
        ];
        let result = solve(1200, &bids);
        assert_eq!(alloc_of(&result, "a"), 400);
        assert_eq!(alloc_of(&result, "b"), 800);
    }

    #[test]
    fn infeasible_floors_scale_down() {
        let bids = [
            bid("a", 0.0, 1.0, 200, 2000),
            bid("b", 0.0, 1.0, 200, 2000),
        ];
        let result = solve(300, &bids);
        assert_eq!(alloc_of(&result, "a"), 150);
        assert_eq!(alloc_of(&result, "b"), 150);
        assert_eq!(result.shadow_price, 1.0);
    }

    #[test]
    fn zero_bids_distribute_by_weight() {
        let bids = [
            bid("a", 0.0, 1.0, 100, 500),
            bid("b", 0.0, 2.0, 100, 500),
        ];
        let result = solve(1000, &bids);
        assert_eq!(alloc_of(&result, "a"), 367);
        assert_eq!(alloc_of(&result, "b"), 633);
    }

    #[test]
    fn zero_bids_zero_weights_split_equally() {
        let bids = [
            bid("a", 0.0, 0.0, 100, 1000),
            bid("b", 0.0, 0.0, 100, 1000),
        ];
        let result = solve(600, &bids);
        assert_eq!(alloc_of(&result, "a"), 300);
        assert_eq!(alloc_of(&result, "b"), 300);
    }

    #[test]
    fn permutation_invariance() {
        let forward = [
            bid("a", 600.0, 1.0, 100, 800),
            bid("b", 300.0, 2.0, 50, 700),
            bid("c", 150.0, 1.5, 200, 900),
        ];
        let mut reversed = forward.to_vec();
        reversed.reverse();

        let r1 = solve(1200, &forward);
        let r2 = solve(1200, &reversed);
        assert_eq!(r1.allocations, r2.allocations);
        assert_eq!(r1.shadow_price, r2.shadow_price);
    }

    #[test]
    fn allocations_stay_within_bounds() {
        let bids = [
            bid("a", 5000.0, 3.0, 100, 600),
            bid("b", 10.0, 0.5, 50, 200),
            bid("c", 900.0, 1.0, 150, 2000),
        ];
        let result = solve(2000, &bids);
        for b in &bids {
            let alloc = result.get(&b.id).unwrap();
            assert!(alloc >= b.min, "{} under floor", b.id);
            assert!(alloc <= b.max, "{} over ceiling", b.id);
        }
        assert!(result.total() <= 2000);
    }

    #[test]
    fn all_ceilings_saturated_leaves_surplus_unallocated() {
        let bids = [
            bid("a", 900.0, 1.0, 10, 100),
            bid("b", 900.0, 1.0, 10, 100),
        ];
        let result = solve(1000, &bids);
        assert_eq!(alloc_of(&result, "a"), 100);
        assert_eq!(alloc_of(&result, "b"), 100);
        assert_eq!(result.total(), 200);
    }

    #[test]
    fn shadow_price_uses_first_interior_bidder() {
        let bids = [
            bid("a", 600.0, 1.0, 100, 800),
            bid("b", 300.0, 1.0, 100, 800),
        ];
        let result = solve(1000, &bids);
        // a settles at 633: interior, so price = 1 / (633 - 100).
        assert!((result.shadow_price - 1.0 / 533.0).abs() < 1e-9);
    }

    #[test]
    fn shadow_price_capped() {
        let bids = [
            bid("a", 600.0, 1.0, 100, 800),
            bid("b", 300.0, 1.0, 100, 800),
        ];
        // Interior gap of 1 millicore would price at 1.0/1 = 1.0 < cap, so
        // force the scarcity fallback instead: everyone on a bound with a
        // tiny capacity still stays within the cap.
        let result = solve(1000, &bids);
        assert!(result.shadow_price <= MAX_SHADOW_PRICE);
    }

    #[test]
    fn min_above_max_is_clamped() {
        let bids = [bid("a", 100.0, 1.0, 900, 500)];
        let result = solve(1000, &bids);
        assert!(alloc_of(&result, "a") <= 500);
    }
}
