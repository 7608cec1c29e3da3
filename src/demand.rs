// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Demand Period Calculator
//
// Turns a total trip amount, a vehicle class mix and the allocated
// intervals into one trip-generator invocation per (class, interval).

use serde::Serialize;
use tracing::debug;

use crate::types::{AllocatedIntervals, DemandBand, VehicleClass, VehicleClassMix};

// ─── Seeds ──────────────────────────────────────────────────────────────────

/// Monotonically increasing generator seeds. Every sub-generation in a run
/// takes the next value so starting points differ between them.
#[derive(Debug, Clone)]
pub struct SeedSequence {
    next: u64,
}

impl SeedSequence {
    pub fn new(base: u64) -> Self {
        Self { next: base }
    }

    pub fn next_seed(&mut self) -> u64 {
        let seed = self.next;
        self.next += 1;
        seed
    }

    /// The seed the next call will hand out.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

// ─── Generation Requests ────────────────────────────────────────────────────

/// One trip-generator call: `class` trips departing in `[begin, end)` with
/// one departure every `period` seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub class: VehicleClass,
    pub interval_index: usize,
    pub begin: u32,
    pub end: u32,
    pub period: f64,
    pub seed: u64,
    pub id_prefix: String,
}

impl GenerationRequest {
    /// Number of trips the request is expected to produce.
    pub fn expected_trips(&self) -> f64 {
        f64::from(self.end - self.begin) / self.period
    }
}

/// Seconds between departures for `class_amount × share` trips in `band`.
///
/// `None` when the interval receives no trips; the caller skips it instead
/// of dividing by zero.
pub fn interval_period(band: &DemandBand, class_amount: f64) -> Option<f64> {
    let trips = class_amount * band.share;
    if trips <= 0.0 || !trips.is_finite() {
        return None;
    }
    Some(f64::from(band.duration()) / trips)
}

/// Plan every generator invocation for one pass at `total_amount` trips.
pub fn plan_generation(
    total_amount: u64,
    mix: &VehicleClassMix,
    intervals: &AllocatedIntervals,
    seeds: &mut SeedSequence,
) -> Vec<GenerationRequest> {
    let mut requests = Vec::new();
    for (class, class_share) in mix.iter() {
        let class_amount = total_amount as f64 * class_share;
        for (index, band) in intervals.intervals().iter().enumerate() {
            let Some(period) = interval_period(band, class_amount) else {
                debug!(%class, index, "no trips for interval, skipping");
                continue;
            };
            requests.push(GenerationRequest {
                class,
                interval_index: index,
                begin: band.start,
                end: band.end,
                period,
                seed: seeds.next_seed(),
                id_prefix: format!("{}{}_", class.label(), index),
            });
        }
    }
    requests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::allocate;
    use crate::types::{DemandProfile, SubWindow};
    use std::collections::{BTreeMap, HashSet};

    fn day() -> AllocatedIntervals {
        allocate(&DemandProfile::default_day(), SubWindow::full_day()).unwrap()
    }

    #[test]
    fn period_matches_formula() {
        let band = DemandBand::new(18_000, 32_400, 0.258);
        let period = interval_period(&band, 100_000.0).unwrap();
        assert!((period - 14_400.0 / 25_800.0).abs() < 1e-12);
    }

    #[test]
    fn zero_trips_skip_interval() {
        let band = DemandBand::new(0, 18_000, 0.0);
        assert_eq!(interval_period(&band, 100_000.0), None);
        let band = DemandBand::new(0, 18_000, 0.063);
        assert_eq!(interval_period(&band, 0.0), None);
    }

    #[test]
    fn one_request_per_class_and_interval() {
        let mut explicit = BTreeMap::new();
        explicit.insert(VehicleClass::Truck, 0.01);
        explicit.insert(VehicleClass::Bus, 0.005);
        let mix = VehicleClassMix::from_explicit(&explicit).unwrap();
        let mut seeds = SeedSequence::new(7);
        let reqs = plan_generation(100_000, &mix, &day(), &mut seeds);
        assert_eq!(reqs.len(), 3 * 5);

        let expected: f64 = reqs.iter().map(|r| r.expected_trips()).sum();
        assert!((expected - 100_000.0).abs() < 1e-6, "expected trips {}", expected);
    }

    #[test]
    fn seeds_never_repeat_within_a_run() {
        let mix = VehicleClassMix::cars_only();
        let intervals = day();
        let mut seeds = SeedSequence::new(1);
        let first = plan_generation(50_000, &mix, &intervals, &mut seeds);
        let second = plan_generation(60_000, &mix, &intervals, &mut seeds);

        let all: Vec<u64> = first.iter().chain(second.iter()).map(|r| r.seed).collect();
        assert!(all.windows(2).all(|w| w[0] < w[1]), "seeds not increasing: {:?}", all);
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(seeds.peek(), 11);
    }

    #[test]
    fn skipped_intervals_do_not_consume_seeds() {
        let mix = VehicleClassMix::cars_only();
        let mut seeds = SeedSequence::new(0);
        let reqs = plan_generation(0, &mix, &day(), &mut seeds);
        assert!(reqs.is_empty());
        assert_eq!(seeds.peek(), 0);
    }

    #[test]
    fn prefixes_distinguish_sub_generations() {
        let mut explicit = BTreeMap::new();
        explicit.insert(VehicleClass::Motorcycle, 0.1);
        let mix = VehicleClassMix::from_explicit(&explicit).unwrap();
        let mut seeds = SeedSequence::new(0);
        let reqs = plan_generation(10_000, &mix, &day(), &mut seeds);
        let prefixes: HashSet<&str> = reqs.iter().map(|r| r.id_prefix.as_str()).collect();
        assert_eq!(prefixes.len(), reqs.len());
        assert!(prefixes.contains("car0_"));
        assert!(prefixes.contains("motorcycle4_"));
    }
}
