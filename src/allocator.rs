// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Interval Allocator
//
// Restricts the day-long demand profile to the generation window and
// renormalizes the surviving shares so they again sum to one.

use crate::error::{CalibrationError, Result};
use crate::types::{AllocatedIntervals, DemandBand, DemandProfile, SubWindow, DAY_SECONDS};

/// Clip `profile` to `window`.
///
/// Every band's share is spread evenly over its duration, so a band that is
/// cut in half keeps half of its share before renormalization. Bands outside
/// the window are dropped. The full-day window returns the profile as is.
pub fn allocate(profile: &DemandProfile, window: SubWindow) -> Result<AllocatedIntervals> {
    if window.begin() == 0 && window.end() == DAY_SECONDS {
        return Ok(AllocatedIntervals { intervals: profile.bands().to_vec() });
    }

    let mut clipped = Vec::new();
    let mut total_weight = 0.0;
    for band in profile.bands() {
        let start = band.start.max(window.begin());
        let end = band.end.min(window.end());
        if start >= end {
            continue;
        }
        let weight = band.share * f64::from(end - start) / f64::from(band.duration());
        total_weight += weight;
        clipped.push(DemandBand::new(start, end, weight));
    }

    if clipped.is_empty() {
        return Err(CalibrationError::config(format!(
            "window [{}, {}) overlaps no demand band",
            window.begin(),
            window.end()
        )));
    }

    if total_weight > 0.0 {
        for band in &mut clipped {
            band.share /= total_weight;
        }
    } else {
        // Every overlapping band carries zero demand; spread time-proportionally.
        let span = f64::from(window.end() - window.begin());
        for band in &mut clipped {
            band.share = f64::from(band.duration()) / span;
        }
    }

    Ok(AllocatedIntervals { intervals: clipped })
}

/// Validate the raw bounds and allocate in one step.
pub fn allocate_window(profile: &DemandProfile, begin: u32, end: u32) -> Result<AllocatedIntervals> {
    allocate(profile, SubWindow::new(begin, end)?)
}

// ===========================================================================
// Tests
// ===========================================================================
