//! Percentage-to-mask bit carving
//!
//! Pure algorithm: converts a requested cache percentage into a contiguous
//! exclusive way mask inside the discovered exclusive base. Fragmented
//! allocations are never attempted; if no contiguous run fits, the carve
//! fails with a named error.

use crate::cache::CacheTopology;
use crate::error::{Result, ShieldError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A cache way mask, formatted to the schemata interface's hex width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WayMask {
    /// The mask bits
    pub bits: u64,
    /// Zero-padded hex width for schemata writes
    pub hex_width: usize,
}

impl fmt::Display for WayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.bits, width = self.hex_width)
    }
}

impl WayMask {
    /// Number of ways this mask grants
    pub fn ways(&self) -> u32 {
        self.bits.count_ones()
    }
}

/// Check that a requested percentage maps to a whole number of ways.
///
/// On failure the error names the minimal valid step size,
/// `100 / gcd(100, ways_total)`.
pub fn validate_percent(topology: &CacheTopology, pct: u32) -> Result<()> {
    if (pct * topology.ways_total) % 100 != 0 {
        let step = 100 / gcd(100, topology.ways_total);
        return Err(ShieldError::validation(format!(
            "{pct}% of {} ways is not a whole way count; use multiples of {step}%",
            topology.ways_total
        )));
    }
    Ok(())
}

/// Convert a percentage into a contiguous exclusive way mask.
///
/// The caller must already have validated the percentage with
/// [`validate_percent`]. The run's starting offset slides from 0 upward and
/// the first position fully contained in the exclusive base wins.
pub fn percent_to_exclusive_mask(topology: &CacheTopology, pct: u32) -> Result<WayMask> {
    let ways_req = pct * topology.ways_total / 100;

    if ways_req < topology.min_cbm_bits {
        return Err(ShieldError::validation(format!(
            "{pct}% grants {ways_req} ways, below the platform minimum of {} contiguous ways",
            topology.min_cbm_bits
        )));
    }
    if ways_req > topology.ways_exclusive_max {
        return Err(ShieldError::capability(format!(
            "{pct}% requires {ways_req} exclusive ways but only {} are available",
            topology.ways_exclusive_max
        )));
    }

    let run: u64 = (1u64 << ways_req) - 1;
    for offset in 0..=(topology.bit_width - ways_req) {
        let candidate = run << offset;
        if candidate & !topology.exclusive_base == 0 {
            return Ok(WayMask {
                bits: candidate,
                hex_width: topology.hex_width,
            });
        }
    }

    Err(ShieldError::CarvingFailed {
        ways: ways_req,
        base: topology.exclusive_base,
    })
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn topology(ways_total: u32, shareable_mask: u64, min_cbm_bits: u32) -> CacheTopology {
        let capability_mask = (1u64 << ways_total) - 1;
        CacheTopology {
            domains: vec![0],
            capability_mask,
            shareable_mask,
            min_cbm_bits,
            ways_total,
            ways_shareable: (capability_mask & shareable_mask).count_ones(),
            ways_exclusive_max: ways_total - (capability_mask & shareable_mask).count_ones(),
            hex_width: ((ways_total + 3) / 4) as usize,
            bit_width: ways_total,
            exclusive_base: capability_mask & !shareable_mask,
        }
    }

    #[test]
    fn test_fifty_percent_of_twenty_ways() {
        // 20 ways, 4 shareable low bits, min 2: 50% -> 10-way run above bit 4.
        let topo = topology(20, 0xf, 2);
        validate_percent(&topo, 50).unwrap();
        let mask = percent_to_exclusive_mask(&topo, 50).unwrap();
        assert_eq!(mask.ways(), 10);
        assert_eq!(mask.bits & topo.shareable_mask, 0);
        assert_eq!(mask.bits, 0x3ff0);
        assert_eq!(mask.to_string(), "03ff0");
    }

    #[test]
    fn test_fractional_way_count_names_step() {
        // 15% of 12 ways = 1.8 ways; minimal step is 100/gcd(100,12) = 25%.
        let topo = topology(12, 0x3, 1);
        let err = validate_percent(&topo, 15).unwrap_err();
        assert!(err.to_string().contains("25%"));
    }

    #[test]
    fn test_below_min_cbm_bits() {
        let topo = topology(20, 0xf, 4);
        // 10% of 20 ways = 2 ways < min 4.
        let err = percent_to_exclusive_mask(&topo, 10).unwrap_err();
        assert!(matches!(err, ShieldError::Validation(_)));
    }

    #[test]
    fn test_exceeds_exclusive_capacity() {
        let topo = topology(20, 0xf, 2);
        // 90% of 20 ways = 18 ways > 16 exclusive.
        let err = percent_to_exclusive_mask(&topo, 90).unwrap_err();
        assert!(err.is_capability());
    }

    #[test]
    fn test_carve_slides_past_low_shareable_bits() {
        let topo = topology(8, 0b0000_0011, 1);
        let mask = percent_to_exclusive_mask(&topo, 25).unwrap();
        // Two ways, first fit starts at bit 2.
        assert_eq!(mask.bits, 0b0000_1100);
    }

    #[test]
    fn test_carve_fails_on_fragmented_base() {
        // Shareable bits split the exclusive region into two 3-way fragments;
        // a 4-way run cannot fit and fragments are never packed.
        let topo = topology(8, 0b0001_1000, 1);
        let err = percent_to_exclusive_mask(&topo, 50).unwrap_err();
        assert!(matches!(err, ShieldError::CarvingFailed { ways: 4, .. }));
    }

    proptest! {
        #[test]
        fn prop_carved_masks_are_contiguous_and_exclusive(
            ways_total in 4u32..=32,
            shareable_low in 0u32..=4,
            pct in 1u32..=100,
        ) {
            let shareable_mask = (1u64 << shareable_low) - 1;
            let topo = topology(ways_total, shareable_mask, 1);
            if validate_percent(&topo, pct).is_err() {
                return Ok(());
            }
            match percent_to_exclusive_mask(&topo, pct) {
                Ok(mask) => {
                    let ways_req = pct * ways_total / 100;
                    prop_assert_eq!(mask.ways(), ways_req);
                    prop_assert_eq!(mask.bits & topo.shareable_mask, 0);
                    prop_assert_eq!(mask.bits & !topo.exclusive_base, 0);
                    // Contiguity: shifting out trailing zeros leaves 2^n - 1.
                    let normalized = mask.bits >> mask.bits.trailing_zeros();
                    prop_assert_eq!(normalized & (normalized + 1), 0);
                }
                Err(e) => {
                    let named_failure = matches!(
                        e,
                        ShieldError::Validation(_)
                            | ShieldError::Capability(_)
                            | ShieldError::CarvingFailed { .. }
                    );
                    prop_assert!(named_failure, "unexpected error variant: {}", e);
                }
            }
        }
    }
}
