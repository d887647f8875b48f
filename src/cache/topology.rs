//! Cache-allocation capability discovery
//!
//! Reads the platform's L3 allocation capabilities from the resctrl info
//! directory: total ways, the shareable-ways mask the platform reserves,
//! the minimum contiguous grant, and the per-domain id list.

use crate::error::{Result, ShieldError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Discovered cache-allocation topology
///
/// Immutable once discovered; the session re-discovers lazily on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Cache domain ids, in schemata order
    pub domains: Vec<u32>,
    /// Full capability bitmask over all ways
    pub capability_mask: u64,
    /// Ways the platform always shares across groups
    pub shareable_mask: u64,
    /// Smallest number of contiguous ways a group may be granted
    pub min_cbm_bits: u32,
    /// Total way count
    pub ways_total: u32,
    /// Shareable way count
    pub ways_shareable: u32,
    /// Largest exclusive grant the platform can honor
    pub ways_exclusive_max: u32,
    /// Width of the hex mask strings the schemata interface uses
    pub hex_width: usize,
    /// Highest usable bit position + 1
    pub bit_width: u32,
    /// Capability mask minus the shareable bits
    pub exclusive_base: u64,
}

impl CacheTopology {
    /// Discover the topology from a resctrl mount point.
    ///
    /// Fails with a capability error when the L3 allocation feature is
    /// absent or when no exclusive bits remain after subtracting the
    /// shareable mask.
    pub fn discover(resctrl_root: &Path) -> Result<Self> {
        let info = resctrl_root.join("info/L3");
        if !info.is_dir() {
            return Err(ShieldError::capability(format!(
                "no L3 cache allocation support under {}",
                resctrl_root.display()
            )));
        }

        let cbm_text = read_trimmed(&info.join("cbm_mask"))?;
        let capability_mask = parse_hex_mask(&cbm_text, "cbm_mask")?;
        let hex_width = cbm_text.len();

        // shareable_bits is optional in older kernels; absent means none.
        let shareable_mask = match read_trimmed(&info.join("shareable_bits")) {
            Ok(text) => parse_hex_mask(&text, "shareable_bits")?,
            Err(_) => 0,
        };

        let min_cbm_bits: u32 = read_trimmed(&info.join("min_cbm_bits"))?
            .parse()
            .map_err(|_| ShieldError::capability("unparseable min_cbm_bits"))?;

        let domains = parse_domains(&read_trimmed(&resctrl_root.join("schemata"))?)?;

        let ways_total = capability_mask.count_ones();
        let ways_shareable = (capability_mask & shareable_mask).count_ones();
        let ways_exclusive_max = ways_total - ways_shareable;
        if ways_exclusive_max == 0 {
            return Err(ShieldError::capability(format!(
                "all {ways_total} ways are shareable; no exclusive allocation is possible"
            )));
        }

        Ok(Self {
            domains,
            capability_mask,
            shareable_mask,
            min_cbm_bits,
            ways_total,
            ways_shareable,
            ways_exclusive_max,
            hex_width,
            bit_width: 64 - capability_mask.leading_zeros(),
            exclusive_base: capability_mask & !shareable_mask,
        })
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| ShieldError::io(path, e))
}

fn parse_hex_mask(text: &str, what: &str) -> Result<u64> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|_| ShieldError::capability(format!("unparseable {what} value '{text}'")))
}

/// Extract the domain id list from the root schemata's L3 line,
/// e.g. `L3:0=fffff;1=fffff` yields `[0, 1]`.
fn parse_domains(schemata: &str) -> Result<Vec<u32>> {
    let line = schemata
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("L3:"))
        .ok_or_else(|| ShieldError::capability("root schemata has no L3 line"))?;

    let mut domains = Vec::new();
    for entry in line.trim_start_matches("L3:").split(';') {
        let (id, _mask) = entry
            .split_once('=')
            .ok_or_else(|| ShieldError::capability(format!("malformed schemata entry '{entry}'")))?;
        domains.push(
            id.trim()
                .parse()
                .map_err(|_| ShieldError::capability(format!("malformed domain id '{id}'")))?,
        );
    }
    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn fake_resctrl(cbm: &str, shareable: &str, min_bits: &str, schemata: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let info = dir.path().join("info/L3");
        fs::create_dir_all(&info).unwrap();
        fs::write(info.join("cbm_mask"), cbm).unwrap();
        fs::write(info.join("shareable_bits"), shareable).unwrap();
        fs::write(info.join("min_cbm_bits"), min_bits).unwrap();
        fs::write(dir.path().join("schemata"), schemata).unwrap();
        dir
    }

    #[test]
    fn test_discover_twenty_way_topology() {
        let dir = fake_resctrl("fffff\n", "f\n", "2\n", "L3:0=fffff;1=fffff\n");
        let topo = CacheTopology::discover(dir.path()).unwrap();
        assert_eq!(topo.ways_total, 20);
        assert_eq!(topo.ways_shareable, 4);
        assert_eq!(topo.ways_exclusive_max, 16);
        assert_eq!(topo.min_cbm_bits, 2);
        assert_eq!(topo.domains, vec![0, 1]);
        assert_eq!(topo.hex_width, 5);
        assert_eq!(topo.bit_width, 20);
        assert_eq!(topo.exclusive_base, 0xffff0);
    }

    #[test]
    fn test_discover_without_info_dir_is_capability_error() {
        let dir = TempDir::new().unwrap();
        let err = CacheTopology::discover(dir.path()).unwrap_err();
        assert!(err.is_capability());
    }

    #[test]
    fn test_discover_all_shareable_is_capability_error() {
        let dir = fake_resctrl("fff\n", "fff\n", "1\n", "L3:0=fff\n");
        let err = CacheTopology::discover(dir.path()).unwrap_err();
        assert!(err.is_capability());
    }

    #[test]
    fn test_discover_missing_l3_line() {
        let dir = fake_resctrl("fff\n", "0\n", "1\n", "MB:0=100\n");
        assert!(CacheTopology::discover(dir.path()).is_err());
    }
}
