//! CPU topology lookups
//!
//! Thin readers over the kernel's cpulist-format sysfs files: the online
//! CPU set and per-core sibling-thread enumeration.

use crate::config::parse_cpu_list;
use crate::error::Result;
use std::path::Path;
use tracing::debug;

/// All currently online CPU ids
pub fn online_cpus(cpu_base: &Path) -> Result<Vec<u32>> {
    let path = cpu_base.join("online");
    let text = std::fs::read_to_string(&path)
        .map_err(|e| crate::error::ShieldError::io(path, e))?;
    parse_cpu_list(text.trim())
}

/// The hardware threads sharing `cpu`'s physical core, `cpu` included.
///
/// Falls back to the target alone when the topology file is absent, as on
/// platforms without SMT.
pub fn sibling_threads(cpu_base: &Path, cpu: u32) -> Vec<u32> {
    let path = cpu_base.join(format!("cpu{cpu}/topology/thread_siblings_list"));
    match std::fs::read_to_string(&path) {
        Ok(text) => match parse_cpu_list(text.trim()) {
            Ok(siblings) if !siblings.is_empty() => siblings,
            _ => vec![cpu],
        },
        Err(_) => {
            debug!(cpu, "no sibling topology, assuming single thread");
            vec![cpu]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_online_cpus() {
        let base = TempDir::new().unwrap();
        fs::write(base.path().join("online"), "0-3,8\n").unwrap();
        assert_eq!(online_cpus(base.path()).unwrap(), vec![0, 1, 2, 3, 8]);
    }

    #[test]
    fn test_sibling_threads() {
        let base = TempDir::new().unwrap();
        let dir = base.path().join("cpu2/topology");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("thread_siblings_list"), "2,34\n").unwrap();
        assert_eq!(sibling_threads(base.path(), 2), vec![2, 34]);
    }

    #[test]
    fn test_sibling_fallback_without_topology() {
        let base = TempDir::new().unwrap();
        assert_eq!(sibling_threads(base.path(), 7), vec![7]);
    }
}
