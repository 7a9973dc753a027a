//! sysfs topology lookups

use std::path::Path;
use std::path::PathBuf;

/// Convert an NVML style bus id (`00000000:3B:00.0`) to the sysfs device
/// name (`0000:3b:00.0`).
pub fn normalize_pci_bus_id(bus_id: &str) -> Option<String> {
    let (domain, rest) = bus_id.trim().split_once(':')?;
    let domain = u32::from_str_radix(domain, 16).ok()?;
    Some(format!("{domain:04x}:{}", rest.to_ascii_lowercase()))
}

fn numa_node_path(sysfs_root: &Path, bus_id: &str) -> Option<PathBuf> {
    let device = normalize_pci_bus_id(bus_id)?;
    Some(
        sysfs_root
            .join("bus/pci/devices")
            .join(device)
            .join("numa_node"),
    )
}

/// NUMA node of a PCI device.
///
/// `None` when the bus id is malformed, the file is missing or unreadable,
/// or the kernel reports no affinity (`-1`).
pub fn numa_node(sysfs_root: &Path, bus_id: &str) -> Option<u32> {
    let path = numa_node_path(sysfs_root, bus_id)?;
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "NUMA node unavailable");
            return None;
        }
    };
    let node: i64 = content.trim().parse().ok()?;
    u32::try_from(node).ok()
}
