//! Cgroup directory resolution.
//!
//! A workload's cgroup directory is located by probing a fixed list of path
//! templates covering the common hierarchy conventions: systemd slices with
//! the sanitised workload id, the plain filesystem layout, and wildcarded
//! fallbacks for nonstandard parents. The first existing match wins and is
//! cached by the sampler.

use crate::common::WorkloadId;
use std::path::{Path, PathBuf};

/// Systemd slice names replace every `-` and `.` in the id with `_`.
pub fn sanitize_id(id: &WorkloadId) -> String {
    id.as_str().replace(['-', '.'], "_")
}

/// Candidate directories for a workload id, most specific first.
pub fn candidate_paths(root: &Path, id: &WorkloadId) -> Vec<PathBuf> {
    let raw = id.as_str();
    let sanitized = sanitize_id(id);

    let mut candidates = vec![
        // systemd-managed hierarchy, per QoS class slice
        root.join(format!(
            "kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod{}.slice",
            sanitized
        )),
        root.join(format!(
            "kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{}.slice",
            sanitized
        )),
        root.join(format!("kubepods.slice/kubepods-pod{}.slice", sanitized)),
        // cgroupfs-managed hierarchy
        root.join(format!("kubepods/burstable/pod{}", raw)),
        root.join(format!("kubepods/besteffort/pod{}", raw)),
        root.join(format!("kubepods/pod{}", raw)),
    ];

    // Wildcard fallback: scan one level under kubepods.slice for any slice
    // directory containing the sanitised id.
    let slice_root = root.join("kubepods.slice");
    if let Ok(entries) = std::fs::read_dir(&slice_root) {
        for entry in entries.flatten() {
            let child = entry.path();
            if !child.is_dir() {
                continue;
            }
            if let Ok(inner) = std::fs::read_dir(&child) {
                for inner_entry in inner.flatten() {
                    let name = inner_entry.file_name();
                    if name.to_string_lossy().contains(&sanitized) {
                        candidates.push(inner_entry.path());
                    }
                }
            }
        }
    }

    candidates
}

/// Probe candidates for the first directory that actually contains the CPU
/// statistics file.
pub fn resolve(root: &Path, id: &WorkloadId) -> Option<PathBuf> {
    candidate_paths(root, id)
        .into_iter()
        .find(|p| p.join(super::CPU_STAT_FILE).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_dashes_and_dots() {
        let id = WorkloadId::from("8f3b-4a.c1");
        assert_eq!(sanitize_id(&id), "8f3b_4a_c1");
    }

    #[test]
    fn resolve_finds_systemd_slice() {
        let dir = tempfile::tempdir().unwrap();
        let id = WorkloadId::from("abc-123");
        let slice = dir.path().join(
            "kubepods.slice/kubepods-burstable.slice/kubepods-burstable-podabc_123.slice",
        );
        std::fs::create_dir_all(&slice).unwrap();
        std::fs::write(slice.join("cpu.stat"), "usage_usec 0\nthrottled_usec 0\n").unwrap();

        assert_eq!(resolve(dir.path(), &id), Some(slice));
    }

    #[test]
    fn resolve_finds_cgroupfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let id = WorkloadId::from("abc-123");
        let pod_dir = dir.path().join("kubepods/besteffort/podabc-123");
        std::fs::create_dir_all(&pod_dir).unwrap();
        std::fs::write(pod_dir.join("cpu.stat"), "usage_usec 0\n").unwrap();

        assert_eq!(resolve(dir.path(), &id), Some(pod_dir));
    }

    #[test]
    fn resolve_falls_back_to_wildcard_scan() {
        let dir = tempfile::tempdir().unwrap();
        let id = WorkloadId::from("abc-123");
        // Nonstandard parent slice the fixed templates do not cover.
        let slice = dir
            .path()
            .join("kubepods.slice/kubepods-guaranteed.slice/custom-podabc_123-extra.scope");
        std::fs::create_dir_all(&slice).unwrap();
        std::fs::write(slice.join("cpu.stat"), "usage_usec 0\n").unwrap();

        assert_eq!(resolve(dir.path(), &id), Some(slice));
    }

    #[test]
    fn resolve_misses_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve(dir.path(), &WorkloadId::from("nope")).is_none());
    }
}
