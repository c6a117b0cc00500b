//! Cgroup resource control across both kernel ABIs.
//!
//! The host's cgroup mode is detected once from the filesystem magic of
//! `/sys/fs/cgroup`; legacy and hybrid hosts use the v1 controller
//! trees, unified hosts the v2 tree. Callers only ever see [`Cgroup`],
//! the tagged variant over the two implementations.
//!
//! Every limit setter treats a non-positive input as the "unlimited"
//! sentinel and writes nothing. A limit file the kernel does not offer
//! (for example `memory.memsw.*` without swap accounting) is skipped
//! silently; a kernel that refuses a value is an error.

mod v1;
mod v2;

pub use v1::CgroupV1;
pub use v2::CgroupV2;

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC};
use tracing::debug;

use crate::constants::{APP, CGROUP_MOUNTPOINT, CGROUP_PROCS, DEFAULT_CFS_PERIOD};
use crate::error::{Error, Result};

/// The cgroup layout of the host system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No usable cgroup mountpoint.
    Unavailable,
    /// Cgroups v1 only.
    Legacy,
    /// v1 controllers with a v2 tree mounted at `unified/`.
    Hybrid,
    /// Cgroups v2 only.
    Unified,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Unavailable => "unavailable",
            Mode::Legacy => "legacy",
            Mode::Hybrid => "hybrid",
            Mode::Unified => "unified",
        };
        f.write_str(name)
    }
}

/// Detects the cgroup mode from `/sys/fs/cgroup`.
pub fn mode() -> Result<Mode> {
    mode_at(Path::new(CGROUP_MOUNTPOINT))
}

/// Mode detection against an explicit mountpoint.
pub fn mode_at(mountpoint: &Path) -> Result<Mode> {
    let st = statfs(mountpoint).map_err(|e| Error::Cgroup {
        reason: format!("statfs {}: {}", mountpoint.display(), e),
    })?;
    if st.filesystem_type() == CGROUP2_SUPER_MAGIC {
        return Ok(Mode::Unified);
    }
    // A hybrid host mounts a v2 tree at `unified/`; anything else,
    // including no such directory, is legacy v1.
    match statfs(&mountpoint.join("unified")) {
        Ok(st) if st.filesystem_type() == CGROUP2_SUPER_MAGIC => Ok(Mode::Hybrid),
        _ => Ok(Mode::Legacy),
    }
}

/// Per-container cgroup, selected once at container construction.
#[derive(Debug)]
pub enum Cgroup {
    V1(CgroupV1),
    V2(CgroupV2),
}

impl Cgroup {
    /// Creates the container's cgroup directories under the app group,
    /// picking the implementation for the detected mode.
    pub fn new(id: &str) -> Result<Self> {
        let mountpoint = Path::new(CGROUP_MOUNTPOINT);
        let mode = mode()?;
        debug!(%mode, container = id, "cgroup mode detected");
        match mode {
            Mode::Legacy | Mode::Hybrid => {
                Ok(Self::V1(CgroupV1::with_root(mountpoint, APP, id)?))
            }
            Mode::Unified => Ok(Self::V2(CgroupV2::with_root(mountpoint, APP, id)?)),
            Mode::Unavailable => Err(Error::Cgroup {
                reason: "no cgroup hierarchy mounted".to_string(),
            }),
        }
    }

    /// Sets the memory limit, and the memory+swap limit when both are
    /// positive. Non-positive memory writes nothing.
    pub fn set_mem_swap_limit(&self, memory_mb: i64, swap_mb: i64) -> Result<()> {
        match self {
            Self::V1(cg) => cg.set_mem_swap_limit(memory_mb, swap_mb),
            Self::V2(cg) => cg.set_mem_swap_limit(memory_mb, swap_mb),
        }
    }

    /// Caps the number of processes. Non-positive writes nothing.
    pub fn set_pids_limit(&self, pids: i64) -> Result<()> {
        match self {
            Self::V1(cg) => cg.set_pids_limit(pids),
            Self::V2(cg) => cg.set_pids_limit(pids),
        }
    }

    /// Applies a CFS quota for `cpus` cores. Writes nothing when the
    /// request is non-positive or not below the host's CPU count.
    pub fn set_cpu_limit(&self, cpus: f64) -> Result<()> {
        match self {
            Self::V1(cg) => cg.set_cpu_limit(cpus),
            Self::V2(cg) => cg.set_cpu_limit(cpus),
        }
    }

    /// Enrolls the calling process.
    pub fn add_self(&self) -> Result<()> {
        self.add_process(std::process::id())
    }

    /// Enrolls an arbitrary pid.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        match self {
            Self::V1(cg) => cg.add_process(pid),
            Self::V2(cg) => cg.add_process(pid),
        }
    }

    /// Removes the container's cgroup directories. Only effective once
    /// no process remains; missing directories are ignored.
    pub fn remove(&self) {
        match self {
            Self::V1(cg) => cg.remove(),
            Self::V2(cg) => cg.remove(),
        }
    }

    /// Returns the pids currently enrolled.
    pub fn get_pids(&self) -> Result<Vec<u32>> {
        match self {
            Self::V1(cg) => cg.get_pids(),
            Self::V2(cg) => cg.get_pids(),
        }
    }
}

// =============================================================================
// Shared Plumbing
// =============================================================================

/// Writes a limit file, silently skipping controllers the kernel does
/// not offer.
pub(crate) fn write_limit(path: &Path, value: &str) -> Result<()> {
    match fs::write(path, value) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(file = %path.display(), "limit file not supported, skipped");
            Ok(())
        }
        Err(e) => Err(Error::Cgroup {
            reason: format!("write {}: {}", path.display(), e),
        }),
    }
}

/// Writes a file that must exist (enrollment, controller delegation).
pub(crate) fn write_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| Error::Cgroup {
        reason: format!("write {}: {}", path.display(), e),
    })
}

/// Parses one `cgroup.procs` file.
pub(crate) fn read_pids(dir: &Path) -> Result<Vec<u32>> {
    let content = fs::read_to_string(dir.join(CGROUP_PROCS)).map_err(|e| Error::Cgroup {
        reason: format!("read {}/{}: {}", dir.display(), CGROUP_PROCS, e),
    })?;
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// Removes a cgroup directory, ignoring missing ones.
pub(crate) fn remove_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir(dir) {
        debug!(dir = %dir.display(), error = %e, "cgroup directory not removed");
    }
}

/// Number of CPUs available to this process.
pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The CFS quota for a fractional CPU request, rounded to microseconds.
pub(crate) fn cfs_quota(cpus: f64) -> i64 {
    (cpus * DEFAULT_CFS_PERIOD as f64).round() as i64
}

/// Whether a CPU request is an actual cap for this host.
pub(crate) fn cpu_limit_applies(cpus: f64) -> bool {
    cpus > 0.0 && cpus < num_cpus() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_detects_something_on_linux() {
        // Whatever the host runs, detection must not error.
        let m = mode().unwrap();
        assert_ne!(m, Mode::Unavailable);
    }

    #[test]
    fn quota_is_rounded() {
        assert_eq!(cfs_quota(0.5), 50_000);
        assert_eq!(cfs_quota(1.0), 100_000);
        assert_eq!(cfs_quota(0.333), 33_300);
    }

    #[test]
    fn cpu_limit_sentinels() {
        assert!(!cpu_limit_applies(0.0));
        assert!(!cpu_limit_applies(-1.0));
        assert!(!cpu_limit_applies(num_cpus() as f64));
        assert!(!cpu_limit_applies(num_cpus() as f64 + 1.0));
        if num_cpus() > 1 {
            assert!(cpu_limit_applies(0.5));
        }
    }
}
