//! Cgroups v2: a single directory in the unified tree.
//!
//! The app-level group carries the controller delegation
//! (`cgroup.subtree_control`); the per-container group below it stays a
//! leaf so processes can be enrolled.

use std::path::{Path, PathBuf};

use crate::constants::{CGROUP_PROCS, DEFAULT_CFS_PERIOD, SUBTREE_CONTROL, SUBTREE_CONTROLLERS};
use crate::error::Result;
use crate::utils::create_dir;

use super::{cfs_quota, cpu_limit_applies, read_pids, remove_dir, write_file, write_limit};

/// A container's group in the unified hierarchy.
#[derive(Debug)]
pub struct CgroupV2 {
    dir: PathBuf,
}

impl CgroupV2 {
    /// Ensures `<root>/<app>` exists with cpu, memory, and pids
    /// delegated, then creates `<root>/<app>/<id>`.
    pub fn with_root(root: &Path, app: &str, id: &str) -> Result<Self> {
        let app_dir = root.join(app);
        create_dir(&app_dir)?;
        write_file(&app_dir.join(SUBTREE_CONTROL), SUBTREE_CONTROLLERS)?;

        let dir = app_dir.join(id);
        create_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn set_mem_swap_limit(&self, memory_mb: i64, swap_mb: i64) -> Result<()> {
        if memory_mb <= 0 {
            return Ok(());
        }
        write_limit(&self.dir.join("memory.max"), &(memory_mb << 20).to_string())?;
        if swap_mb > 0 {
            write_limit(
                &self.dir.join("memory.swap.max"),
                &((memory_mb + swap_mb) << 20).to_string(),
            )?;
        }
        Ok(())
    }

    pub fn set_pids_limit(&self, pids: i64) -> Result<()> {
        if pids <= 0 {
            return Ok(());
        }
        write_limit(&self.dir.join("pids.max"), &pids.to_string())
    }

    pub fn set_cpu_limit(&self, cpus: f64) -> Result<()> {
        if !cpu_limit_applies(cpus) {
            return Ok(());
        }
        // The kernel expects "<quota> <period>", space-separated.
        let value = format!("{} {}", cfs_quota(cpus), DEFAULT_CFS_PERIOD);
        write_limit(&self.dir.join("cpu.max"), &value)
    }

    pub fn add_process(&self, pid: u32) -> Result<()> {
        write_file(&self.dir.join(CGROUP_PROCS), &pid.to_string())
    }

    pub fn remove(&self) {
        remove_dir(&self.dir);
    }

    pub fn get_pids(&self) -> Result<Vec<u32>> {
        read_pids(&self.dir)
    }
}
