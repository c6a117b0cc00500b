//! Cgroups v1: one directory per controller tree.

use std::path::{Path, PathBuf};

use crate::constants::{CGROUP_PROCS, DEFAULT_CFS_PERIOD};
use crate::error::Result;
use crate::utils::create_dir;

use super::{cfs_quota, cpu_limit_applies, read_pids, remove_dir, write_file, write_limit};

const CONTROLLERS: [&str; 3] = ["memory", "cpu", "pids"];

/// A container's group across the memory, cpu, and pids v1 trees.
#[derive(Debug)]
pub struct CgroupV1 {
    memory: PathBuf,
    cpu: PathBuf,
    pids: PathBuf,
}

impl CgroupV1 {
    /// Creates `<root>/<controller>/<app>/<id>` for each controller.
    pub fn with_root(root: &Path, app: &str, id: &str) -> Result<Self> {
        let dir = |controller: &str| root.join(controller).join(app).join(id);
        let cg = Self {
            memory: dir("memory"),
            cpu: dir("cpu"),
            pids: dir("pids"),
        };
        for controller in CONTROLLERS {
            create_dir(dir(controller))?;
        }
        Ok(cg)
    }

    pub fn set_mem_swap_limit(&self, memory_mb: i64, swap_mb: i64) -> Result<()> {
        if memory_mb <= 0 {
            return Ok(());
        }
        write_limit(
            &self.memory.join("memory.limit_in_bytes"),
            &(memory_mb << 20).to_string(),
        )?;
        if swap_mb > 0 {
            write_limit(
                &self.memory.join("memory.memsw.limit_in_bytes"),
                &((memory_mb + swap_mb) << 20).to_string(),
            )?;
        }
        Ok(())
    }

    pub fn set_pids_limit(&self, pids: i64) -> Result<()> {
        if pids <= 0 {
            return Ok(());
        }
        write_limit(&self.pids.join("pids.max"), &pids.to_string())
    }

    pub fn set_cpu_limit(&self, cpus: f64) -> Result<()> {
        if !cpu_limit_applies(cpus) {
            return Ok(());
        }
        write_limit(
            &self.cpu.join("cpu.cfs_period_us"),
            &DEFAULT_CFS_PERIOD.to_string(),
        )?;
        write_limit(
            &self.cpu.join("cpu.cfs_quota_us"),
            &cfs_quota(cpus).to_string(),
        )
    }

    pub fn add_process(&self, pid: u32) -> Result<()> {
        for dir in [&self.memory, &self.cpu, &self.pids] {
            write_file(&dir.join(CGROUP_PROCS), &pid.to_string())?;
        }
        Ok(())
    }

    pub fn remove(&self) {
        for dir in [&self.memory, &self.cpu, &self.pids] {
            remove_dir(dir);
        }
    }

    pub fn get_pids(&self) -> Result<Vec<u32>> {
        read_pids(&self.pids)
    }
}
