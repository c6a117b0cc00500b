//! Tests for the cgroup controller.
//!
//! Exercises both ABI implementations against a scratch root so no
//! kernel hierarchy is touched: directory layout, limit file contents,
//! the non-positive "unlimited" sentinels, enrollment, and removal.

use std::fs;

use koker::cgroups::{CgroupV1, CgroupV2};
use tempfile::TempDir;

fn host_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

// =============================================================================
// v1 Layout and Limits
// =============================================================================

#[test]
fn v1_creates_one_directory_per_controller() {
    let root = TempDir::new().unwrap();
    CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    for controller in ["memory", "cpu", "pids"] {
        assert!(
            root.path().join(controller).join("koker/abc123").is_dir(),
            "missing {} tree",
            controller
        );
    }
}

#[test]
fn v1_memory_limit_is_mebibytes() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_mem_swap_limit(32, -1).unwrap();

    let limit = root.path().join("memory/koker/abc123/memory.limit_in_bytes");
    assert_eq!(fs::read_to_string(limit).unwrap(), "33554432");
    assert!(
        !root
            .path()
            .join("memory/koker/abc123/memory.memsw.limit_in_bytes")
            .exists(),
        "swap file must not be written without a swap limit"
    );
}

#[test]
fn v1_swap_limit_adds_memory_and_swap() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_mem_swap_limit(32, 16).unwrap();

    let memsw = root
        .path()
        .join("memory/koker/abc123/memory.memsw.limit_in_bytes");
    assert_eq!(fs::read_to_string(memsw).unwrap(), "50331648");
}

#[test]
fn v1_nonpositive_memory_writes_nothing() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_mem_swap_limit(0, 64).unwrap();
    cg.set_mem_swap_limit(-1, 64).unwrap();

    let memory_dir = root.path().join("memory/koker/abc123");
    assert_eq!(fs::read_dir(&memory_dir).unwrap().count(), 0);
}

#[test]
fn v1_pids_limit() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_pids_limit(64).unwrap();
    let pids = root.path().join("pids/koker/abc123/pids.max");
    assert_eq!(fs::read_to_string(pids).unwrap(), "64");

    cg.set_pids_limit(0).unwrap();
    cg.set_pids_limit(-1).unwrap();
}

#[test]
fn v1_nonpositive_pids_writes_nothing() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_pids_limit(-5).unwrap();
    assert!(!root.path().join("pids/koker/abc123/pids.max").exists());
}

#[test]
fn v1_cpu_limit_writes_quota_and_period() {
    if host_cpus() < 2 {
        eprintln!("skipping: single-CPU host treats any request as unlimited");
        return;
    }
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_cpu_limit(0.5).unwrap();

    let cpu = root.path().join("cpu/koker/abc123");
    assert_eq!(
        fs::read_to_string(cpu.join("cpu.cfs_period_us")).unwrap(),
        "100000"
    );
    assert_eq!(
        fs::read_to_string(cpu.join("cpu.cfs_quota_us")).unwrap(),
        "50000"
    );
}

#[test]
fn v1_cpu_limit_at_or_above_host_count_is_a_noop() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_cpu_limit(host_cpus() as f64).unwrap();
    cg.set_cpu_limit(host_cpus() as f64 + 2.0).unwrap();
    cg.set_cpu_limit(0.0).unwrap();
    cg.set_cpu_limit(-1.0).unwrap();

    let cpu_dir = root.path().join("cpu/koker/abc123");
    assert_eq!(fs::read_dir(&cpu_dir).unwrap().count(), 0);
}

// =============================================================================
// v1 Enrollment and Removal
// =============================================================================

#[test]
fn v1_add_process_enrolls_in_every_controller() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.add_process(4321).unwrap();

    for controller in ["memory", "cpu", "pids"] {
        let procs = root
            .path()
            .join(controller)
            .join("koker/abc123/cgroup.procs");
        assert_eq!(fs::read_to_string(procs).unwrap(), "4321");
    }
}

#[test]
fn v1_get_pids_reads_every_line() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    let procs = root.path().join("pids/koker/abc123/cgroup.procs");
    fs::write(procs, "100\n200\n300\n").unwrap();

    assert_eq!(cg.get_pids().unwrap(), vec![100, 200, 300]);
}

#[test]
fn v1_remove_deletes_empty_groups_and_tolerates_absence() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV1::with_root(root.path(), "koker", "abc123").unwrap();

    cg.remove();
    for controller in ["memory", "cpu", "pids"] {
        assert!(!root.path().join(controller).join("koker/abc123").exists());
    }

    // Removing again must be silent.
    cg.remove();
}

// =============================================================================
// v2 Layout and Limits
// =============================================================================

#[test]
fn v2_delegates_controllers_in_the_app_group() {
    let root = TempDir::new().unwrap();
    CgroupV2::with_root(root.path(), "koker", "abc123").unwrap();

    let control = root.path().join("koker/cgroup.subtree_control");
    let content = fs::read_to_string(control).unwrap();
    for controller in ["+cpu", "+memory", "+pids"] {
        assert!(content.contains(controller), "missing {}", controller);
    }
    assert!(root.path().join("koker/abc123").is_dir());
    assert!(
        !root.path().join("koker/abc123/cgroup.subtree_control").exists(),
        "the leaf group must not delegate controllers"
    );
}

#[test]
fn v2_memory_and_swap_limits() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV2::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_mem_swap_limit(32, 16).unwrap();

    let dir = root.path().join("koker/abc123");
    assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "33554432");
    assert_eq!(
        fs::read_to_string(dir.join("memory.swap.max")).unwrap(),
        "50331648"
    );
}

#[test]
fn v2_nonpositive_limits_write_nothing() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV2::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_mem_swap_limit(-1, 16).unwrap();
    cg.set_pids_limit(0).unwrap();
    cg.set_cpu_limit(-0.5).unwrap();

    let dir = root.path().join("koker/abc123");
    assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
}

#[test]
fn v2_cpu_max_is_space_separated() {
    if host_cpus() < 2 {
        eprintln!("skipping: single-CPU host treats any request as unlimited");
        return;
    }
    let root = TempDir::new().unwrap();
    let cg = CgroupV2::with_root(root.path(), "koker", "abc123").unwrap();

    cg.set_cpu_limit(0.5).unwrap();

    let cpu_max = root.path().join("koker/abc123/cpu.max");
    assert_eq!(fs::read_to_string(cpu_max).unwrap(), "50000 100000");
}

#[test]
fn v2_enrollment_and_pids_round_trip() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV2::with_root(root.path(), "koker", "abc123").unwrap();

    cg.add_process(7777).unwrap();
    assert_eq!(cg.get_pids().unwrap(), vec![7777]);
}

#[test]
fn v2_remove_is_idempotent() {
    let root = TempDir::new().unwrap();
    let cg = CgroupV2::with_root(root.path(), "koker", "abc123").unwrap();

    cg.remove();
    assert!(!root.path().join("koker/abc123").exists());
    cg.remove();
}
