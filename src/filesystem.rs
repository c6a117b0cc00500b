//! Mount plumbing: grouped mounts with LIFO unmount guards, and the
//! overlay assembly that stacks image layers under a writable top.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One mount request.
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl MountPoint {
    pub fn new(source: &str, target: impl Into<PathBuf>, fstype: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.into(),
            fstype: fstype.to_string(),
            flags: MsFlags::empty(),
            data: None,
        }
    }
}

/// Unmounts its targets in reverse mount order when dropped.
///
/// Unmount failures are logged, never propagated, so one stuck target
/// does not leave the rest mounted.
#[derive(Debug)]
pub struct MountGuard {
    targets: Vec<PathBuf>,
}

impl MountGuard {
    fn new() -> Self {
        Self {
            targets: Vec::new(),
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        for target in self.targets.iter().rev() {
            debug!(target = %target.display(), "unmount");
            if let Err(e) = umount(target) {
                warn!(target = %target.display(), error = %e, "unmount failed");
            }
        }
    }
}

/// Mounts every entry in order and returns a guard for all of them.
///
/// On failure the entries mounted so far are unwound by the guard before
/// the error is returned.
pub fn mount_all(points: &[MountPoint]) -> Result<MountGuard> {
    let mut guard = MountGuard::new();
    for p in points {
        debug!(source = %p.source, target = %p.target.display(), fstype = %p.fstype, "mount");
        mount(
            Some(p.source.as_str()),
            &p.target,
            Some(p.fstype.as_str()),
            p.flags,
            p.data.as_deref(),
        )
        .map_err(|e| Error::FsAssembly {
            target: p.target.clone(),
            reason: e.to_string(),
        })?;
        guard.targets.push(p.target.clone());
    }
    Ok(guard)
}

/// Builds the overlayfs option string from the three directory sets.
pub fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lower: Vec<&str> = lower.iter().filter_map(|p| p.to_str()).collect();
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.join(":"),
        upper.display(),
        work.display()
    )
}

/// Mounts a writable overlay of `lower_dirs` (top-down order) at
/// `target`, creating `diff` and `work` siblings with mode 0700.
pub fn overlay_mount(target: &Path, lower_dirs: &[PathBuf]) -> Result<MountGuard> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::FsAssembly {
            target: target.to_path_buf(),
            reason: "overlay target has no parent directory".to_string(),
        })?
        .to_path_buf();
    let upper = parent.join("diff");
    let work = parent.join("work");

    for dir in [target, &upper, &work] {
        if !dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|e| Error::FsAssembly {
                    target: dir.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }
    }

    let mut point = MountPoint::new("none", target, "overlay");
    point.data = Some(overlay_options(lower_dirs, &upper, &work));
    mount_all(std::slice::from_ref(&point))
}

/// Recursively marks the mount tree below `/` private so mounts made in
/// a fresh mount namespace never propagate back to the host.
pub fn make_mounts_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::FsAssembly {
        target: PathBuf::from("/"),
        reason: format!("cannot make mounts private: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_options_join_lower_dirs_with_colons() {
        let lower = vec![PathBuf::from("/l/top"), PathBuf::from("/l/base")];
        let opts = overlay_options(&lower, Path::new("/c/diff"), Path::new("/c/work"));
        assert_eq!(
            opts,
            "lowerdir=/l/top:/l/base,upperdir=/c/diff,workdir=/c/work"
        );
    }

    #[test]
    fn overlay_options_single_lower_dir() {
        let lower = vec![PathBuf::from("/l/only")];
        let opts = overlay_options(&lower, Path::new("/c/diff"), Path::new("/c/work"));
        assert_eq!(opts, "lowerdir=/l/only,upperdir=/c/diff,workdir=/c/work");
    }
}
