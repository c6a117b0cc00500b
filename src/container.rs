//! Container lifecycle: the two-phase launch, attach, listing, and the
//! cascading delete.
//!
//! `run` is the parent half: it wires the network, resolves the image,
//! mounts the overlay, and re-executes this binary (`/proc/self/exe`)
//! as the hidden `container child` subcommand inside fresh mount, UTS,
//! IPC, and PID namespaces. The network namespace is deliberately not
//! cloned; the child enters the pre-pinned one by file.
//!
//! `run_child` is the child half: enroll into the cgroup, join the
//! pinned network namespace, chroot into the overlay, remount the
//! pseudo filesystems, and run the user command.
//!
//! Cleanup is strictly LIFO through drop guards; the delete cascade
//! runs on every exit path of `run`.

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use nix::sched::{setns, unshare, CloneFlags};
use nix::unistd::{chdir, chroot, sethostname};
use tracing::{debug, error, info, warn};

use crate::cgroups::Cgroup;
use crate::constants::{
    CONTAINERS_PATH, HOSTNAME_ID_LEN, MIN_CONTAINER_ID_LEN, RESOLV_CONF_CANDIDATES,
};
use crate::error::{Error, Result};
use crate::filesystem::{self, MountPoint};
use crate::image::{self, ImageConfig, ImageConfigFile};
use crate::network;
use crate::repository::ImageRepository;
use crate::utils;

/// Flags shared by `container run` and the re-exec'd child.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Container hostname; empty selects the id-derived default.
    pub hostname: String,
    /// Memory limit in MiB, non-positive for unlimited.
    pub memory_mb: i64,
    /// Additional swap in MiB, non-positive for unlimited.
    pub swap_mb: i64,
    /// Process cap, non-positive for unlimited.
    pub pids: i64,
    /// CPU cores, non-positive for unlimited.
    pub cpus: f64,
    /// Propagated `-q`.
    pub quiet: bool,
    /// Propagated `-D`.
    pub debug: bool,
}

/// One row of `container ls`.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub command: String,
}

/// A single container invocation.
#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub rootfs: PathBuf,
    config: ImageConfigFile,
    cgroup: Cgroup,
}

impl Container {
    /// Builds the container handle and creates its cgroup directories.
    ///
    /// Ids shorter than twelve characters are rejected: they cannot
    /// provide the default hostname nor distinct interface names.
    pub fn new(id: &str) -> Result<Self> {
        if id.len() < MIN_CONTAINER_ID_LEN {
            return Err(Error::InvalidContainerId {
                id: id.to_string(),
                reason: format!("must be at least {} characters", MIN_CONTAINER_ID_LEN),
            });
        }
        Ok(Self {
            id: id.to_string(),
            rootfs: Path::new(CONTAINERS_PATH).join(id).join("mnt"),
            config: ImageConfigFile::default(),
            cgroup: Cgroup::new(id)?,
        })
    }

    fn dir(&self) -> PathBuf {
        Path::new(CONTAINERS_PATH).join(&self.id)
    }

    fn config_path(&self) -> PathBuf {
        self.dir().join("config.json")
    }

    /// The effective image config.
    pub fn config(&self) -> &ImageConfig {
        &self.config.config
    }

    /// Reads the container's persisted config.json.
    pub fn load_config(&mut self) -> Result<()> {
        debug!(container = %self.id, "load container config");
        self.config = ImageConfigFile::load(&self.config_path())?;
        Ok(())
    }

    // =========================================================================
    // Parent
    // =========================================================================

    /// Runs a command in a new container and returns its exit status.
    ///
    /// All acquired resources are released before this returns, whatever
    /// the exit path; release failures are logged, never propagated over
    /// the primary error.
    pub fn run(
        &mut self,
        repo: &mut ImageRepository,
        image_name: &str,
        cmds: &[String],
        opts: &RunOptions,
    ) -> Result<i32> {
        let result = self.run_parent(repo, image_name, cmds, opts);
        if let Err(e) = self.delete() {
            error!(container = %self.id, error = %e, "container cleanup failed");
        }
        result
    }

    fn run_parent(
        &mut self,
        repo: &mut ImageRepository,
        image_name: &str,
        cmds: &[String],
        opts: &RunOptions,
    ) -> Result<i32> {
        // Guards declared first drop last: overlay unmounts before the
        // namespace pin is released.
        let _netns = network::setup(&self.id)?;

        let image = image::resolve(repo, image_name)?;

        let _overlay = filesystem::overlay_mount(&self.rootfs, &image.lower_dirs())?;
        utils::copy_file(image.config_path(), self.config_path())?;

        let args = child_args(&self.id, cmds, opts);
        debug!(container = %self.id, ?args, "re-exec child");

        let mut child = Command::new("/proc/self/exe");
        child.args(&args);
        unsafe {
            // Mount, UTS, and IPC namespaces are unshared between fork
            // and exec, so only the child is affected.
            child.pre_exec(|| {
                unshare(
                    CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC,
                )
                .map_err(|e| io::Error::from_raw_os_error(e as i32))
            });
        }

        // The PID namespace must exist before the fork so the child is
        // its init process; unshare only affects children created after.
        unshare(CloneFlags::CLONE_NEWPID).map_err(|e| Error::ChildLaunch {
            reason: format!("unshare pid namespace: {}", e),
        })?;

        let status = child.status().map_err(|e| Error::ChildLaunch {
            reason: format!("spawn /proc/self/exe: {}", e),
        })?;

        info!(container = %self.id, code = exit_code(status), "container exited");
        Ok(exit_code(status))
    }

    // =========================================================================
    // Child
    // =========================================================================

    /// Entry point of the re-exec'd `container child` subcommand.
    pub fn run_child(&mut self, cmds: &[String], opts: &RunOptions) -> Result<i32> {
        self.set_hostname(&opts.hostname)?;

        self.cgroup.add_self()?;
        self.set_limits(opts)?;

        network::join_netns(&network::netns_path(&self.id))?;

        self.copy_nameserver_config()?;

        self.execute_command(cmds, true)
    }

    /// Applies the resource limits; non-positive values write nothing.
    fn set_limits(&self, opts: &RunOptions) -> Result<()> {
        debug!(container = %self.id, "apply resource limits");
        self.cgroup
            .set_mem_swap_limit(opts.memory_mb, opts.swap_mb)?;
        self.cgroup.set_pids_limit(opts.pids)?;
        self.cgroup.set_cpu_limit(opts.cpus)
    }

    /// Sets the UTS hostname and persists the override into the
    /// container's config. Defaults to the first twelve id characters,
    /// so the recorded hostname is never empty.
    fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        let hostname = if hostname.is_empty() {
            default_hostname(&self.id)
        } else {
            hostname
        };
        debug!(container = %self.id, hostname, "set hostname");
        self.config.config.hostname = hostname.to_string();
        sethostname(hostname).map_err(|e| Error::ChildLaunch {
            reason: format!("sethostname: {}", e),
        })?;
        self.config.save(&self.config_path())
    }

    /// Copies the host's resolver config into the rootfs; the first
    /// existing candidate wins.
    fn copy_nameserver_config(&self) -> Result<()> {
        for candidate in RESOLV_CONF_CANDIDATES {
            if Path::new(candidate).exists() {
                debug!(source = candidate, "copy nameserver config");
                return utils::copy_file(candidate, self.rootfs.join("etc/resolv.conf"));
            }
        }
        Ok(())
    }

    /// C5–C8 of the launch: chroot, pseudo-filesystem mounts (child
    /// only), command assembly, and execution with the image
    /// environment.
    fn execute_command(&mut self, cmds: &[String], child: bool) -> Result<i32> {
        if child {
            // Keep mount events inside this namespace before touching
            // the tree.
            filesystem::make_mounts_private()?;
        } else {
            let pid = self.main_pid()?;
            join_namespaces(pid)?;
        }

        chroot(&self.rootfs).map_err(|e| Error::ChildLaunch {
            reason: format!("chroot {}: {}", self.rootfs.display(), e),
        })?;
        let workdir = if self.config().working_dir.is_empty() {
            "/".to_string()
        } else {
            self.config().working_dir.clone()
        };
        chdir(Path::new(&workdir)).map_err(|e| Error::ChildLaunch {
            reason: format!("chdir {}: {}", workdir, e),
        })?;

        let _mounts = if child {
            Some(filesystem::mount_all(&[
                MountPoint::new("tmpfs", "/dev", "tmpfs"),
                MountPoint::new("proc", "/proc", "proc"),
                MountPoint::new("sysfs", "/sys", "sysfs"),
                MountPoint::new("tmpfs", "/tmp", "tmpfs"),
            ])?)
        } else {
            None
        };

        let argv = build_command_line(self.config(), cmds);
        if argv.is_empty() {
            return Err(Error::ChildLaunch {
                reason: "no command: none given and image config has no Cmd".to_string(),
            });
        }
        info!(container = %self.id, command = %argv.join(" "), "execute command");

        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .envs(environment(self.config()))
            .status()
            .map_err(|e| Error::ChildLaunch {
                reason: format!("exec {}: {}", argv[0], e),
            })?;

        Ok(exit_code(status))
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Runs an additional command inside an already running container by
    /// entering its namespaces.
    pub fn exec(&mut self, cmds: &[String]) -> Result<i32> {
        self.execute_command(cmds, false)
    }

    /// Pid of the container's main process: the last entry of the
    /// cgroup's `cgroup.procs`.
    fn main_pid(&self) -> Result<u32> {
        self.cgroup
            .get_pids()?
            .last()
            .copied()
            .ok_or_else(|| Error::ContainerNotFound(self.id.clone()))
    }

    /// The command line of the container's main process.
    fn main_command(&self) -> Result<String> {
        let pid = self.main_pid()?;
        let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid))?;
        let printable: Vec<u8> = cmdline
            .iter()
            .map(|&b| if b == 0 { b' ' } else { b })
            .collect();
        Ok(String::from_utf8_lossy(&printable).trim().to_string())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Removes everything keyed by this container's id: its directory
    /// tree, its namespace pin, and its cgroup directories.
    pub fn delete(&self) -> Result<()> {
        info!(container = %self.id, "delete container");

        let dir = self.dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        let netns = network::netns_path(&self.id);
        if netns.exists() {
            // Normally released by the namespace guard; this covers
            // leftovers from interrupted runs.
            std::fs::remove_file(&netns)?;
        }

        self.cgroup.remove();
        Ok(())
    }
}

/// Lists all containers that currently own a state directory.
pub fn list_all() -> Result<Vec<ContainerSummary>> {
    let mut all = Vec::new();
    let entries = match std::fs::read_dir(CONTAINERS_PATH) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(all),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().into_owned();

        let summary = Container::new(&id).and_then(|mut c| {
            c.load_config()?;
            let command = c.main_command()?;
            let image = c
                .config()
                .image
                .strip_prefix("sha256:")
                .unwrap_or(&c.config().image)
                .to_string();
            Ok(ContainerSummary { id: c.id, image, command })
        });
        match summary {
            Ok(s) => all.push(s),
            // A half-deleted directory or an exited main process is not
            // a listable container.
            Err(e) => warn!(container = %id, error = %e, "skipped in listing"),
        }
    }
    Ok(all)
}

// =============================================================================
// Helpers
// =============================================================================

/// Default hostname: the first twelve characters of the id.
pub fn default_hostname(id: &str) -> &str {
    &id[..HOSTNAME_ID_LEN]
}

/// Builds the argv of the re-exec'd child invocation.
pub fn child_args(id: &str, cmds: &[String], opts: &RunOptions) -> Vec<String> {
    let mut args = Vec::new();
    // Logging flags must be passed again; the child is a fresh process.
    if opts.quiet {
        args.push("-q".to_string());
    } else if opts.debug {
        args.push("-D".to_string());
    }
    args.push("container".to_string());
    args.push("child".to_string());
    if opts.memory_mb > 0 {
        args.push(format!("--mem={}", opts.memory_mb));
    }
    if opts.pids > 0 {
        args.push(format!("--pids={}", opts.pids));
    }
    if opts.cpus > 0.0 {
        args.push(format!("--cpus={}", opts.cpus));
    }
    args.push(format!("--hostname={}", opts.hostname));
    args.push(id.to_string());
    args.extend(cmds.iter().cloned());
    args
}

/// Final command line: user args (or the image `Cmd` when none), with
/// the image `Entrypoint` prepended unconditionally.
pub fn build_command_line(config: &ImageConfig, cmds: &[String]) -> Vec<String> {
    let mut argv = config.entrypoint.clone();
    if cmds.is_empty() {
        argv.extend(config.cmd.iter().cloned());
    } else {
        argv.extend(cmds.iter().cloned());
    }
    argv
}

/// The container process environment from the image config, with a
/// default PATH when the image sets none.
fn environment(config: &ImageConfig) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();
    if !env.iter().any(|(k, _)| k == "PATH") {
        env.push((
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        ));
    }
    env
}

/// Enters the UTS, IPC, PID, and NET namespaces of `pid`.
fn join_namespaces(pid: u32) -> Result<()> {
    for (name, flag) in [
        ("uts", CloneFlags::CLONE_NEWUTS),
        ("ipc", CloneFlags::CLONE_NEWIPC),
        ("pid", CloneFlags::CLONE_NEWPID),
        ("net", CloneFlags::CLONE_NEWNET),
    ] {
        let path = format!("/proc/{}/ns/{}", pid, name);
        let file = File::open(&path).map_err(|e| Error::ChildLaunch {
            reason: format!("open {}: {}", path, e),
        })?;
        setns(file.as_fd(), flag).map_err(|e| Error::ChildLaunch {
            reason: format!("setns {}: {}", path, e),
        })?;
    }
    Ok(())
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
