//! Container networking.
//!
//! Host preflight brings up the `koker0` bridge and the NAT rule once
//! per run. Per container, [`setup`] creates a veth pair, enslaves the
//! host end to the bridge, pins a fresh network namespace onto a
//! bind-mounted file, moves the peer inside, and configures address,
//! loopback, and default route from within the namespace.
//!
//! The returned [`NetnsGuard`] releases the namespace pin; the veth pair
//! dies with the namespace.

pub mod netlink;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use ipnetwork::Ipv4Network;
use nix::mount::{mount, umount, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use tracing::{debug, info, warn};

use crate::constants::{
    BRIDGE_ADDR, BRIDGE_GATEWAY, BRIDGE_NAME, CONTAINER_ETH, CONTAINER_SUBNET, IFACE_ID_LEN,
    NETNS_PATH, VETH_HOST_PREFIX, VETH_PEER_PREFIX,
};
use crate::error::{Error, Result};
use crate::utils::{random_container_ip, random_mac};
use netlink::NetlinkSocket;

/// Maps plumbing errors into the wiring taxonomy.
fn wiring(context: &str, e: impl std::fmt::Display) -> Error {
    Error::NetworkWiring {
        reason: format!("{}: {}", context, e),
    }
}

/// Host-side veth name for a container id.
pub fn host_veth_name(id: &str) -> String {
    format!("{}{}", VETH_HOST_PREFIX, &id[..IFACE_ID_LEN.min(id.len())])
}

/// Container-side veth name before the rename to `eth0`.
pub fn peer_veth_name(id: &str) -> String {
    format!("{}{}", VETH_PEER_PREFIX, &id[..IFACE_ID_LEN.min(id.len())])
}

/// The bind-mount file pinning a container's network namespace.
pub fn netns_path(id: &str) -> PathBuf {
    Path::new(NETNS_PATH).join(id)
}

// =============================================================================
// Host Preflight
// =============================================================================

/// Ensures bridge and NAT are in place. Must succeed before any
/// container directory is created.
pub fn preflight() -> Result<()> {
    ensure_bridge()?;
    ensure_nat()
}

/// Creates `koker0` when missing, assigns its address when absent, and
/// brings it up. Safe to call repeatedly.
pub fn ensure_bridge() -> Result<()> {
    let mut nl = NetlinkSocket::open().map_err(|e| preflight_err("open netlink socket", e))?;

    if !netlink::link_exists(BRIDGE_NAME) {
        info!(bridge = BRIDGE_NAME, "create default bridge");
        nl.create_bridge(BRIDGE_NAME)
            .map_err(|e| preflight_err("create bridge", e))?;
    }

    let addr: Ipv4Network = BRIDGE_ADDR
        .parse()
        .map_err(|e| preflight_err("parse bridge address", e))?;
    match nl.add_address(BRIDGE_NAME, addr) {
        Ok(()) => debug!(bridge = BRIDGE_NAME, addr = BRIDGE_ADDR, "bridge addressed"),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
            debug!(bridge = BRIDGE_NAME, "bridge already addressed")
        }
        Err(e) => return Err(preflight_err("assign bridge address", e)),
    }

    nl.set_link_up(BRIDGE_NAME)
        .map_err(|e| preflight_err("bring bridge up", e))
}

fn preflight_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Preflight {
        reason: format!("{}: {}", context, e),
    }
}

/// Appends the POSTROUTING MASQUERADE rule for the container subnet,
/// checking first so repeated runs do not stack duplicates.
pub fn ensure_nat() -> Result<()> {
    let rule = [
        "-s",
        CONTAINER_SUBNET,
        "!",
        "-o",
        BRIDGE_NAME,
        "-j",
        "MASQUERADE",
    ];

    let check = Command::new("iptables")
        .args(["-t", "nat", "-C", "POSTROUTING"])
        .args(rule)
        .output()
        .map_err(|e| Error::Preflight {
            reason: format!("iptables not available: {}", e),
        })?;
    if check.status.success() {
        debug!("NAT rule already present");
        return Ok(());
    }

    info!(subnet = CONTAINER_SUBNET, "append NAT masquerade rule");
    let append = Command::new("iptables")
        .args(["-t", "nat", "-A", "POSTROUTING"])
        .args(rule)
        .output()
        .map_err(|e| Error::Preflight {
            reason: format!("iptables not available: {}", e),
        })?;
    if !append.status.success() {
        return Err(Error::Preflight {
            reason: format!(
                "iptables append failed: {}",
                String::from_utf8_lossy(&append.stderr).trim()
            ),
        });
    }
    Ok(())
}

// =============================================================================
// Namespace Pinning
// =============================================================================

/// Scoped release handle for a pinned network namespace: unmounts the
/// bind mount and unlinks the file on drop.
#[derive(Debug)]
pub struct NetnsGuard {
    path: PathBuf,
}

impl NetnsGuard {
    /// Path of the pinned namespace file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        debug!(netns = %self.path.display(), "release network namespace");
        if let Err(e) = umount(&self.path) {
            warn!(netns = %self.path.display(), error = %e, "netns unmount failed");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(netns = %self.path.display(), error = %e, "netns unlink failed");
        }
    }
}

/// Creates a fresh network namespace and pins it at `target` without
/// leaving the caller's namespace changed.
///
/// Sequence: create the pin file, save the current namespace fd,
/// `unshare(CLONE_NEWNET)`, bind-mount `/proc/self/ns/net` over the pin
/// file, then `setns` back through the saved fd.
pub fn pin_netns(target: &Path) -> Result<NetnsGuard> {
    debug!(netns = %target.display(), "pin new network namespace");
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(target)
        .map_err(|e| wiring("create netns pin file", e))?;

    let saved = File::open("/proc/self/ns/net").map_err(|e| wiring("open current netns", e))?;

    if let Err(e) = unshare(CloneFlags::CLONE_NEWNET) {
        let _ = std::fs::remove_file(target);
        return Err(wiring("unshare network namespace", e));
    }

    let mounted = mount(
        Some("/proc/self/ns/net"),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    );

    // Return to the original namespace before looking at the mount
    // result; failing to get back is unrecoverable for this process.
    setns(saved.as_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| wiring("restore original netns", e))?;

    if let Err(e) = mounted {
        let _ = std::fs::remove_file(target);
        return Err(wiring("bind-mount netns", e));
    }

    Ok(NetnsGuard {
        path: target.to_path_buf(),
    })
}

/// Re-enters the saved namespace when dropped.
pub struct NetnsRestore {
    saved: File,
}

impl Drop for NetnsRestore {
    fn drop(&mut self) {
        if let Err(e) = setns(self.saved.as_fd(), CloneFlags::CLONE_NEWNET) {
            warn!(error = %e, "failed to restore network namespace");
        }
    }
}

/// Enters the namespace pinned at `path`, returning a restore guard for
/// the namespace that was current.
pub fn enter_netns(path: &Path) -> Result<NetnsRestore> {
    let saved = File::open("/proc/self/ns/net").map_err(|e| wiring("open current netns", e))?;
    let target = File::open(path).map_err(|e| wiring("open netns file", e))?;
    setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| wiring("enter netns", e))?;
    Ok(NetnsRestore { saved })
}

/// Permanently joins the namespace pinned at `path`. Used by the child,
/// which never comes back.
pub fn join_netns(path: &Path) -> Result<()> {
    let target = File::open(path).map_err(|e| wiring("open netns file", e))?;
    setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| wiring("join netns", e))
}

// =============================================================================
// Per-Container Wiring
// =============================================================================

/// Wires networking for one container under the host namespace and
/// returns the namespace release handle.
pub fn setup(id: &str) -> Result<NetnsGuard> {
    let veth_host = host_veth_name(id);
    let veth_peer = peer_veth_name(id);
    info!(container = id, host = %veth_host, peer = %veth_peer, "set up container network");

    let mut nl = NetlinkSocket::open().map_err(|e| wiring("open netlink socket", e))?;
    nl.create_veth_pair(&veth_host, &veth_peer, random_mac())
        .map_err(|e| wiring("create veth pair", e))?;

    let wired = wire_container(&mut nl, id, &veth_host, &veth_peer);
    if wired.is_err() {
        // Deleting either end removes the whole pair.
        if let Err(e) = nl.delete_link(&veth_host) {
            warn!(veth = %veth_host, error = %e, "veth cleanup failed");
        }
    }
    wired
}

fn wire_container(
    nl: &mut NetlinkSocket,
    id: &str,
    veth_host: &str,
    veth_peer: &str,
) -> Result<NetnsGuard> {
    nl.set_link_master(veth_host, BRIDGE_NAME)
        .map_err(|e| wiring("enslave veth to bridge", e))?;
    nl.set_link_up(veth_host)
        .map_err(|e| wiring("bring host veth up", e))?;

    let ns_target = netns_path(id);
    let guard = pin_netns(&ns_target)?;

    let ns_file = File::open(guard.path()).map_err(|e| wiring("open pinned netns", e))?;
    nl.set_link_netns(veth_peer, ns_file.as_fd().as_raw_fd())
        .map_err(|e| wiring("move veth into netns", e))?;
    drop(ns_file);

    configure_inside(guard.path(), veth_peer)?;
    Ok(guard)
}

/// Configures the container end from inside the pinned namespace:
/// rename to `eth0`, address, loopback, default route.
fn configure_inside(ns: &Path, veth_peer: &str) -> Result<()> {
    let _restore = enter_netns(ns)?;

    // The socket must be opened after setns; netlink sockets bind to the
    // namespace current at creation time.
    let mut nl = NetlinkSocket::open().map_err(|e| wiring("open netlink socket in netns", e))?;

    nl.rename_link(veth_peer, CONTAINER_ETH)
        .map_err(|e| wiring("rename container veth", e))?;

    let ip = random_container_ip();
    let addr = Ipv4Network::new(ip, 16).map_err(|e| wiring("container address", e))?;
    debug!(addr = %addr, "assign container address");
    nl.add_address(CONTAINER_ETH, addr)
        .map_err(|e| wiring("assign container address", e))?;

    nl.set_link_up(CONTAINER_ETH)
        .map_err(|e| wiring("bring eth0 up", e))?;
    nl.set_link_up("lo").map_err(|e| wiring("bring lo up", e))?;

    let gateway = BRIDGE_GATEWAY
        .parse()
        .map_err(|e| wiring("parse gateway", e))?;
    nl.add_default_route(gateway)
        .map_err(|e| wiring("add default route", e))?;

    Ok(())
}
