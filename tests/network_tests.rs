//! Tests for network wiring.
//!
//! Pure naming logic runs everywhere; anything that talks to the kernel
//! is gated on root and cleans up after itself.

use koker::network::{self, netlink};
use nix::unistd::geteuid;
use tempfile::TempDir;

// =============================================================================
// Naming
// =============================================================================

#[test]
fn veth_pair_names_derive_from_the_id_prefix() {
    let id = "f00dfeed1234567890abcdef";
    assert_eq!(network::host_veth_name(id), "veth0_f00dfee");
    assert_eq!(network::peer_veth_name(id), "veth1_f00dfee");
}

#[test]
fn distinct_ids_give_distinct_interfaces() {
    let a = network::host_veth_name("aaaaaaa11111111111111111");
    let b = network::host_veth_name("bbbbbbb11111111111111111");
    assert_ne!(a, b);
}

// =============================================================================
// Netlink Basics (unprivileged)
// =============================================================================

#[test]
fn netlink_socket_opens_unprivileged() {
    assert!(netlink::NetlinkSocket::open().is_ok());
}

#[test]
fn loopback_resolves() {
    assert!(netlink::ifindex("lo").unwrap() > 0);
    assert!(!netlink::link_exists("koker-test-missing"));
}

// =============================================================================
// Kernel Operations (root only)
// =============================================================================

#[test]
fn netns_pin_and_release() {
    if !geteuid().is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("testns");

    let guard = network::pin_netns(&target).unwrap();
    assert!(target.exists(), "pin file must exist while guarded");

    // The pinned namespace is a different net namespace than ours.
    let entered = network::enter_netns(&target);
    assert!(entered.is_ok());
    drop(entered);

    drop(guard);
    assert!(!target.exists(), "pin file must be gone after release");
}

#[test]
fn pinning_over_an_existing_file_fails() {
    if !geteuid().is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }

    let dir = TempDir::new().unwrap();
    let target = dir.path().join("testns");
    std::fs::write(&target, b"").unwrap();

    assert!(network::pin_netns(&target).is_err());
}

#[test]
fn bridge_preflight_is_idempotent() {
    if !geteuid().is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }

    network::ensure_bridge().unwrap();
    network::ensure_bridge().unwrap();
    assert!(netlink::link_exists(koker::constants::BRIDGE_NAME));
}

#[test]
fn veth_pair_create_and_delete() {
    if !geteuid().is_root() {
        eprintln!("skipping: requires root privileges");
        return;
    }

    let mut nl = netlink::NetlinkSocket::open().unwrap();
    nl.create_veth_pair("koker-t0", "koker-t1", [0x02, 0, 0, 0, 0, 1])
        .unwrap();
    assert!(netlink::link_exists("koker-t0"));
    assert!(netlink::link_exists("koker-t1"));

    nl.delete_link("koker-t0").unwrap();
    assert!(!netlink::link_exists("koker-t0"));
    assert!(!netlink::link_exists("koker-t1"), "peer dies with the pair");
}
