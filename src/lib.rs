//! # koker
//!
//! **Minimal Linux container runtime**
//!
//! Takes a registry image reference and launches an isolated process
//! under a layered root filesystem, namespace isolation, resource
//! limits, and a virtual-ethernet bridge network. Functionally a
//! stripped-down `docker run`.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ parent: koker container run IMAGE CMD…                         │
//! │   preflight ─ bridge koker0 + NAT                              │
//! │   resolve   ─ registry pull → /var/lib/koker/images/<id>/      │
//! │   overlay   ─ layers + diff + work → containers/<id>/mnt       │
//! │   wiring    ─ veth pair, pinned netns, address, route          │
//! │   re-exec   ─ /proc/self/exe container child (NEWNS|UTS|IPC|   │
//! │               PID; NET joined later by file)                   │
//! ├────────────────────────────────────────────────────────────────┤
//! │ child: koker container child ID CMD…                           │
//! │   cgroup enroll + limits → setns netns → resolv.conf →         │
//! │   chroot → mount /dev /proc /sys /tmp → run command            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every acquired resource (overlay mount, namespace pin, veth pair,
//! cgroup directory, scratch directory) sits behind a drop guard;
//! cleanup runs LIFO on all exit paths.
//!
//! Requires Linux ≥ 4.5 (overlayfs) and root privileges. Either cgroup
//! v1 or v2 must be mounted at `/sys/fs/cgroup`.

pub mod cgroups;
pub mod constants;
pub mod container;
pub mod error;
pub mod filesystem;
pub mod image;
pub mod network;
pub mod registry;
pub mod repository;
pub mod utils;

pub use container::{Container, ContainerSummary, RunOptions};
pub use error::{Error, Result};
pub use image::{Image, ImageConfig, ImageConfigFile, Layer};
pub use repository::ImageRepository;
