//! Constants for the runtime.
//!
//! All paths, interface names, cgroup filenames, and limits are defined
//! here to ensure consistency and prevent magic numbers throughout the
//! codebase.

use std::time::Duration;

// =============================================================================
// Application Identity
// =============================================================================

/// Application name. Also names the per-app cgroup below the mountpoint.
pub const APP: &str = "koker";

// =============================================================================
// Filesystem Layout
// =============================================================================

/// Root of all persisted state.
pub const HOME_PATH: &str = "/var/lib/koker";

/// Extracted image layers and image configs, one directory per image id.
pub const IMAGES_PATH: &str = "/var/lib/koker/images";

/// Per-container directories (mnt, diff, work, config.json).
pub const CONTAINERS_PATH: &str = "/var/lib/koker/containers";

/// Bind-mount files pinning per-container network namespaces.
pub const NETNS_PATH: &str = "/var/lib/koker/netns";

/// Scratch space for image pulls. Always cleaned after a pull.
pub const TEMP_PATH: &str = "/var/lib/koker/tmp";

/// Name of the image index file under [`IMAGES_PATH`].
pub const REPOSITORIES_FILE: &str = "repositories.json";

// =============================================================================
// Network
// =============================================================================

/// Default bridge interface connecting host and containers.
pub const BRIDGE_NAME: &str = "koker0";

/// Address carried by the bridge, CIDR form.
pub const BRIDGE_ADDR: &str = "172.69.0.1/16";

/// Default gateway handed to containers (the bridge address).
pub const BRIDGE_GATEWAY: &str = "172.69.0.1";

/// Subnet containers are allocated from; also the NAT source match.
pub const CONTAINER_SUBNET: &str = "172.69.0.0/16";

/// Host-side veth name prefix; completed with the container id prefix.
pub const VETH_HOST_PREFIX: &str = "veth0_";

/// Container-side veth name prefix before the rename to [`CONTAINER_ETH`].
pub const VETH_PEER_PREFIX: &str = "veth1_";

/// Interface name visible inside the container.
pub const CONTAINER_ETH: &str = "eth0";

/// How many leading id characters go into an interface name.
pub const IFACE_ID_LEN: usize = 7;

// =============================================================================
// Cgroup
// =============================================================================

/// Cgroup filesystem mountpoint, v1 and v2 alike.
pub const CGROUP_MOUNTPOINT: &str = "/sys/fs/cgroup";

/// Enrollment file present in every cgroup directory.
pub const CGROUP_PROCS: &str = "cgroup.procs";

/// v2 controller delegation file.
pub const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// Controllers enabled for the app-level v2 group.
pub const SUBTREE_CONTROLLERS: &str = "+cpu +memory +pids";

/// CFS scheduling period in microseconds, shared by v1 and v2.
pub const DEFAULT_CFS_PERIOD: u64 = 100_000;

// =============================================================================
// Container Identity
// =============================================================================

/// Random bytes per container id (hex-encoded, so ids are twice this long).
pub const CONTAINER_ID_BYTES: usize = 12;

/// Ids shorter than this break hostname defaulting and veth naming.
pub const MIN_CONTAINER_ID_LEN: usize = 12;

/// Leading id characters reused as the default hostname.
pub const HOSTNAME_ID_LEN: usize = 12;

// =============================================================================
// Image Handling Limits
// =============================================================================

/// Maximum image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (512 MiB).
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of layers in an image manifest.
pub const MAX_LAYERS: usize = 128;

/// Timeout for registry operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Name Resolution
// =============================================================================

/// Resolver configs copied into the container, first existing wins.
pub const RESOLV_CONF_CANDIDATES: &[&str] = &[
    "/etc/kokerresolv.conf",
    "/etc/resolv.conf",
    "/var/run/systemd/resolve/resolv.conf",
];
