//! Error types for the container runtime.

use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Pre-init Errors
    // =========================================================================
    /// Not running as the superuser.
    #[error("root privileges are required to run koker")]
    Privilege,

    /// Bridge or NAT setup failed before any container started.
    #[error("host network preflight failed: {reason}")]
    Preflight { reason: String },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Failed to parse or validate an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image pull failed (registry, manifest, or blob).
    #[error("unable to pull image '{reference}': {reason}")]
    ImagePull { reference: String, reason: String },

    /// Layer download or extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtraction { digest: String, reason: String },

    /// Path traversal attempt detected in a layer tarball.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Image index file could not be loaded or saved.
    #[error("image repository error: {reason}")]
    Repository { reason: String },

    // =========================================================================
    // Container Errors
    // =========================================================================
    /// Container id too short for hostname defaulting and veth naming.
    #[error("invalid container id '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// No container directory or no process found for the id.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Overlay assembly refused by the kernel.
    #[error("failed to mount filesystem at {target}: {reason}")]
    FsAssembly { target: PathBuf, reason: String },

    /// Any of veth add, bridge enslave, namespace pin, address assignment.
    #[error("network wiring failed: {reason}")]
    NetworkWiring { reason: String },

    /// Cgroup directory creation or limit write refused.
    #[error("cgroup error: {reason}")]
    Cgroup { reason: String },

    /// clone/execve/setns/chroot failure while launching the child.
    #[error("failed to launch container process: {reason}")]
    ChildLaunch { reason: String },

    // =========================================================================
    // Plumbing Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}
