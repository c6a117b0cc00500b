//! Image records and the image resolver.
//!
//! An [`Image`] is the persisted description of a pulled image: its
//! identity digests, the ordered layer manifest, and where it came from.
//! [`resolve`] turns a `name[:tag]` reference into such a record, either
//! from the local repository or by pulling from the registry and
//! extracting every layer under `/var/lib/koker/images/<id>/`.

use std::fs::File;
use std::path::PathBuf;

use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{IMAGES_PATH, TEMP_PATH};
use crate::error::{Error, Result};
use crate::registry::{self, digest_hex, is_gzipped};
use crate::repository::ImageRepository;
use crate::utils;

/// One entry of an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Content digest, `sha256:<hex>` form.
    pub digest: String,
    /// Compressed blob size in bytes.
    pub size: u64,
    /// Blob media type.
    #[serde(rename = "mediaType")]
    pub media_type: String,
}

impl Layer {
    /// Hex part of the layer digest; names the extraction directory.
    pub fn hex(&self) -> &str {
        digest_hex(&self.digest)
    }
}

/// A locally available image, as stored in `repositories.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image config digest hex; keys the on-disk image directory.
    pub id: String,
    /// Manifest digest as reported by the registry.
    pub digest: String,
    /// Ordered layer records, base layer first.
    pub manifest: Vec<Layer>,
    /// Registry host the image was pulled from.
    pub registry: String,
    /// Repository within the registry.
    pub repository: String,
    /// Tag the image was pulled as.
    pub tag: String,
    /// Normalized reference used as the repository key.
    pub name: String,
}

impl Image {
    /// Directory holding the image's config and extracted layers.
    pub fn dir(&self) -> PathBuf {
        PathBuf::from(IMAGES_PATH).join(&self.id)
    }

    /// Path of the persisted image config.
    pub fn config_path(&self) -> PathBuf {
        self.dir().join("config.json")
    }

    /// Extraction directory of one layer.
    pub fn layer_dir(&self, layer: &Layer) -> PathBuf {
        self.dir().join(layer.hex())
    }

    /// Layer directories in the top-down order overlayfs expects:
    /// latest layer first, base layer last.
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        self.manifest
            .iter()
            .rev()
            .map(|l| self.layer_dir(l))
            .collect()
    }
}

// =============================================================================
// OCI Image Config
// =============================================================================

/// Top-level image config JSON, as persisted per image and per container.
///
/// Fields this runtime does not interpret survive a load/store cycle
/// through the flattened `rest` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: ImageConfig,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// The `config` section of an OCI image config: everything the launcher
/// consults when building the container process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "User", default)]
    pub user: String,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl ImageConfigFile {
    /// Loads a config file from disk.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Persists the config file to disk.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let data =
            serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Appends `:latest` when the reference names no tag or digest.
pub fn normalize_reference(name: &str) -> String {
    // A colon may also separate a registry port; only treat the reference
    // as tagged when the colon appears after the last path separator.
    let tail = name.rsplit('/').next().unwrap_or(name);
    if tail.contains(':') || name.contains('@') {
        name.to_string()
    } else {
        format!("{}:latest", name)
    }
}

/// Returns the [`Image`] for `name`, pulling and extracting it when the
/// repository has no record yet.
pub fn resolve(repo: &mut ImageRepository, name: &str) -> Result<Image> {
    let reference = normalize_reference(name);
    registry::validate_reference(&reference)?;

    if let Some(image) = repo.get(&reference) {
        debug!(image = %reference, id = %image.id, "image already present, re-use");
        return Ok(image.clone());
    }

    let parsed: Reference = reference.parse().map_err(|e| Error::InvalidImageReference {
        reference: reference.clone(),
        reason: format!("{}", e),
    })?;

    // Scratch directory for layer tarballs; removed on every exit path.
    utils::create_dir(TEMP_PATH)?;
    let scratch = tempfile::Builder::new()
        .prefix("pull-")
        .tempdir_in(TEMP_PATH)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let pulled = rt.block_on(registry::pull_image(&parsed, scratch.path()))?;

    let id = digest_hex(&pulled.config_digest).to_string();
    let image = Image {
        id: id.clone(),
        digest: pulled.digest.clone(),
        manifest: pulled.layers.clone(),
        registry: parsed.registry().to_string(),
        repository: parsed.repository().to_string(),
        tag: parsed.tag().unwrap_or("latest").to_string(),
        name: reference.clone(),
    };

    utils::create_dir(image.dir())?;
    for (layer, file) in image.manifest.iter().zip(&pulled.layer_files) {
        let dir = image.layer_dir(layer);
        debug!(layer = %layer.digest, dir = %dir.display(), "extract layer");
        utils::create_dir(&dir)?;
        let reader = File::open(file)?;
        utils::extract_tarball(reader, &dir, is_gzipped(&layer.media_type)).map_err(|e| {
            match e {
                Error::PathTraversal { .. } => e,
                other => Error::LayerExtraction {
                    digest: layer.digest.clone(),
                    reason: other.to_string(),
                },
            }
        })?;
    }

    std::fs::write(image.config_path(), &pulled.config)?;

    repo.set(reference.clone(), image.clone());
    info!(image = %reference, id = %id, "image pulled");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_latest() {
        assert_eq!(normalize_reference("alpine"), "alpine:latest");
        assert_eq!(normalize_reference("alpine:3"), "alpine:3");
        assert_eq!(
            normalize_reference("ghcr.io/foo/bar"),
            "ghcr.io/foo/bar:latest"
        );
    }

    #[test]
    fn normalize_keeps_registry_ports_and_digests() {
        assert_eq!(
            normalize_reference("registry.example.com:5000/app"),
            "registry.example.com:5000/app:latest"
        );
        assert_eq!(
            normalize_reference("alpine@sha256:abc"),
            "alpine@sha256:abc"
        );
    }

    #[test]
    fn lower_dirs_are_top_down() {
        let image = Image {
            id: "cfg".into(),
            digest: "sha256:m".into(),
            manifest: vec![
                Layer {
                    digest: "sha256:base".into(),
                    size: 1,
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                },
                Layer {
                    digest: "sha256:top".into(),
                    size: 1,
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
                },
            ],
            registry: "docker.io".into(),
            repository: "library/alpine".into(),
            tag: "3".into(),
            name: "alpine:3".into(),
        };

        let dirs = image.lower_dirs();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("top"), "latest layer must come first");
        assert!(dirs[1].ends_with("base"));
    }

    #[test]
    fn config_round_trip_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["/bin/sh"],
                "WorkingDir": "/app",
                "Labels": {"maintainer": "someone"}
            },
            "rootfs": {"type": "layers", "diff_ids": ["sha256:x"]}
        });

        let parsed: ImageConfigFile = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(parsed.config.env, vec!["PATH=/usr/bin"]);
        assert_eq!(parsed.config.cmd, vec!["/bin/sh"]);
        assert_eq!(parsed.config.working_dir, "/app");

        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["rootfs"], raw["rootfs"]);
        assert_eq!(back["config"]["Labels"], raw["config"]["Labels"]);
    }
}
