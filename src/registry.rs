//! OCI registry client.
//!
//! Pulls manifests, image configs, and layer blobs from a container
//! registry. Multi-arch image indexes are resolved to the host platform
//! before layers are fetched. All network operations are bounded by
//! [`IMAGE_PULL_TIMEOUT`] and layers are validated against size and
//! count limits before anything touches the disk.
//!
//! Only anonymous registry access is supported.

use std::path::{Path, PathBuf};

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN, MAX_LAYERS, MAX_LAYER_SIZE};
use crate::error::{Error, Result};
use crate::image::Layer;

/// Everything fetched from the registry for one image reference.
///
/// Layer blobs are written to files under the caller-provided scratch
/// directory; [`PulledImage::layer_files`] holds one path per entry of
/// [`PulledImage::layers`], in manifest order.
#[derive(Debug)]
pub struct PulledImage {
    /// Resolved manifest digest.
    pub digest: String,
    /// Image config digest, the image's identity.
    pub config_digest: String,
    /// Raw image config JSON.
    pub config: Vec<u8>,
    /// Layer records in manifest order (base first).
    pub layers: Vec<Layer>,
    /// Downloaded layer tarballs, parallel to `layers`.
    pub layer_files: Vec<PathBuf>,
}

/// Validates reference length and character set before talking to the
/// network.
pub fn validate_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if !reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

/// Pulls the manifest, config, and every layer blob for `reference`,
/// writing layer tarballs into `scratch`.
pub async fn pull_image(reference: &Reference, scratch: &Path) -> Result<PulledImage> {
    let refstr = reference.whole();
    info!(reference = %refstr, "pull image from registry");

    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let (manifest, digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_manifest(reference, &auth).await
    })
    .await
    .map_err(|_| pull_timeout(&refstr, "pull manifest"))?
    .map_err(|e| Error::ImagePull {
        reference: refstr.clone(),
        reason: e.to_string(),
    })?;

    let (config_desc, layer_descs) = resolve_manifest(&client, reference, &auth, manifest).await?;

    if layer_descs.len() > MAX_LAYERS {
        return Err(Error::ImagePull {
            reference: refstr.clone(),
            reason: format!("too many layers: {} > {}", layer_descs.len(), MAX_LAYERS),
        });
    }

    let config = fetch_blob(&client, reference, &config_desc).await?;

    let mut layers = Vec::with_capacity(layer_descs.len());
    let mut layer_files = Vec::with_capacity(layer_descs.len());
    for desc in &layer_descs {
        if desc.size as u64 > MAX_LAYER_SIZE {
            return Err(Error::ImagePull {
                reference: refstr.clone(),
                reason: format!("layer {} exceeds {} bytes", desc.digest, MAX_LAYER_SIZE),
            });
        }

        debug!(digest = %desc.digest, size = desc.size, "pull layer");
        let data = fetch_blob(&client, reference, desc).await?;

        let file = scratch.join(format!("{}.tar.gz", digest_hex(&desc.digest)));
        std::fs::write(&file, &data).map_err(|e| Error::LayerExtraction {
            digest: desc.digest.clone(),
            reason: e.to_string(),
        })?;

        layers.push(Layer {
            digest: desc.digest.clone(),
            size: desc.size as u64,
            media_type: desc.media_type.clone(),
        });
        layer_files.push(file);
    }

    Ok(PulledImage {
        digest,
        config_digest: config_desc.digest.clone(),
        config,
        layers,
        layer_files,
    })
}

/// Downloads one blob into memory, with the shared timeout applied and
/// the content verified against the descriptor digest.
async fn fetch_blob(
    client: &Client,
    reference: &Reference,
    desc: &OciDescriptor,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_blob(reference, desc, &mut data).await
    })
    .await
    .map_err(|_| pull_timeout(&reference.whole(), "pull blob"))?
    .map_err(|e| Error::ImagePull {
        reference: reference.whole(),
        reason: format!("blob {}: {}", desc.digest, e),
    })?;

    verify_digest(&desc.digest, &data)?;
    Ok(data)
}

/// Checks blob content against its sha256 descriptor digest. Digests
/// with other algorithms are passed through unverified.
fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        debug!(digest, "unverifiable digest algorithm");
        return Ok(());
    };
    let computed = hex::encode(Sha256::digest(data));
    if computed != expected {
        return Err(Error::LayerExtraction {
            digest: digest.to_string(),
            reason: format!("digest mismatch, computed sha256:{}", computed),
        });
    }
    Ok(())
}

/// Resolves a manifest to its config and layer descriptors, following a
/// multi-arch index down to the host platform when necessary.
async fn resolve_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
) -> Result<(OciDescriptor, Vec<OciDescriptor>)> {
    match manifest {
        OciManifest::Image(img) => Ok((img.config, img.layers)),
        OciManifest::ImageIndex(index) => {
            let arch = host_arch();
            let matching = index.manifests.iter().find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == "linux" && p.architecture == arch)
            });

            let desc = matching.ok_or_else(|| {
                let available: Vec<String> = index
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                Error::ImagePull {
                    reference: reference.whole(),
                    reason: format!(
                        "no manifest for linux/{}, available: {}",
                        arch,
                        available.join(", ")
                    ),
                }
            })?;

            let digest_ref: Reference = format!(
                "{}/{}@{}",
                reference.registry(),
                reference.repository(),
                desc.digest
            )
            .parse()
            .map_err(|e| Error::ImagePull {
                reference: reference.whole(),
                reason: format!("failed to build digest reference: {}", e),
            })?;

            let (platform_manifest, _) =
                client
                    .pull_manifest(&digest_ref, auth)
                    .await
                    .map_err(|e| Error::ImagePull {
                        reference: reference.whole(),
                        reason: format!("failed to pull platform manifest: {}", e),
                    })?;

            match platform_manifest {
                OciManifest::Image(img) => Ok((img.config, img.layers)),
                OciManifest::ImageIndex(_) => Err(Error::ImagePull {
                    reference: reference.whole(),
                    reason: "nested image index not supported".to_string(),
                }),
            }
        }
    }
}

fn pull_timeout(reference: &str, operation: &str) -> Error {
    Error::ImagePull {
        reference: reference.to_string(),
        reason: format!(
            "{} timed out after {}s",
            operation,
            IMAGE_PULL_TIMEOUT.as_secs()
        ),
    }
}

/// Returns the OCI architecture string for the host.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

/// Strips the algorithm prefix from a digest, leaving the hex part.
pub fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

/// Whether a layer media type carries gzip compression.
pub fn is_gzipped(media_type: &str) -> bool {
    media_type.ends_with("gzip") || media_type.ends_with("tar+gzip")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_validation() {
        assert!(validate_reference("alpine:3").is_ok());
        assert!(validate_reference("ghcr.io/foo/bar:latest").is_ok());
        assert!(validate_reference("registry.example.com:5000/image@sha256:abc123").is_ok());

        assert!(validate_reference("").is_err());
        assert!(validate_reference("nginx :latest").is_err());
        assert!(validate_reference(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn digest_hex_strips_algorithm() {
        assert_eq!(digest_hex("sha256:abcd"), "abcd");
        assert_eq!(digest_hex("abcd"), "abcd");
    }

    #[test]
    fn digest_verification_catches_mismatches() {
        let data = b"layer bytes";
        let good = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        assert!(verify_digest(&good, data).is_ok());

        let bad = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        assert!(verify_digest(bad, data).is_err());

        // Unknown algorithms are not verified.
        assert!(verify_digest("sha512:whatever", data).is_ok());
    }

    #[test]
    fn gzip_media_type_detection() {
        assert!(is_gzipped("application/vnd.oci.image.layer.v1.tar+gzip"));
        assert!(is_gzipped(
            "application/vnd.docker.image.rootfs.diff.tar.gzip"
        ));
        assert!(!is_gzipped("application/vnd.oci.image.layer.v1.tar"));
    }
}
