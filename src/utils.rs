//! Small shared helpers: ids, directories, file copies, tarball
//! extraction, and the random bits of container networking.

use std::fs;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::Path;

use flate2::read::GzDecoder;
use rand::Rng;
use tar::Archive;
use tracing::debug;

use crate::constants::{
    CONTAINERS_PATH, CONTAINER_ID_BYTES, HOME_PATH, IMAGES_PATH, NETNS_PATH, TEMP_PATH,
};
use crate::error::{Error, Result};

/// Creates a directory (and parents) if it does not exist yet.
pub fn create_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Creates the full `/var/lib/koker` tree used by every subcommand.
pub fn init_dirs() -> Result<()> {
    for dir in [
        HOME_PATH,
        IMAGES_PATH,
        CONTAINERS_PATH,
        NETNS_PATH,
        TEMP_PATH,
    ] {
        create_dir(dir)?;
    }
    Ok(())
}

/// Returns a fresh random container id, hex-encoded.
pub fn gen_container_id() -> String {
    let mut bytes = [0u8; CONTAINER_ID_BYTES];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Copies `src` to `dst`, creating the destination's parent directory
/// when missing.
pub fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        create_dir(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// Extracts a tar stream (optionally gzip-compressed) into `target`.
///
/// Directory, regular-file, hardlink and symlink entries are preserved
/// along with their modes. Entries that name `..` components or absolute
/// paths are rejected before anything is written.
pub fn extract_tarball(reader: impl Read, target: &Path, gzipped: bool) -> Result<()> {
    if gzipped {
        unpack_archive(Archive::new(GzDecoder::new(reader)), target)
    } else {
        unpack_archive(Archive::new(reader), target)
    }
}

fn unpack_archive<R: Read>(mut archive: Archive<R>, target: &Path) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let path_str = path.to_string_lossy();
        if path_str.starts_with('/') || path.components().any(|c| c.as_os_str() == "..") {
            return Err(Error::PathTraversal {
                path: path_str.into_owned(),
            });
        }

        // unpack_in re-validates that the entry stays below target, which
        // also covers writes through symlinked parents.
        if !entry.unpack_in(target)? {
            debug!(path = %path.display(), "skipped tar entry outside target");
        }
    }
    Ok(())
}

/// Picks a random address for a container inside `172.69.0.0/16`.
///
/// The address is not checked against other live containers; collisions
/// are accepted for the single-host, few-containers use case.
pub fn random_container_ip() -> Ipv4Addr {
    let mut rng = rand::thread_rng();
    Ipv4Addr::new(172, 69, rng.gen_range(1..254), rng.gen_range(1..254))
}

/// Generates a locally-administered unicast MAC address.
pub fn random_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill(&mut mac[..]);
    mac[0] = (mac[0] | 0x02) & 0xfe;
    mac
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn container_ids_are_hex_and_long_enough() {
        let id = gen_container_id();
        assert_eq!(id.len(), CONTAINER_ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn container_ids_are_distinct() {
        assert_ne!(gen_container_id(), gen_container_id());
    }

    #[test]
    fn random_ip_stays_in_subnet() {
        for _ in 0..64 {
            let ip = random_container_ip();
            assert_eq!(ip.octets()[0], 172);
            assert_eq!(ip.octets()[1], 69);
        }
    }

    #[test]
    fn random_mac_is_local_unicast() {
        for _ in 0..64 {
            let mac = random_mac();
            assert_eq!(mac[0] & 0x02, 0x02, "locally administered bit");
            assert_eq!(mac[0] & 0x01, 0x00, "unicast bit");
        }
    }

    #[test]
    fn extract_rejects_traversal() {
        let data = b"owned";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        // The builder refuses `..` components, so the raw name field is
        // written directly to model a hostile archive.
        header.as_gnu_mut().unwrap().name[..9].copy_from_slice(b"../escape");
        header.set_cksum();

        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, Cursor::new(&data[..])).unwrap();
        let bytes = builder.into_inner().unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let err = extract_tarball(Cursor::new(bytes), dir.path(), false).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
    }
}
