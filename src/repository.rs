//! The persisted image index.
//!
//! `repositories.json` maps normalized references (`registry/repo:tag`
//! or the short `name:tag` form) to [`Image`] records. The repository is
//! loaded once at process start and written back on clean exit.
//!
//! The file is not protected against concurrent writers; a single
//! invocation of the binary at a time is assumed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::constants::{IMAGES_PATH, REPOSITORIES_FILE};
use crate::error::{Error, Result};
use crate::image::Image;

/// In-memory view of `repositories.json`, owned by the CLI entry point.
#[derive(Debug)]
pub struct ImageRepository {
    path: PathBuf,
    images: HashMap<String, Image>,
}

impl ImageRepository {
    /// Loads the repository from the default location, creating an empty
    /// index file when none exists yet.
    pub fn load() -> Result<Self> {
        Self::with_path(Path::new(IMAGES_PATH).join(REPOSITORIES_FILE))
    }

    /// Loads (or initializes) a repository at an explicit path.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, b"{}")?;
            debug!(path = %path.display(), "initialized empty image repository");
            return Ok(Self {
                path,
                images: HashMap::new(),
            });
        }

        let data = fs::read(&path).map_err(|e| Error::Repository {
            reason: format!("unable to read {}: {}", path.display(), e),
        })?;
        let images = serde_json::from_slice(&data).map_err(|e| Error::Repository {
            reason: format!("unable to parse {}: {}", path.display(), e),
        })?;
        Ok(Self { path, images })
    }

    /// Writes the index back to disk.
    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.images).map_err(|e| Error::Repository {
            reason: format!("unable to serialize image repository: {}", e),
        })?;
        fs::write(&self.path, data).map_err(|e| Error::Repository {
            reason: format!("unable to write {}: {}", self.path.display(), e),
        })?;
        debug!(path = %self.path.display(), "image repository saved");
        Ok(())
    }

    /// Looks up an image by its normalized reference.
    pub fn get(&self, name: &str) -> Option<&Image> {
        self.images.get(name)
    }

    /// Registers (or replaces) an image record.
    pub fn set(&mut self, name: String, image: Image) {
        self.images.insert(name, image);
    }

    /// Unregisters a reference. Layer directories stay on disk.
    pub fn remove(&mut self, name: &str) -> Option<Image> {
        let removed = self.images.remove(name);
        if removed.is_some() {
            info!(image = %name, "image unregistered");
        }
        removed
    }

    /// All known images, unordered.
    pub fn list(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }
}
