//! Directory of uploaded source PDFs.
//!
//! Listings are served from an explicit time-to-live cache. Every mutating
//! operation invalidates it, so reads after an upload or delete always hit
//! the filesystem.

use crate::error::StoreError;
use crate::ingest::discover_pdf_files;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CachedListing {
    names: Vec<String>,
    fetched_at: Instant,
}

/// Value + timestamp + TTL with manual invalidation.
#[derive(Debug)]
pub struct ListingCache {
    ttl: Duration,
    entry: Mutex<Option<CachedListing>>,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<Vec<String>> {
        let entry = self.entry.lock().ok()?;
        entry
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.names.clone())
    }

    pub fn put(&self, names: Vec<String>) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = Some(CachedListing {
                names,
                fetched_at: Instant::now(),
            });
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut entry) = self.entry.lock() {
            *entry = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOutcome {
    /// A file with the same name existed and was overwritten.
    pub replaced: bool,
}

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    cache: ListingCache,
}

impl FileStore {
    /// Opens the store, creating the directory if it does not exist yet.
    pub fn open(root: impl Into<PathBuf>, listing_ttl: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| StoreError::io(&root, error))?;
        Ok(Self {
            root,
            cache: ListingCache::new(listing_ttl),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn upload(&self, name: &str, bytes: &[u8]) -> Result<UploadOutcome, StoreError> {
        let path = self.path_of(name)?;
        fs::create_dir_all(&self.root).map_err(|error| StoreError::io(&self.root, error))?;
        let replaced = path.exists();
        if replaced {
            warn!(file = %name, "replacing existing source file");
        }

        // The previous file is only replaced once the new bytes are on disk.
        let tmp = upload_temp_path(&self.root, name);
        let written = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        })();
        if let Err(error) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                debug!(path = %tmp.display(), %cleanup, "no partial upload to clean up");
            }
            self.cache.invalidate();
            return Err(StoreError::io(&tmp, error));
        }
        let renamed = fs::rename(&tmp, &path);
        self.cache.invalidate();
        if let Err(error) = renamed {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&path, error));
        }

        info!(file = %name, bytes = bytes.len(), replaced, "stored source file");
        Ok(UploadOutcome { replaced })
    }

    /// Names of the `.pdf` files in the store, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        if let Some(names) = self.cache.get() {
            debug!(count = names.len(), "file listing served from cache");
            return Ok(names);
        }

        if !self.root.exists() {
            fs::create_dir_all(&self.root).map_err(|error| StoreError::io(&self.root, error))?;
        }

        let names = discover_pdf_files(&self.root)
            .into_iter()
            .filter_map(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .collect::<Vec<_>>();
        self.cache.put(names.clone());
        Ok(names)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_of(name)?;
        let removed = fs::remove_file(&path);
        self.cache.invalidate();

        match removed {
            Ok(()) => {
                info!(file = %name, "deleted source file");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(error) => Err(StoreError::io(&path, error)),
        }
    }

    pub fn invalidate_listing(&self) {
        self.cache.invalidate();
    }
}

/// Hidden sibling without a `.pdf` extension, so it never shows up in listings.
fn upload_temp_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!(".{name}.upload"))
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(invalid("name must not contain path components"));
    }
    let is_pdf = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if !is_pdf {
        return Err(invalid("only .pdf files are accepted"));
    }
    Ok(())
}
