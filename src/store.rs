use crate::models::{Listing, ListingKey};
use chrono::Local;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize listings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Another run holds the lock {0}")]
    Locked(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What `load` found on disk.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub listings: Vec<Listing>,
    /// Where an unreadable snapshot was moved, if the stored file was corrupt.
    pub quarantined: Option<PathBuf>,
}

impl Snapshot {
    pub fn is_degraded(&self) -> bool {
        self.quarantined.is_some()
    }
}

/// JSON snapshot of every listing, overwritten in full on each save.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Take the run lock. Held for the whole load → reconcile → save cycle.
    ///
    /// The lock is an OS advisory lock on `<file>.lock`, so it goes away with
    /// the process even if the run is killed. The file itself is left behind.
    pub fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.sibling(".lock");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(StoreError::Locked(path));
            }
            return Err(io_err(&path)(e));
        }

        // Only informational; the OS lock is what counts.
        let _ = file.set_len(0).and_then(|()| writeln!(file, "{}", std::process::id()));
        debug!(path = %path.display(), "acquired store lock");
        Ok(StoreLock { file, path })
    }

    /// Read the snapshot. Never fails: a missing file is an empty snapshot and
    /// an unreadable one is moved aside and reported as degraded.
    pub fn load(&self) -> Snapshot {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no snapshot yet, starting empty");
                return Snapshot::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot unreadable, starting empty");
                return Snapshot {
                    listings: Vec::new(),
                    quarantined: self.quarantine(),
                };
            }
        };

        match serde_json::from_str::<Vec<Listing>>(&content) {
            Ok(listings) => {
                let listings = dedupe_keys(listings);
                info!(count = listings.len(), path = %self.path.display(), "loaded snapshot");
                Snapshot {
                    listings,
                    quarantined: None,
                }
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "snapshot is corrupt, starting empty; every listing will look new this run"
                );
                Snapshot {
                    listings: Vec::new(),
                    quarantined: self.quarantine(),
                }
            }
        }
    }

    fn quarantine(&self) -> Option<PathBuf> {
        let target = self.sibling(&format!(".corrupt-{}", Local::now().format("%Y%m%d%H%M%S")));
        match fs::rename(&self.path, &target) {
            Ok(()) => {
                warn!(to = %target.display(), "moved corrupt snapshot aside");
                Some(target)
            }
            Err(e) => {
                warn!(error = %e, "could not move corrupt snapshot aside");
                Some(self.path.clone())
            }
        }
    }

    /// Replace the snapshot atomically: write a temp file next to it, sync,
    /// then rename over the old one.
    pub fn save(&self, listings: &[Listing]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(listings)?;
        let tmp = self.sibling(".tmp");

        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }

        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(json.as_bytes()).map_err(io_err(&tmp))?;
        file.write_all(b"\n").map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        info!(count = listings.len(), path = %self.path.display(), "saved snapshot");
        Ok(())
    }
}

/// Keep one listing per key; later entries win, at the position of the first.
fn dedupe_keys(listings: Vec<Listing>) -> Vec<Listing> {
    let mut positions: HashMap<ListingKey, usize> = HashMap::new();
    let mut unique: Vec<Listing> = Vec::with_capacity(listings.len());
    for listing in listings {
        let key = listing.key();
        match positions.get(&key) {
            Some(&position) => {
                warn!(key = %key, "duplicate listing in snapshot, keeping the later one");
                unique[position] = listing;
            }
            None => {
                positions.insert(key, unique.len());
                unique.push(listing);
            }
        }
    }
    unique
}

/// Releases the run lock when dropped.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageRef, Price};
    use chrono::NaiveDate;
    use serde_json::{Map, Value};

    fn listing(key: &str) -> Listing {
        Listing {
            source_id: "subo".to_string(),
            identity_key: key.to_string(),
            url: format!("https://www.subo.se/{key}"),
            address: key.to_string(),
            price: Price::Known("5 900:-/månad".to_string()),
            rooms: "1 rum".to_string(),
            size: "34 kvm".to_string(),
            available_text: "Ledigt nu".to_string(),
            image_url: None,
            active: true,
            removed_at: None,
            manual_override: false,
            message_ref: None,
            first_seen: None,
            last_seen: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Store::new(dir.path().join("listings.json")).load();
        assert!(snapshot.listings.is_empty());
        assert!(!snapshot.is_degraded());
    }

    #[test]
    fn save_then_load_keeps_refs_and_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("listings.json"));

        let mut a = listing("Åkervägen 3, Sundsvall");
        a.message_ref = Some(MessageRef {
            channel_id: "42".to_string(),
            message_id: "1001".to_string(),
        });
        a.extra.insert("channel_note".to_string(), Value::String("pinned".to_string()));
        let mut b = listing("Köpmangatan 9, Sundsvall");
        b.deactivate(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        b.price = Price::Unknown;

        store.save(&[a.clone(), b.clone()]).unwrap();
        let text = fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("Åkervägen"), "non-ASCII must be stored verbatim");
        assert!(!dir.path().join("listings.json.tmp").exists());

        let snapshot = store.load();
        assert_eq!(snapshot.listings, vec![a, b]);
    }

    #[test]
    fn corrupt_file_is_quarantined_and_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.json");
        fs::write(&path, "[{\"source_id\": \"subo\", \"identity_key\": ").unwrap();

        let snapshot = Store::new(&path).load();
        assert!(snapshot.listings.is_empty());
        let moved = snapshot.quarantined.expect("should be degraded");
        assert!(moved.exists());
        assert!(!path.exists());
    }

    #[test]
    fn duplicate_keys_in_snapshot_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("listings.json"));
        let mut later = listing("A");
        later.rooms = "4 rum".to_string();
        store.save(&[listing("A"), listing("B"), later]).unwrap();

        let listings = store.load().listings;
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].rooms, "4 rum");
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("listings.json"));

        let guard = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(StoreError::Locked(_))));
        drop(guard);
        assert!(store.lock().is_ok());
    }

    #[test]
    fn lock_left_behind_by_a_dead_run_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("listings.json"));
        let lock_path = dir.path().join("listings.json.lock");
        fs::write(&lock_path, "999999\n").unwrap();

        let guard = store.lock().unwrap();
        let pid = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
        drop(guard);

        // Dropping leaves the file; the next run still gets the lock.
        assert!(lock_path.exists());
        assert!(store.lock().is_ok());
    }
}
