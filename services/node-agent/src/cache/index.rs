//! On-disk layout and the persisted entry index.
//!
//! ```text
//! <root>/
//!   index.json            digest -> {size, state, last_access}
//!   blobs/sha256/<hex>    published blob bytes
//!   staging/<hex>.partial in-progress writes
//! ```
//!
//! `index.json` is replaced atomically (write to a temp file, fsync, rename)
//! so a crash leaves either the old or the new index, never a torn one.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, warn};

use super::entry::EntryState;
use super::CacheError;
use crate::image::Digest;

const INDEX_FILE: &str = "index.json";
const INDEX_TMP_FILE: &str = "index.json.tmp";
const INDEX_VERSION: u32 = 1;

/// Paths derived from the cache root.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn index_tmp_path(&self) -> PathBuf {
        self.root.join(INDEX_TMP_FILE)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    pub fn staging_path(&self, digest: &Digest) -> PathBuf {
        self.staging_dir().join(format!("{}.partial", digest.hex()))
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.blobs_dir())?;
        fs::create_dir_all(self.staging_dir())
    }
}

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub digest: Digest,
    pub size: u64,
    pub state: EntryState,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<IndexRecord>,
}

/// Writes the index atomically.
pub(crate) fn save(layout: &Layout, records: Vec<IndexRecord>) -> Result<(), CacheError> {
    let data = serde_json::to_vec_pretty(&IndexFile {
        version: INDEX_VERSION,
        entries: records,
    })?;

    let tmp = layout.index_tmp_path();
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, layout.index_path())?;
    Ok(())
}

/// Reads the index, returning `None` when there is no usable file.
fn load(layout: &Layout) -> Option<Vec<IndexRecord>> {
    let path = layout.index_path();
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cache index");
            return None;
        }
    };

    match serde_json::from_slice::<IndexFile>(&data) {
        Ok(file) if file.version == INDEX_VERSION => Some(file.entries),
        Ok(file) => {
            warn!(version = file.version, "Unsupported cache index version, rebuilding");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt cache index, rebuilding");
            None
        }
    }
}

/// Hashes a file without loading it into memory.
pub(crate) fn hash_file(path: &Path) -> io::Result<(Digest, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Digest::from_hasher(hasher), total))
}

/// Outcome of startup recovery.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    pub records: Vec<IndexRecord>,
    pub dropped: usize,
    pub adopted: usize,
    pub orphans_removed: usize,
    pub staging_removed: usize,
}

/// Rebuilds a consistent index from disk.
///
/// - staging files are partial writes from a previous run and are removed
/// - only Ready entries are restored; anything else in the index is dropped
/// - indexed Ready blobs must exist with the recorded size (and hash, when
///   `verify` is set) or they are dropped
/// - blob files missing from the index are adopted only if their content
///   hashes to their file name, otherwise removed
pub(crate) fn recover(layout: &Layout, verify: bool) -> Result<Recovered, CacheError> {
    layout.create_dirs()?;
    let mut out = Recovered::default();

    for entry in fs::read_dir(layout.staging_dir())? {
        let path = entry?.path();
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove staging file");
        } else {
            out.staging_removed += 1;
        }
    }
    let _ = fs::remove_file(layout.index_tmp_path());

    let indexed = load(layout).unwrap_or_default();
    let mut known = std::collections::HashSet::new();

    for record in indexed {
        if known.contains(&record.digest) {
            continue;
        }
        // Only Ready entries survive a restart; a blob left behind by any
        // other state is judged by the orphan scan below.
        if record.state != EntryState::Ready {
            out.dropped += 1;
            continue;
        }
        let path = layout.blob_path(&record.digest);
        if blob_matches(&path, &record.digest, record.size, verify) {
            known.insert(record.digest.clone());
            out.records.push(record);
        } else {
            warn!(digest = %record.digest, "Dropping cache entry that failed validation");
            let _ = fs::remove_file(&path);
            known.insert(record.digest);
            out.dropped += 1;
        }
    }

    for entry in fs::read_dir(layout.blobs_dir())? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(digest) = Digest::parse(&format!("sha256:{name}")) else {
            let _ = fs::remove_file(&path);
            out.orphans_removed += 1;
            continue;
        };
        if known.contains(&digest) {
            continue;
        }
        match hash_file(&path) {
            Ok((actual, size)) if actual == digest => {
                debug!(digest = %digest, size, "Adopted unindexed blob");
                out.records.push(IndexRecord {
                    digest,
                    size,
                    state: EntryState::Ready,
                    last_access: Utc::now(),
                });
                out.adopted += 1;
            }
            _ => {
                let _ = fs::remove_file(&path);
                out.orphans_removed += 1;
            }
        }
    }

    info!(
        entries = out.records.len(),
        dropped = out.dropped,
        adopted = out.adopted,
        orphans_removed = out.orphans_removed,
        staging_removed = out.staging_removed,
        "Recovered cache index"
    );
    Ok(out)
}

fn blob_matches(path: &Path, digest: &Digest, size: u64, verify: bool) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.len() == size => {}
        _ => return false,
    }
    if !verify {
        return true;
    }
    matches!(hash_file(path), Ok((actual, _)) if &actual == digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_blob(layout: &Layout, content: &[u8]) -> Digest {
        let digest = Digest::sha256_of(content);
        fs::write(layout.blob_path(&digest), content).unwrap();
        digest
    }

    #[test]
    fn test_save_then_recover_keeps_valid_entries() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.create_dirs().unwrap();

        let digest = write_blob(&layout, b"layer");
        let record = IndexRecord {
            digest: digest.clone(),
            size: 5,
            state: EntryState::Ready,
            last_access: Utc::now(),
        };
        save(&layout, vec![record.clone()]).unwrap();

        let recovered = recover(&layout, true).unwrap();
        assert_eq!(recovered.records, vec![record]);
        assert!(!layout.root().join(INDEX_TMP_FILE).exists());
    }

    #[test]
    fn test_recover_drops_truncated_blob() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.create_dirs().unwrap();

        let digest = write_blob(&layout, b"short");
        save(
            &layout,
            vec![IndexRecord {
                digest: digest.clone(),
                size: 500,
                state: EntryState::Ready,
                last_access: Utc::now(),
            }],
        )
        .unwrap();

        let recovered = recover(&layout, false).unwrap();
        assert!(recovered.records.is_empty());
        assert_eq!(recovered.dropped, 1);
        assert!(!layout.blob_path(&digest).exists());
    }

    #[test]
    fn test_recover_adopts_verified_orphans_and_cleans_staging() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.create_dirs().unwrap();

        let good = write_blob(&layout, b"orphan");
        let bogus = Digest::sha256_of(b"something else");
        fs::write(layout.blob_path(&bogus), b"not matching").unwrap();
        fs::write(layout.staging_path(&good), b"partial").unwrap();
        fs::write(layout.index_path(), b"{ not json").unwrap();

        let recovered = recover(&layout, false).unwrap();
        assert_eq!(recovered.adopted, 1);
        assert_eq!(recovered.orphans_removed, 1);
        assert_eq!(recovered.staging_removed, 1);
        assert_eq!(recovered.records[0].digest, good);
        assert!(!layout.blob_path(&bogus).exists());
    }

    #[test]
    fn test_recover_drops_failed_records() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());
        layout.create_dirs().unwrap();

        let ready = write_blob(&layout, b"ready");
        let records = (0..50u32)
            .map(|i| IndexRecord {
                digest: Digest::sha256_of(&i.to_be_bytes()),
                size: 4,
                state: EntryState::Failed,
                last_access: Utc::now(),
            })
            .chain(std::iter::once(IndexRecord {
                digest: ready.clone(),
                size: 5,
                state: EntryState::Ready,
                last_access: Utc::now(),
            }))
            .collect();
        save(&layout, records).unwrap();

        let recovered = recover(&layout, false).unwrap();
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.records[0].digest, ready);
        assert_eq!(recovered.dropped, 50);
    }
}
