use crate::fingerprint::{fingerprint, fingerprint_file};
use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// Number of byte offsets sampled when verifying a fingerprint match.
pub const PROBE_COUNT: usize = 101;
/// Bytes compared at each sampled offset.
pub const PROBE_WINDOW: usize = 16;

/// Persistent key-value store backing the dedup index. Write forever, no
/// TTL. `set` need not be atomic with respect to a preceding `get`; the
/// index tolerates lost updates (entries are purely additive and a rebuild
/// reconciles them).
pub trait IndexStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// In-process store, used by tests and single-instance deployments.
#[derive(Default)]
pub struct MemoryIndexStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemoryIndexStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Single-file JSON store. The whole-map read-modify-write is not
/// synchronized across processes; concurrent writers can drop each other's
/// additions. Known race, reconciled by `rebuild`.
pub struct FileIndexStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileIndexStore {
    pub fn new(path: PathBuf) -> Self {
        FileIndexStore {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt index file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }
}

impl IndexStore for FileIndexStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec(&map)?)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

/// Outcome of an index rebuild.
#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildReport {
    pub indexed: u64,
    pub failed: u64,
}

/// Content-fingerprint index over the asset tree rooted at `root`.
/// Maps fingerprint -> JSON array of root-relative paths.
pub struct DedupIndex {
    store: Box<dyn IndexStore>,
    root: PathBuf,
}

impl DedupIndex {
    pub fn new(store: Box<dyn IndexStore>, root: PathBuf) -> Self {
        DedupIndex { store, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record `path` (anywhere under the root) under its content
    /// fingerprint. The read-modify-write here races with concurrent
    /// writers to the same key; additions may be lost and are recovered by
    /// the next rebuild.
    pub fn record_asset(&self, path: &Path) -> Result<()> {
        let fp = fingerprint_file(path)
            .with_context(|| format!("fingerprinting {}", path.display()))?;
        let rel = self.relative(path)?;
        let mut paths = self.known_paths(&fp)?;
        if !paths.contains(&rel) {
            paths.push(rel);
            self.store.set(&fp, &serde_json::to_string(&paths)?)?;
        }
        Ok(())
    }

    /// Probabilistic same-content lookup for an upload candidate.
    ///
    /// The fingerprint key already pins size and full-content SHA1; the
    /// probe pass re-reads PROBE_COUNT random 16-byte windows from each
    /// candidate as a cheap guard against hash collisions and index drift.
    /// Identical files always match; a false positive requires a SHA1
    /// collision plus identical bytes at every sampled window.
    pub fn find_equivalent<R: Rng>(&self, bytes: &[u8], rng: &mut R) -> Result<Option<String>> {
        let fp = fingerprint(bytes);
        let candidates = self.known_paths(&fp)?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let offsets = probe_offsets(bytes.len() as u64, rng);
        for candidate in candidates {
            let full = self.root.join(candidate.trim_start_matches('/'));
            match probe_matches(bytes, &full, &offsets) {
                Ok(true) => return Ok(Some(candidate)),
                Ok(false) => {}
                Err(e) => {
                    // Unreadable candidates (deleted, perms) are skipped.
                    tracing::debug!("skipping dedup candidate {}: {}", full.display(), e);
                }
            }
        }
        Ok(None)
    }

    /// Offline maintenance: walk the asset tree from `start` (a directory
    /// under the index root) and re-record every regular file, streaming
    /// per-directory counts to `progress`. Never run on the request path.
    pub fn rebuild(&self, start: &Path, progress: &mut dyn FnMut(&str)) -> RebuildReport {
        let mut report = RebuildReport::default();
        let mut current_dir: Option<PathBuf> = None;
        let mut dir_count: u64 = 0;

        for entry in WalkDir::new(start).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let parent = entry.path().parent().map(Path::to_path_buf);
            if parent != current_dir {
                if let Some(dir) = current_dir.take() {
                    progress(&format!("{}: {} files", dir.display(), dir_count));
                }
                current_dir = parent;
                dir_count = 0;
            }
            match self.record_asset(entry.path()) {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    tracing::warn!("could not index {}: {}", entry.path().display(), e);
                    report.failed += 1;
                }
            }
            dir_count += 1;
        }
        if let Some(dir) = current_dir {
            progress(&format!("{}: {} files", dir.display(), dir_count));
        }
        progress(&format!(
            "rebuild complete: {} indexed, {} failed",
            report.indexed, report.failed
        ));
        report
    }

    fn known_paths(&self, fp: &str) -> Result<Vec<String>> {
        match self.store.get(fp)? {
            Some(raw) => serde_json::from_str(&raw).context("corrupt index entry"),
            None => Ok(Vec::new()),
        }
    }

    /// Root-relative form with a leading `/`, the shape stored paths use.
    fn relative(&self, path: &Path) -> Result<String> {
        let rel = path
            .strip_prefix(&self.root)
            .with_context(|| format!("{} is outside the asset root", path.display()))?;
        Ok(format!("/{}", rel.to_string_lossy().replace('\\', "/")))
    }
}

fn probe_offsets<R: Rng>(len: u64, rng: &mut R) -> Vec<u64> {
    if len == 0 {
        return Vec::new();
    }
    let mut offsets: Vec<u64> = (0..PROBE_COUNT).map(|_| rng.gen_range(0..len)).collect();
    offsets.sort_unstable();
    offsets
}

fn probe_matches(uploaded: &[u8], candidate: &Path, offsets: &[u64]) -> std::io::Result<bool> {
    let mut file = File::open(candidate)?;
    if file.metadata()?.len() != uploaded.len() as u64 {
        return Ok(false);
    }
    let mut window = [0u8; PROBE_WINDOW];
    for &offset in offsets {
        let start = offset as usize;
        let end = (start + PROBE_WINDOW).min(uploaded.len());
        let expected = &uploaded[start..end];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut window[..expected.len()])?;
        if &window[..expected.len()] != expected {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn index_over(dir: &Path) -> DedupIndex {
        DedupIndex::new(Box::new(MemoryIndexStore::new()), dir.to_path_buf())
    }

    #[test]
    fn identical_content_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
        let stored = dir.path().join("a.jpg");
        std::fs::write(&stored, &data).unwrap();

        let index = index_over(dir.path());
        index.record_asset(&stored).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let hit = index.find_equivalent(&data, &mut rng).unwrap();
        assert_eq!(hit.as_deref(), Some("/a.jpg"));
    }

    #[test]
    fn different_content_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; 4096];
        let stored = dir.path().join("a.jpg");
        std::fs::write(&stored, &data).unwrap();

        let index = index_over(dir.path());
        index.record_asset(&stored).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let other = vec![2u8; 4096];
        assert!(index.find_equivalent(&other, &mut rng).unwrap().is_none());
    }

    #[test]
    fn deleted_candidates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 2048];
        let gone = dir.path().join("gone.jpg");
        let kept = dir.path().join("kept.jpg");
        std::fs::write(&gone, &data).unwrap();
        std::fs::write(&kept, &data).unwrap();

        let index = index_over(dir.path());
        index.record_asset(&gone).unwrap();
        index.record_asset(&kept).unwrap();
        std::fs::remove_file(&gone).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let hit = index.find_equivalent(&data, &mut rng).unwrap();
        assert_eq!(hit.as_deref(), Some("/kept.jpg"));
    }

    #[test]
    fn record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let stored = dir.path().join("a.png");
        std::fs::write(&stored, [3u8; 100]).unwrap();

        let index = index_over(dir.path());
        index.record_asset(&stored).unwrap();
        index.record_asset(&stored).unwrap();

        let fp = fingerprint(&[3u8; 100]);
        let raw = index.store.get(&fp).unwrap().unwrap();
        let paths: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(paths, vec!["/a.png".to_string()]);
    }

    #[test]
    fn rebuild_walks_subdirectories_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("one.jpg"), [1u8; 64]).unwrap();
        std::fs::write(dir.path().join("sub/two.jpg"), [2u8; 64]).unwrap();
        std::fs::write(dir.path().join("sub/deeper/three.jpg"), [3u8; 64]).unwrap();

        let index = index_over(dir.path());
        let mut lines = Vec::new();
        let report = index.rebuild(dir.path(), &mut |msg| lines.push(msg.to_string()));

        assert_eq!(report.indexed, 3);
        assert_eq!(report.failed, 0);
        assert!(lines.iter().any(|l| l.contains("rebuild complete")));

        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            index.find_equivalent(&[2u8; 64], &mut rng).unwrap().as_deref(),
            Some("/sub/two.jpg")
        );
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIndexStore::new(dir.path().join("index.json"));
        assert!(store.get("k").unwrap().is_none());
        store.set("k", "[\"/a.jpg\"]").unwrap();
        store.set("j", "[\"/b.jpg\"]").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("[\"/a.jpg\"]"));
        assert_eq!(store.get("j").unwrap().as_deref(), Some("[\"/b.jpg\"]"));
    }

    #[test]
    fn probe_offsets_are_reproducible_under_a_seed() {
        let a = probe_offsets(10_000, &mut StdRng::seed_from_u64(5));
        let b = probe_offsets(10_000, &mut StdRng::seed_from_u64(5));
        assert_eq!(a, b);
        assert_eq!(a.len(), PROBE_COUNT);
        assert!(a.windows(2).all(|w| w[0] <= w[1]));
    }
}
