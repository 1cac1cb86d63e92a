//! Two-tier step cache.
//!
//! Generated code is cached under a key made of the intent text and the full
//! previous-step history. New entries are staged for the duration of a flow
//! and only become durable (and persisted) on [`StepCache::commit`].
//!
//! In full mode a key can hold several entries, one per screen the step was
//! generated on. Lookups pick among them by image fingerprint first, then by
//! exact hierarchy fingerprint.
//!
//! A cached snippet that fails and is then regenerated successfully is evicted:
//! it stops matching for the rest of the flow and leaves the durable store on
//! commit.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uipilot_config::CacheMode;

use crate::capture::ScreenCapture;
use crate::fingerprint::{ImageFingerprint, SnapshotComparator};
use crate::step::PreviousStep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_fingerprint: Option<ImageFingerprint>,
}

impl CacheEntry {
    pub fn lightweight(code: &str) -> Self {
        Self {
            code: code.to_string(),
            hierarchy_fingerprint: None,
            image_fingerprint: None,
        }
    }

    pub fn full(code: &str, screen: &ScreenFingerprint) -> Self {
        Self {
            code: code.to_string(),
            hierarchy_fingerprint: Some(screen.hierarchy.clone()),
            image_fingerprint: screen.image,
        }
    }
}

/// Fingerprints of the screen a step runs on
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenFingerprint {
    pub hierarchy: String,
    pub image: Option<ImageFingerprint>,
}

impl ScreenFingerprint {
    pub fn of(screen: &ScreenCapture, comparator: &SnapshotComparator) -> Self {
        Self {
            hierarchy: screen.hierarchy_fingerprint(),
            image: screen.image_fingerprint(comparator),
        }
    }
}

/// Cache key for an intent in the context of the steps before it
pub fn cache_key(intent: &str, previous: &[PreviousStep]) -> String {
    let history: Vec<_> = previous
        .iter()
        .map(|step| json!({ "intent": step.intent, "code": step.code, "result": step.result }))
        .collect();
    json!({ "intent": intent, "previous": history }).to_string()
}

type Entries = HashMap<String, Vec<CacheEntry>>;

pub struct StepCache {
    path: PathBuf,
    mode: CacheMode,
    bypass: bool,
    comparator: SnapshotComparator,
    durable: Entries,
    staged: Entries,
    evicted: Vec<(String, CacheEntry)>,
    loaded: bool,
}

impl StepCache {
    pub fn new(path: impl Into<PathBuf>, mode: CacheMode, comparator: SnapshotComparator) -> Self {
        Self {
            path: path.into(),
            mode,
            bypass: false,
            comparator,
            durable: HashMap::new(),
            staged: HashMap::new(),
            evicted: Vec::new(),
            loaded: false,
        }
    }

    /// Force every lookup to miss; staging and commits still happen
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of staged entries across all keys
    pub fn staged_len(&self) -> usize {
        self.staged.values().map(Vec::len).sum()
    }

    /// Number of durable entries across all keys
    pub fn durable_len(&self) -> usize {
        self.durable.values().map(Vec::len).sum()
    }

    /// Hydrate the durable store from disk. Only the first call reads.
    ///
    /// A missing or unreadable file leaves the store empty.
    pub fn load(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        if self.mode == CacheMode::Disabled {
            return;
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No step cache at {}, starting empty", self.path.display());
                return;
            }
            Err(e) => {
                warn!("Failed to read step cache {}: {}", self.path.display(), e);
                return;
            }
        };

        match serde_json::from_str::<Entries>(&content) {
            Ok(entries) => {
                debug!("Loaded {} cached keys from {}", entries.len(), self.path.display());
                self.durable = entries;
            }
            Err(e) => warn!(
                "Ignoring corrupt step cache {}: {}",
                self.path.display(),
                e
            ),
        }
    }

    /// Look up cached code, staged entries first.
    ///
    /// Full mode requires the current screen's fingerprint: the image pass
    /// runs first, the hierarchy pass only when no image matched.
    pub fn get(&self, key: &str, screen: Option<&ScreenFingerprint>) -> Option<CacheEntry> {
        if self.mode == CacheMode::Disabled {
            return None;
        }
        if self.bypass {
            debug!("Cache bypassed");
            return None;
        }

        let candidates: Vec<&CacheEntry> = self
            .staged
            .get(key)
            .into_iter()
            .chain(self.durable.get(key))
            .flatten()
            .filter(|entry| !self.is_evicted(key, entry))
            .collect();

        match self.mode {
            CacheMode::Lightweight => candidates.first().map(|entry| (*entry).clone()),
            CacheMode::Full => {
                let screen = screen?;
                self.match_image(&candidates, screen)
                    .or_else(|| {
                        candidates
                            .iter()
                            .find(|entry| {
                                entry.hierarchy_fingerprint.as_deref()
                                    == Some(screen.hierarchy.as_str())
                            })
                            .copied()
                    })
                    .cloned()
            }
            CacheMode::Disabled => None,
        }
    }

    fn match_image<'a>(
        &self,
        candidates: &[&'a CacheEntry],
        screen: &ScreenFingerprint,
    ) -> Option<&'a CacheEntry> {
        let current = screen.image.as_ref()?;
        candidates.iter().copied().find(|entry| {
            entry
                .image_fingerprint
                .as_ref()
                .is_some_and(|stored| self.comparator.are_equal(stored, current))
        })
    }

    fn is_evicted(&self, key: &str, entry: &CacheEntry) -> bool {
        self.evicted.iter().any(|(k, e)| k == key && e == entry)
    }

    /// Number of entries pending eviction
    pub fn evicted_len(&self) -> usize {
        self.evicted.len()
    }

    /// Mark a cached entry as superseded.
    ///
    /// It stops matching at once and is dropped from the durable store on
    /// [`StepCache::commit`]. [`StepCache::discard`] forgets the eviction.
    pub fn evict(&mut self, key: &str, entry: &CacheEntry) {
        if self.mode == CacheMode::Disabled {
            return;
        }
        if let Some(slot) = self.staged.get_mut(key) {
            slot.retain(|staged| staged != entry);
            if slot.is_empty() {
                self.staged.remove(key);
            }
        }
        if !self.is_evicted(key, entry) {
            debug!("Evicting stale cache entry");
            self.evicted.push((key.to_string(), entry.clone()));
        }
    }

    /// Stage an entry for the current flow
    pub fn stage(&mut self, key: &str, entry: CacheEntry) {
        self.evicted.retain(|(k, e)| !(k == key && *e == entry));
        match self.mode {
            CacheMode::Disabled => {}
            CacheMode::Lightweight => {
                self.staged.insert(key.to_string(), vec![entry]);
            }
            CacheMode::Full => {
                let slot = self.staged.entry(key.to_string()).or_default();
                if !slot.contains(&entry) {
                    slot.push(entry);
                }
            }
        }
    }

    /// Move staged entries into the durable store and persist it.
    ///
    /// Returns the number of entries moved. Write failures are logged only.
    pub fn commit(&mut self) -> usize {
        if self.mode == CacheMode::Disabled {
            return 0;
        }
        let mut removed = 0;
        for (key, entry) in std::mem::take(&mut self.evicted) {
            if let Some(slot) = self.durable.get_mut(&key) {
                let before = slot.len();
                slot.retain(|durable| *durable != entry);
                removed += before - slot.len();
                if slot.is_empty() {
                    self.durable.remove(&key);
                }
            }
        }

        let staged = std::mem::take(&mut self.staged);
        let mut moved = 0;
        for (key, entries) in staged {
            moved += entries.len();
            match self.mode {
                CacheMode::Lightweight => {
                    self.durable.insert(key, entries);
                }
                _ => {
                    let slot = self.durable.entry(key).or_default();
                    for entry in entries {
                        if !slot.contains(&entry) {
                            slot.push(entry);
                        }
                    }
                }
            }
        }

        if moved > 0 || removed > 0 {
            self.persist();
        }
        info!("Committed {} cache entries, evicted {}", moved, removed);
        moved
    }

    /// Drop staged entries without persisting
    pub fn discard(&mut self) {
        let dropped = self.staged_len();
        self.staged.clear();
        self.evicted.clear();
        debug!("Discarded {} staged cache entries", dropped);
    }

    /// Remove every entry, staged and durable, and delete the persisted file
    pub fn clear(&mut self) {
        self.staged.clear();
        self.evicted.clear();
        self.durable.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("Removed step cache {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove step cache {}: {}", self.path.display(), e),
        }
    }

    fn persist(&self) {
        let json = match serde_json::to_string_pretty(&self.durable) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize step cache: {}", e);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Failed to create {}: {}", parent.display(), e);
                    return;
                }
            }
        }
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!("Failed to write step cache {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{patterned_png, Pattern};
    use serde_json::Value;
    use tempfile::TempDir;

    fn screen(hierarchy: &str, pattern: Option<Pattern>) -> ScreenFingerprint {
        let capture = ScreenCapture {
            image: pattern.map(patterned_png),
            hierarchy_text: hierarchy.to_string(),
            image_attached: pattern.is_some(),
        };
        ScreenFingerprint::of(&capture, &SnapshotComparator::default())
    }

    fn cache(dir: &TempDir, mode: CacheMode) -> StepCache {
        StepCache::new(dir.path().join("cache.json"), mode, SnapshotComparator::default())
    }

    #[test]
    fn test_key_is_order_sensitive() {
        let a = PreviousStep::new("open menu", "tap(\"#menu\")", Value::Null);
        let b = PreviousStep::new("open settings", "tap(\"#settings\")", Value::Null);
        assert_eq!(cache_key("go", &[a.clone(), b.clone()]), cache_key("go", &[a.clone(), b.clone()]));
        assert_ne!(cache_key("go", &[a.clone(), b.clone()]), cache_key("go", &[b, a]));
        assert_ne!(cache_key("go", &[]), cache_key("stop", &[]));
    }

    #[test]
    fn test_staged_entries_visible_before_commit() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Lightweight);
        cache.stage("k", CacheEntry::lightweight("tap()"));

        assert_eq!(cache.get("k", None).unwrap().code, "tap()");
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_commit_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let mut first = cache(&dir, CacheMode::Lightweight);
        first.load();
        first.stage("k", CacheEntry::lightweight("tap()"));
        assert_eq!(first.commit(), 1);
        assert_eq!(first.staged_len(), 0);

        let mut second = cache(&dir, CacheMode::Lightweight);
        second.load();
        assert_eq!(second.get("k", None).unwrap().code, "tap()");
    }

    #[test]
    fn test_discard_drops_staged_entries() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Lightweight);
        cache.stage("k", CacheEntry::lightweight("tap()"));
        cache.discard();

        assert!(cache.get("k", None).is_none());
        assert_eq!(cache.commit(), 0);
        assert!(!cache.path().exists());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cache.json"), "{ not json").unwrap();
        let mut cache = cache(&dir, CacheMode::Full);
        cache.load();
        assert_eq!(cache.durable_len(), 0);
    }

    #[test]
    fn test_full_mode_prefers_image_match() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Full);
        let login = screen("<login/>", Some(Pattern::LeftDark));
        let other = screen("<other/>", Some(Pattern::TopDark));
        cache.stage("k", CacheEntry::full("on_login()", &login));
        cache.stage("k", CacheEntry::full("on_other()", &other));

        // hierarchy points at "other" but the screenshot matches login
        let probe = screen("<other/>", Some(Pattern::LeftDark));
        assert_eq!(cache.get("k", Some(&probe)).unwrap().code, "on_login()");
    }

    #[test]
    fn test_full_mode_falls_back_to_hierarchy() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Full);
        cache.stage("k", CacheEntry::full("on_login()", &screen("<login/>", None)));

        let probe = screen("<login/>", Some(Pattern::TopDark));
        assert_eq!(cache.get("k", Some(&probe)).unwrap().code, "on_login()");
        assert!(cache.get("k", Some(&screen("<other/>", None))).is_none());
        assert!(cache.get("k", None).is_none());
    }

    #[test]
    fn test_bypass_misses_but_still_writes() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Lightweight).with_bypass(true);
        cache.stage("k", CacheEntry::lightweight("tap()"));

        assert!(cache.get("k", None).is_none());
        assert_eq!(cache.commit(), 1);
        assert!(cache.path().exists());
    }

    #[test]
    fn test_disabled_never_stores() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Disabled);
        cache.stage("k", CacheEntry::lightweight("tap()"));
        assert_eq!(cache.staged_len(), 0);
        assert!(cache.get("k", None).is_none());
    }

    #[test]
    fn test_evicted_entry_is_replaced_on_commit() {
        let dir = TempDir::new().unwrap();
        let login = screen("<login/>", None);
        let stale = CacheEntry::full("fail()", &login);
        let mut first = cache(&dir, CacheMode::Full);
        first.stage("k", stale.clone());
        first.commit();

        let mut second = cache(&dir, CacheMode::Full);
        second.load();
        second.evict("k", &stale);
        assert!(second.get("k", Some(&login)).is_none());
        second.stage("k", CacheEntry::full("tap()", &login));
        assert_eq!(second.commit(), 1);
        assert_eq!(second.evicted_len(), 0);

        let mut third = cache(&dir, CacheMode::Full);
        third.load();
        assert_eq!(third.durable_len(), 1);
        assert_eq!(third.get("k", Some(&login)).unwrap().code, "tap()");
    }

    #[test]
    fn test_discard_forgets_evictions() {
        let dir = TempDir::new().unwrap();
        let login = screen("<login/>", None);
        let entry = CacheEntry::full("tap()", &login);
        let mut cache = cache(&dir, CacheMode::Full);
        cache.stage("k", entry.clone());
        cache.commit();

        cache.evict("k", &entry);
        cache.discard();
        assert_eq!(cache.get("k", Some(&login)).unwrap().code, "tap()");
        assert_eq!(cache.durable_len(), 1);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, CacheMode::Lightweight);
        cache.stage("k", CacheEntry::lightweight("tap()"));
        cache.commit();

        cache.clear();
        assert_eq!(cache.durable_len(), 0);
        assert!(!cache.path().exists());
    }
}
