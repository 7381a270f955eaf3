//! Persistent and intermittent key-value caches.
//!
//! Two tiers, same contract:
//! - persistent caches survive reboot (calibrations, throughput counters)
//! - intermittent caches live under a tmpfs and last until the next boot
//!   (running-job flags, transient coordination)
//!
//! Each cache is one JSON document on disk. Access is scoped: `open()` takes
//! the cache's process-wide lock and returns a guard; mutations are flushed
//! back when the guard drops. One writer at a time per cache.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::config::Config;
use crate::error::{Error, Result};

/// Well-known cache names.
pub mod names {
    pub const PUMP_CALIBRATIONS: &str = "pump_calibrations";
    pub const CURRENT_PUMP_CALIBRATION: &str = "current_pump_calibration";
    pub const CURRENT_OD_CALIBRATION: &str = "current_od_calibration";
    pub const MEDIA_THROUGHPUT: &str = "media_throughput";
    pub const ALT_MEDIA_THROUGHPUT: &str = "alt_media_throughput";
    pub const ALT_MEDIA_FRACTION: &str = "alt_media_fraction";
    pub const JOBS_RUNNING: &str = "jobs_running";
    pub const DATABASE_BACKUPS: &str = "database_backups";
    pub const STIRRING_CALIBRATION: &str = "stirring_calibration";
    pub const OD_NORMALIZATION: &str = "od_normalization";
}

/// Handle to both cache tiers. Cheap to clone; inject it rather than
/// reaching for a global.
#[derive(Debug, Clone)]
pub struct Stores {
    persistent_root: PathBuf,
    intermittent_root: PathBuf,
}

impl Stores {
    pub fn new(persistent_root: PathBuf, intermittent_root: PathBuf) -> Self {
        Self {
            persistent_root,
            intermittent_root,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.storage.persistent_dir.clone(),
            config.storage.intermittent_dir.clone(),
        )
    }

    /// A reboot-surviving cache.
    pub fn persistent(&self, name: &str) -> Cache {
        Cache::at(self.persistent_root.join(format!("{name}.json")))
    }

    /// A boot-lifetime cache.
    pub fn intermittent(&self, name: &str) -> Cache {
        Cache::at(self.intermittent_root.join(format!("{name}.json")))
    }
}

/// One named cache. `open()` yields exclusive, scoped access.
#[derive(Debug)]
pub struct Cache {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

fn lock_registry() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Cache {
    fn at(path: PathBuf) -> Self {
        let lock = {
            let mut registry = lock_registry().lock().unwrap();
            Arc::clone(registry.entry(path.clone()).or_default())
        };
        Self { path, lock }
    }

    /// Take the cache's lock, load the backing file, and return a guard.
    pub fn open(&self) -> Result<CacheGuard<'_>> {
        let guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let map = match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::Store(format!("{}: {e}", self.path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Store(format!("{}: {e}", self.path.display()))),
        };
        Ok(CacheGuard {
            _lock: guard,
            path: self.path.clone(),
            map,
            dirty: false,
        })
    }
}

/// Exclusive view of one cache. Flushes on drop if anything changed.
pub struct CacheGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    path: PathBuf,
    map: BTreeMap<String, String>,
    dirty: bool,
}

impl CacheGuard<'_> {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.map.insert(key.to_string(), value.into());
        self.dirty = true;
    }

    pub fn set_f64(&mut self, key: &str, value: f64) {
        self.set(key, value.to_string());
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.map.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_vec_pretty(&self.map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to flush cache {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_stores() -> (tempfile::TempDir, Stores) {
        let dir = tempfile::tempdir().unwrap();
        let stores = Stores::new(dir.path().join("persist"), dir.path().join("tmp"));
        (dir, stores)
    }

    // -----------------------------------------------------------------------
    // Round trips
    // -----------------------------------------------------------------------

    #[test]
    fn set_then_get_round_trips() {
        let (_dir, stores) = scratch_stores();
        let cache = stores.persistent("unit_test_rt");
        {
            let mut c = cache.open().unwrap();
            c.set("exp1", "1.25");
        }
        let c = cache.open().unwrap();
        assert_eq!(c.get("exp1"), Some("1.25"));
        assert_eq!(c.get_f64("exp1"), Some(1.25));
    }

    #[test]
    fn values_survive_new_handles() {
        let (_dir, stores) = scratch_stores();
        {
            let cache = stores.persistent("unit_test_handles");
            cache.open().unwrap().set("k", "v");
        }
        let cache = stores.persistent("unit_test_handles");
        assert_eq!(cache.open().unwrap().get("k"), Some("v"));
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, stores) = scratch_stores();
        let cache = stores.intermittent("unit_test_del");
        {
            let mut c = cache.open().unwrap();
            c.set("gone", "1");
            assert!(c.delete("gone"));
            assert!(!c.delete("gone"));
        }
        assert!(!cache.open().unwrap().contains("gone"));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let (_dir, stores) = scratch_stores();
        let cache = stores.persistent("never_written");
        let c = cache.open().unwrap();
        assert_eq!(c.keys().count(), 0);
    }

    #[test]
    fn tiers_are_disjoint() {
        let (_dir, stores) = scratch_stores();
        stores.persistent("same_name").open().unwrap().set("k", "p");
        stores
            .intermittent("same_name")
            .open()
            .unwrap()
            .set("k", "i");
        assert_eq!(
            stores.persistent("same_name").open().unwrap().get("k"),
            Some("p")
        );
        assert_eq!(
            stores.intermittent("same_name").open().unwrap().get("k"),
            Some("i")
        );
    }

    // -----------------------------------------------------------------------
    // Exclusivity
    // -----------------------------------------------------------------------

    #[test]
    fn open_is_exclusive_per_cache() {
        let (_dir, stores) = scratch_stores();
        let stores2 = stores.clone();
        static CONCURRENT: AtomicU32 = AtomicU32::new(0);

        let mut handles = Vec::new();
        for i in 0..8 {
            let stores = stores2.clone();
            handles.push(std::thread::spawn(move || {
                let cache = stores.persistent("contended");
                let mut c = cache.open().unwrap();
                let in_scope = CONCURRENT.fetch_add(1, Ordering::SeqCst);
                assert_eq!(in_scope, 0, "two guards held at once");
                c.set(&format!("writer{i}"), "1");
                std::thread::sleep(std::time::Duration::from_millis(2));
                CONCURRENT.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let cache = stores.persistent("contended");
        assert_eq!(cache.open().unwrap().keys().count(), 8);
    }
}
