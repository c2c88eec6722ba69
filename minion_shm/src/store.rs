//! Minion state store.
//!
//! A key/value mapping layered on a [`SharedBuffer`] named
//! `<minion>_shared_dict`. Reads refresh the whole local snapshot from shared
//! memory; writes serialize the whole snapshot back. Two writers that each
//! refreshed before the other wrote will overwrite each other wholesale:
//! there is no per-key merge. The one exception is `status`, which writes of
//! other keys re-read and keep so that remote lifecycle requests survive.
//!
//! Every handle records the pid that opened it. Using a handle from any other
//! process (typically after a `fork`) fails with [`ShmError::AccessDenied`].

use crate::buffer::SharedBuffer;
use crate::error::{ShmError, ShmResult};
use crate::platform::get_current_pid;
use minion_common::config::LockSettings;
use minion_common::consts::{
    BUFFER_KEY_PREFIX, NAME_KEY, STATUS_KEY, buffer_key, buffer_name_from_key, state_store_name,
};
use minion_common::status::MinionStatus;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Snapshot-on-read mapping over a minion's shared state segment.
pub struct SharedStateStore {
    minion: String,
    buffer: SharedBuffer,
    snapshot: Map<String, Value>,
    owner_pid: u32,
    owner: bool,
}

impl SharedStateStore {
    /// Create the store of `minion`, declaring its name and a running status.
    pub fn create(minion: &str, size: usize, settings: LockSettings) -> ShmResult<Self> {
        let buffer = SharedBuffer::create(&state_store_name(minion), size, settings)?;
        let mut snapshot = Map::new();
        snapshot.insert(NAME_KEY.to_string(), Value::from(minion));
        snapshot.insert(STATUS_KEY.to_string(), Value::from(MinionStatus::Running.code()));

        let mut store = Self {
            minion: minion.to_string(),
            buffer,
            snapshot,
            owner_pid: get_current_pid(),
            owner: true,
        };
        store.flush()?;
        Ok(store)
    }

    /// Attach to the store of `minion` and check the name it declares.
    pub fn open(minion: &str, settings: LockSettings) -> ShmResult<Self> {
        let buffer = SharedBuffer::open(&state_store_name(minion), settings)?;
        let mut store = Self {
            minion: minion.to_string(),
            buffer,
            snapshot: Map::new(),
            owner_pid: get_current_pid(),
            owner: false,
        };
        store.refresh()?;

        match store.snapshot.get(NAME_KEY) {
            Some(Value::String(declared)) if declared == minion => Ok(store),
            other => Err(ShmError::NameMismatch {
                expected: minion.to_string(),
                found: other.map_or_else(|| "<none>".to_string(), Value::to_string),
            }),
        }
    }

    /// Name of the minion owning this store.
    pub fn minion(&self) -> &str {
        &self.minion
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.buffer.name()
    }

    /// Whether this handle created the store.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Local snapshot as of the last refresh or write.
    pub fn snapshot(&self) -> &Map<String, Value> {
        &self.snapshot
    }

    fn check_pid(&self) -> ShmResult<()> {
        let current_pid = get_current_pid();
        if current_pid != self.owner_pid {
            debug!(
                "State store {} opened by pid {} used from pid {}",
                self.name(),
                self.owner_pid,
                current_pid
            );
            return Err(ShmError::AccessDenied {
                name: self.name().to_string(),
                owner_pid: self.owner_pid,
                current_pid,
            });
        }
        Ok(())
    }

    fn check_key(key: &str) -> ShmResult<()> {
        if key.starts_with(BUFFER_KEY_PREFIX) {
            return Err(ShmError::ReservedKey {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Replace the local snapshot with the shared contents.
    ///
    /// An empty or undecodable payload yields an empty snapshot.
    pub fn refresh(&mut self) -> ShmResult<()> {
        self.check_pid()?;
        self.snapshot = match self.buffer.read()? {
            Some(Value::Object(map)) => map,
            Some(other) => {
                warn!("State store {} holds a non-object: {}", self.name(), other);
                Map::new()
            }
            None => Map::new(),
        };
        Ok(())
    }

    fn flush(&mut self) -> ShmResult<()> {
        self.buffer.write(&self.snapshot)
    }

    /// Write the snapshot back, adopting whatever status is currently
    /// published. A stale local status never overwrites a peer's request.
    fn flush_keeping_status(&mut self) -> ShmResult<()> {
        let snapshot = &mut self.snapshot;
        self.buffer.update(|shared| {
            if let Some(status) = shared.as_ref().and_then(|doc| doc.get(STATUS_KEY)) {
                snapshot.insert(STATUS_KEY.to_string(), status.clone());
            }
            Value::Object(snapshot.clone())
        })
    }

    /// Refresh, then look up `key`.
    pub fn get(&mut self, key: &str) -> ShmResult<Option<Value>> {
        self.refresh()?;
        Ok(self.snapshot.get(key).cloned())
    }

    /// Refresh, then decode `key` into `T`.
    pub fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> ShmResult<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Refresh, then check for `key`.
    pub fn contains(&mut self, key: &str) -> ShmResult<bool> {
        self.refresh()?;
        Ok(self.snapshot.contains_key(key))
    }

    /// Merge `key` into the local snapshot and write the whole snapshot back.
    ///
    /// The snapshot is not refreshed first.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> ShmResult<()> {
        self.check_pid()?;
        Self::check_key(key)?;
        self.snapshot
            .insert(key.to_string(), serde_json::to_value(value)?);
        if key == STATUS_KEY {
            self.flush()
        } else {
            self.flush_keeping_status()
        }
    }

    /// Remove `key` from the local snapshot and write the whole snapshot back.
    pub fn delete(&mut self, key: &str) -> ShmResult<Option<Value>> {
        self.check_pid()?;
        Self::check_key(key)?;
        let removed = self.snapshot.remove(key);
        if key == STATUS_KEY {
            self.flush()?;
        } else {
            self.flush_keeping_status()?;
        }
        Ok(removed)
    }

    /// Publish the `b*<buffer>` reference pointing at `segment`.
    pub fn register_buffer(&mut self, buffer: &str, segment: &str) -> ShmResult<()> {
        self.check_pid()?;
        self.refresh()?;
        self.snapshot
            .insert(buffer_key(buffer), Value::from(segment));
        self.flush()
    }

    /// Withdraw a buffer reference.
    pub fn unregister_buffer(&mut self, buffer: &str) -> ShmResult<()> {
        self.check_pid()?;
        self.refresh()?;
        if self.snapshot.remove(&buffer_key(buffer)).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Segment name registered for `buffer`, if any.
    pub fn buffer_segment(&mut self, buffer: &str) -> ShmResult<Option<String>> {
        Ok(self
            .get(&buffer_key(buffer))?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    /// Names of all registered buffers.
    pub fn buffers(&mut self) -> ShmResult<Vec<String>> {
        self.refresh()?;
        Ok(self
            .snapshot
            .keys()
            .filter_map(|key| buffer_name_from_key(key))
            .map(str::to_string)
            .collect())
    }

    /// Refresh, then decode the status key.
    pub fn status(&mut self) -> ShmResult<Option<MinionStatus>> {
        Ok(self
            .get(STATUS_KEY)?
            .and_then(|value| value.as_i64())
            .and_then(MinionStatus::from_code))
    }

    /// Write the status key.
    pub fn set_status(&mut self, status: MinionStatus) -> ShmResult<()> {
        self.set(STATUS_KEY, &status.code())
    }

    /// Detach without destroying the segment.
    pub fn close(&mut self) {
        self.buffer.close();
    }

    /// Clear and unlink the segment. Only the creating handle may do this.
    pub fn terminate(&mut self) -> ShmResult<()> {
        self.check_pid()?;
        if !self.owner {
            return Err(ShmError::AccessDenied {
                name: self.name().to_string(),
                owner_pid: self.owner_pid,
                current_pid: get_current_pid(),
            });
        }
        self.snapshot.clear();
        self.buffer.terminate()
    }

    /// Whether the backing segment can still be opened by name.
    pub fn is_alive(&self) -> bool {
        self.buffer.is_alive()
    }

    #[cfg(test)]
    pub(crate) fn set_owner_pid(&mut self, pid: u32) {
        self.owner_pid = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique(prefix: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let id = CTR.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{}_{id}", std::process::id())
    }

    #[test]
    fn test_create_declares_name_and_status() {
        let minion = unique("store_init");
        let mut store = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        assert!(store.is_owner());
        assert_eq!(store.get(NAME_KEY).unwrap(), Some(json!(minion)));
        assert_eq!(store.status().unwrap(), Some(MinionStatus::Running));
        store.terminate().unwrap();
    }

    #[test]
    fn test_peer_sees_owner_writes() {
        let minion = unique("store_peer");
        let mut owner = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        owner.set("count", &0).unwrap();

        let mut peer = SharedStateStore::open(&minion, LockSettings::default()).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.get_as::<i64>("count").unwrap(), Some(0));

        owner.set("count", &1).unwrap();
        assert_eq!(peer.get_as::<i64>("count").unwrap(), Some(1));
        assert_eq!(peer.get("missing").unwrap(), None);

        owner.terminate().unwrap();
    }

    #[test]
    fn test_stale_writer_keeps_peer_status() {
        let minion = unique("store_status");
        let mut owner = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        let mut peer = SharedStateStore::open(&minion, LockSettings::default()).unwrap();

        // Owner snapshot still says Running when the peer asks it to stop
        peer.set_status(MinionStatus::ShuttingDown).unwrap();
        owner.set("count", &1).unwrap();
        assert_eq!(owner.snapshot().get(STATUS_KEY), Some(&json!(-1)));
        assert_eq!(owner.status().unwrap(), Some(MinionStatus::ShuttingDown));

        peer.set_status(MinionStatus::Running).unwrap();
        owner.delete("count").unwrap();
        assert_eq!(peer.status().unwrap(), Some(MinionStatus::Running));
        assert_eq!(peer.get("count").unwrap(), None);

        owner.terminate().unwrap();
    }

    #[test]
    fn test_delete_rewrites_snapshot() {
        let minion = unique("store_delete");
        let mut store = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        store.set("a", &1).unwrap();
        assert_eq!(store.delete("a").unwrap(), Some(json!(1)));
        assert_eq!(store.delete("a").unwrap(), None);
        assert!(!store.contains("a").unwrap());
        store.terminate().unwrap();
    }

    #[test]
    fn test_buffer_keys_are_reserved() {
        let minion = unique("store_reserved");
        let mut store = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        store.register_buffer("frame", "cam_frame").unwrap();

        assert!(matches!(
            store.set("b*frame", &"elsewhere"),
            Err(ShmError::ReservedKey { .. })
        ));
        assert!(matches!(
            store.delete("b*frame"),
            Err(ShmError::ReservedKey { .. })
        ));
        assert_eq!(store.buffers().unwrap(), vec!["frame".to_string()]);
        assert_eq!(
            store.buffer_segment("frame").unwrap(),
            Some("cam_frame".to_string())
        );

        store.unregister_buffer("frame").unwrap();
        assert!(store.buffers().unwrap().is_empty());
        store.terminate().unwrap();
    }

    #[test]
    fn test_open_checks_declared_name() {
        let minion = unique("store_name");
        let mut owner = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        // Any writer may clobber the name key; openers must notice
        owner.set(NAME_KEY, &"impostor").unwrap();

        let result = SharedStateStore::open(&minion, LockSettings::default());
        assert!(matches!(result, Err(ShmError::NameMismatch { .. })));
        owner.terminate().unwrap();
    }

    #[test]
    fn test_open_missing_store() {
        let result = SharedStateStore::open(&unique("store_missing"), LockSettings::default());
        assert!(matches!(result, Err(ShmError::NotFound { .. })));
    }

    #[test]
    fn test_pid_guard_denies_foreign_process() {
        let minion = unique("store_pid");
        let mut store = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        store.set("kept", &true).unwrap();

        let real_pid = get_current_pid();
        store.set_owner_pid(real_pid.wrapping_add(1));
        assert!(matches!(store.get("kept"), Err(ShmError::AccessDenied { .. })));
        assert!(matches!(
            store.set("kept", &false),
            Err(ShmError::AccessDenied { .. })
        ));
        assert!(matches!(store.terminate(), Err(ShmError::AccessDenied { .. })));

        store.set_owner_pid(real_pid);
        assert_eq!(store.get("kept").unwrap(), Some(json!(true)));
        store.terminate().unwrap();
    }

    #[test]
    fn test_only_owner_terminates() {
        let minion = unique("store_owner");
        let mut owner = SharedStateStore::create(&minion, 1024, LockSettings::default()).unwrap();
        let mut peer = SharedStateStore::open(&minion, LockSettings::default()).unwrap();

        assert!(matches!(peer.terminate(), Err(ShmError::AccessDenied { .. })));
        assert!(peer.is_alive());

        owner.terminate().unwrap();
        assert!(!peer.is_alive());
    }

    #[test]
    fn test_oversized_snapshot_rejected() {
        let minion = unique("store_small");
        let mut store = SharedStateStore::create(&minion, 128, LockSettings::default()).unwrap();
        let result = store.set("blob", &"x".repeat(256));
        assert!(matches!(result, Err(ShmError::Allocation { .. })));
        store.terminate().unwrap();
    }
}
