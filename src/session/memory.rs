//! In-memory session store.
//!
//! Keeps all sessions in memory with no persistence. Useful for tests
//! and single-process deployments. Uses `RwLock<HashMap>` for
//! thread-safe access.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use super::store::{PartRecord, SessionRecord, SessionStore};

#[derive(Debug)]
struct Entry {
    record: SessionRecord,
    parts: BTreeMap<u32, PartRecord>,
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().expect("rwlock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(
        &self,
        record: SessionRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            if sessions.contains_key(&record.upload_id) {
                return Err(anyhow::anyhow!(
                    "Session already exists: {}",
                    record.upload_id
                ));
            }
            sessions.insert(
                record.upload_id.clone(),
                Entry {
                    record,
                    parts: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    fn get_session(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<SessionRecord>>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            Ok(sessions.get(&upload_id).map(|e| e.record.clone()))
        })
    }

    fn put_part(
        &self,
        upload_id: &str,
        part: PartRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            let entry = sessions
                .get_mut(&upload_id)
                .ok_or_else(|| anyhow::anyhow!("Session not found: {upload_id}"))?;
            entry.parts.insert(part.part_number, part);
            Ok(())
        })
    }

    fn list_parts(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PartRecord>>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            Ok(sessions
                .get(&upload_id)
                .map(|e| e.parts.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn delete_session(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            Ok(sessions.remove(&upload_id).is_some())
        })
    }

    fn list_sessions(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<SessionRecord>>> + Send + '_>> {
        Box::pin(async move {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            let mut records: Vec<SessionRecord> =
                sessions.values().map(|e| e.record.clone()).collect();
            records.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
            Ok(records)
        })
    }
}
