use std::sync::Mutex;

use btb_core::ProjectMetadata;
use btb_error::{BtbError, Result};
use tracing::warn;

/// 项目设置快照的存储键
pub const STORAGE_KEY: &str = "bythebook_project_setup_v6";

/// 项目元数据持久化。只保存元数据，文档不落盘。
pub trait MetadataStore: Send + Sync {
    fn load(&self) -> Result<Option<ProjectMetadata>>;
    fn save(&self, metadata: &ProjectMetadata) -> Result<()>;
}

fn decode_snapshot(bytes: &[u8]) -> Result<ProjectMetadata> {
    serde_json::from_slice(bytes).map_err(|e| BtbError::Serialization {
        format: "json".to_string(),
        message: format!("corrupt project snapshot: {}", e),
    })
}

#[derive(Clone)]
pub struct SledMetadataStore {
    db: sled::Db,
}

impl SledMetadataStore {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }
}

impl MetadataStore for SledMetadataStore {
    fn load(&self) -> Result<Option<ProjectMetadata>> {
        match self.db.get(STORAGE_KEY)? {
            Some(v) => decode_snapshot(&v).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, metadata: &ProjectMetadata) -> Result<()> {
        let json = serde_json::to_vec(metadata)?;
        self.db.insert(STORAGE_KEY, json)?;
        self.db.flush()?;
        Ok(())
    }
}

/// 内存实现，`storage.path` 为空时使用
#[derive(Default)]
pub struct MemoryMetadataStore {
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl MetadataStore for MemoryMetadataStore {
    fn load(&self) -> Result<Option<ProjectMetadata>> {
        let guard = self.snapshot.lock().map_err(|e| BtbError::Internal {
            message: "metadata_store_lock".to_string(),
            details: Some(e.to_string()),
        })?;
        guard.as_deref().map(decode_snapshot).transpose()
    }

    fn save(&self, metadata: &ProjectMetadata) -> Result<()> {
        let json = serde_json::to_vec(metadata)?;
        let mut guard = self.snapshot.lock().map_err(|e| BtbError::Internal {
            message: "metadata_store_lock".to_string(),
            details: Some(e.to_string()),
        })?;
        *guard = Some(json);
        Ok(())
    }
}

/// 启动时读取快照；快照损坏时记录警告并使用默认值
pub fn load_or_default(store: &dyn MetadataStore) -> ProjectMetadata {
    match store.load() {
        Ok(Some(metadata)) => metadata,
        Ok(None) => ProjectMetadata::default(),
        Err(e) => {
            warn!(error = %e, key = STORAGE_KEY, "ignoring unreadable project snapshot");
            ProjectMetadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> SledMetadataStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledMetadataStore::from_db(db)
    }

    fn metadata() -> ProjectMetadata {
        ProjectMetadata {
            name: "Night Shift".into(),
            unions: vec!["SAG-AFTRA".into()],
            budget_amount: "1,500,000".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sled_store_persists_snapshot() {
        let store = temp_store();
        assert!(store.load().unwrap().is_none());
        store.save(&metadata()).unwrap();
        assert_eq!(store.load().unwrap(), Some(metadata()));

        let raw = store.db.get(STORAGE_KEY).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["budgetAmount"], "1,500,000");
        assert!(json.get("documents").is_none());
    }

    #[test]
    fn test_corrupt_snapshot_falls_back_to_defaults() {
        let store = temp_store();
        store.db.insert(STORAGE_KEY, &b"{not json"[..]).unwrap();
        assert!(store.load().is_err());
        assert_eq!(load_or_default(&store), ProjectMetadata::default());
    }

    #[test]
    fn test_partial_snapshot_fills_defaults() {
        let store = temp_store();
        store
            .db
            .insert(STORAGE_KEY, &br#"{"name":"Pilot","location":"Vancouver"}"#[..])
            .unwrap();
        let loaded = load_or_default(&store);
        assert_eq!(loaded.name, "Pilot");
        assert_eq!(loaded.status, "Development");
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryMetadataStore::default();
        assert_eq!(load_or_default(&store), ProjectMetadata::default());
        store.save(&metadata()).unwrap();
        assert_eq!(store.load().unwrap().unwrap().name, "Night Shift");
    }
}
