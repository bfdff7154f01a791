//! Filesystem persistence for aggregated global models.
//!
//! One JSON file per version, named `model_v<N>.json`. Writes go to a
//! temp file in the same directory and are renamed into place, so a
//! crash can lose an artifact but never leave a corrupt one.

use fedflow_protocol::defaults::MODEL_FILE_PREFIX;
use fedflow_protocol::ModelVersion;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model version {0} not found")]
    NotFound(ModelVersion),
    #[error("model artifact for {version} is corrupt: {source}")]
    Corrupt {
        version: ModelVersion,
        source: serde_json::Error,
    },
    #[error("model store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model document could not be encoded: {0}")]
    Encode(serde_json::Error),
}

pub struct ModelStore {
    models_dir: PathBuf,
}

impl ModelStore {
    /// Open a store rooted at `models_dir`, creating the directory if
    /// needed.
    pub fn open(models_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let models_dir = models_dir.into();
        fs::create_dir_all(&models_dir)?;
        Ok(Self { models_dir })
    }

    fn model_path(&self, version: &ModelVersion) -> PathBuf {
        self.models_dir
            .join(format!("{MODEL_FILE_PREFIX}{version}.json"))
    }

    /// Persist a model document under `version`, replacing any previous
    /// artifact for that version.
    pub fn save(&self, version: &ModelVersion, document: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(document).map_err(StoreError::Encode)?;
        let final_path = self.model_path(version);
        let tmp_path = final_path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    pub fn load(&self, version: &ModelVersion) -> Result<Value, StoreError> {
        let path = self.model_path(version);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(version.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            version: version.clone(),
            source,
        })
    }

    pub fn exists(&self, version: &ModelVersion) -> bool {
        self.model_path(version).exists()
    }

    /// All persisted versions, ordered by version number.
    pub fn list(&self) -> Result<Vec<ModelVersion>, StoreError> {
        let entries = match fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(version) = version_from_file_name(&entry.path()) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// The persisted version with the largest number, if any.
    pub fn latest(&self) -> Result<Option<ModelVersion>, StoreError> {
        Ok(self.list()?.into_iter().last())
    }
}

fn version_from_file_name(path: &Path) -> Option<ModelVersion> {
    let stem = path.file_stem()?.to_str()?;
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    stem.strip_prefix(MODEL_FILE_PREFIX)?
        .parse::<ModelVersion>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn version(s: &str) -> ModelVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();

        let doc = json!({"version": "v2", "num_updates": 3});
        store.save(&version("v2"), &doc).unwrap();

        assert!(store.exists(&version("v2")));
        assert_eq!(store.load(&version("v2")).unwrap(), doc);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load(&version("v9")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_corrupt_artifact() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("model_v1.json"), b"{not json").unwrap();
        assert!(matches!(
            store.load(&version("v1")),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_latest_orders_numerically() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        for v in ["v1", "v2", "v10"] {
            store.save(&version(v), &json!({"version": v})).unwrap();
        }
        // v10 > v2 numerically even though "v2" > "v10" lexically
        assert_eq!(store.latest().unwrap(), Some(version("v10")));
        assert_eq!(
            store.list().unwrap(),
            vec![version("v1"), version("v2"), version("v10")]
        );
    }

    #[test]
    fn test_latest_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        assert_eq!(store.latest().unwrap(), None);
    }

    #[test]
    fn test_ignores_unrelated_files() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("README.txt"), b"notes").unwrap();
        std::fs::write(dir.path().join("model_v01.json"), b"{}").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        store.save(&version("v1"), &json!({})).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
