//! Model Registry - versions, persists and promotes mood models
//!
//! The registry owns the in-memory active model used by predictions. A
//! promotion writes the artifact, flips the active row in one transaction,
//! and only then swaps the in-memory reference, so a failure at any step
//! leaves the previous model serving.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::features::FeatureMap;
use super::model::MoodModel;
use super::{ModelVersion, Prediction, MOOD_MODEL_KIND};
use crate::error::{LabError, Result};
use crate::storage::Database;

struct ActiveModel {
    version: ModelVersion,
    model: MoodModel,
}

pub struct ModelRegistry {
    db: Arc<Database>,
    models_dir: PathBuf,
    active: RwLock<Option<Arc<ActiveModel>>>,
}

impl ModelRegistry {
    /// Open the registry and load the active artifact, if one exists.
    ///
    /// A missing or unreadable artifact is logged and the registry starts
    /// without an active model rather than failing.
    pub async fn load(db: Arc<Database>, models_dir: impl Into<PathBuf>) -> Result<Self> {
        let models_dir = models_dir.into();
        tokio::fs::create_dir_all(&models_dir).await?;

        let active = match db.active_version(MOOD_MODEL_KIND).await? {
            Some(version) => match read_artifact(&version.artifact_path).await {
                Ok(model) => {
                    info!("Loaded active model {} from {}", version.version_id, version.artifact_path.display());
                    Some(Arc::new(ActiveModel { version, model }))
                }
                Err(e) => {
                    warn!("Active model {} could not be loaded: {}", version.version_id, e);
                    None
                }
            },
            None => {
                warn!("No trained {} model found", MOOD_MODEL_KIND);
                None
            }
        };

        Ok(Self {
            db,
            models_dir,
            active: RwLock::new(active),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Persist `model` as a new version and make it the active one
    pub async fn promote(&self, model: MoodModel, accuracy: f64) -> Result<ModelVersion> {
        let created_at = Utc::now();
        let version_id = format!(
            "v{}_{}",
            created_at.format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let artifact_path = self
            .models_dir
            .join(format!("{}_{}.json", MOOD_MODEL_KIND, version_id));

        tokio::fs::write(&artifact_path, model.to_json()?).await?;

        let version = ModelVersion {
            version_id: version_id.clone(),
            model_kind: MOOD_MODEL_KIND.to_string(),
            accuracy,
            created_at,
            artifact_path: artifact_path.clone(),
            is_active: true,
        };

        if let Err(e) = self.db.promote_version(&version).await {
            // Orphaned artifact; the previous version stays active
            let _ = tokio::fs::remove_file(&artifact_path).await;
            return Err(e);
        }

        let previous = self
            .active
            .write()
            .await
            .replace(Arc::new(ActiveModel {
                version: version.clone(),
                model,
            }));

        info!(
            "Promoted {} (accuracy {:.3}, replaced {})",
            version_id,
            accuracy,
            previous
                .as_ref()
                .map(|p| p.version.version_id.as_str())
                .unwrap_or("none")
        );
        Ok(version)
    }

    pub async fn active_version(&self) -> Option<ModelVersion> {
        self.active.read().await.as_ref().map(|a| a.version.clone())
    }

    /// Creation time of the version serving predictions
    pub async fn last_promotion(&self) -> Option<DateTime<Utc>> {
        self.active.read().await.as_ref().map(|a| a.version.created_at)
    }

    pub async fn get_version(&self, version_id: &str) -> Result<ModelVersion> {
        self.db
            .get_version(version_id)
            .await?
            .ok_or_else(|| LabError::VersionNotFound(version_id.to_string()))
    }

    /// Score a feature mapping with the active model
    pub async fn predict(&self, features: &FeatureMap) -> Result<Prediction> {
        let active = self
            .active
            .read()
            .await
            .clone()
            .ok_or_else(|| LabError::NoActiveModel(MOOD_MODEL_KIND.to_string()))?;

        let output = active.model.predict(features);
        Ok(Prediction {
            mood: output.class as f64,
            confidence: output.confidence,
            probabilities: output.probabilities,
            model_version: active.version.version_id.clone(),
        })
    }
}

async fn read_artifact(path: &Path) -> Result<MoodModel> {
    let raw = tokio::fs::read_to_string(path).await?;
    MoodModel::from_json(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::model::{separable_set, ForestParams};
    use serde_json::json;
    use tempfile::tempdir;

    fn trained() -> MoodModel {
        let params = ForestParams {
            n_trees: 10,
            ..ForestParams::default()
        };
        MoodModel::fit(&separable_set(40, 5), params).unwrap()
    }

    #[tokio::test]
    async fn test_predict_without_model() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = ModelRegistry::load(db, dir.path().join("models")).await.unwrap();

        let err = registry.predict(&FeatureMap::new()).await.unwrap_err();
        assert!(matches!(err, LabError::NoActiveModel(_)));
        assert!(registry.get_version("v0").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_promote_then_predict_and_reload() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = ModelRegistry::load(db.clone(), dir.path()).await.unwrap();

        let version = registry.promote(trained(), 0.9).await.unwrap();
        assert!(version.artifact_path.exists());

        let mut features = FeatureMap::new();
        features.insert("polarity".into(), json!(0.8));
        let prediction = registry.predict(&features).await.unwrap();
        assert_eq!(prediction.model_version, version.version_id);
        assert_eq!(prediction.mood, 8.0);

        // A fresh registry over the same store serves the same version
        let reopened = ModelRegistry::load(db, dir.path()).await.unwrap();
        assert_eq!(
            reopened.active_version().await.unwrap().version_id,
            version.version_id
        );
    }

    #[tokio::test]
    async fn test_second_promotion_deactivates_first() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = ModelRegistry::load(db.clone(), dir.path()).await.unwrap();

        let first = registry.promote(trained(), 0.8).await.unwrap();
        let second = registry.promote(trained(), 0.85).await.unwrap();
        assert_ne!(first.version_id, second.version_id);

        assert!(!registry.get_version(&first.version_id).await.unwrap().is_active);
        assert!(registry.get_version(&second.version_id).await.unwrap().is_active);
        assert_eq!(registry.active_version().await.unwrap().version_id, second.version_id);
    }

    #[tokio::test]
    async fn test_missing_artifact_starts_without_model() {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = ModelRegistry::load(db.clone(), dir.path()).await.unwrap();
        let version = registry.promote(trained(), 0.8).await.unwrap();
        std::fs::remove_file(&version.artifact_path).unwrap();

        let reopened = ModelRegistry::load(db, dir.path()).await.unwrap();
        assert!(reopened.active_version().await.is_none());
    }
}
