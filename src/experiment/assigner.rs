//! Deterministic user to variant assignment

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use super::{Assignment, ExperimentRegistry};
use crate::error::{LabError, Result};
use crate::storage::Database;

/// Bucket index of a user for an experiment with `variant_count` arms.
///
/// SHA-256 over `experiment_id:user_id`, leading 8 bytes as a big-endian
/// integer, reduced modulo the arm count.
pub fn bucket_for(experiment_id: &str, user_id: &str, variant_count: usize) -> usize {
    if variant_count == 0 {
        return 0;
    }
    let mut hasher = Sha256::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % variant_count as u64) as usize
}

/// Sticky, persisted assignments
pub struct VariantAssigner {
    db: Arc<Database>,
    registry: Arc<ExperimentRegistry>,
}

impl VariantAssigner {
    pub fn new(db: Arc<Database>, registry: Arc<ExperimentRegistry>) -> Self {
        Self { db, registry }
    }

    /// Variant for `user_id`, persisted before it is returned.
    ///
    /// An existing assignment always wins, even if the variant list would
    /// hash the user elsewhere today.
    pub async fn assign(&self, experiment_id: &str, user_id: &str) -> Result<String> {
        let experiment = self.registry.get(experiment_id).await?;
        if !experiment.is_active() {
            return Err(LabError::ExperimentNotActive {
                id: experiment_id.to_string(),
                status: experiment.status.to_string(),
            });
        }

        if let Some(existing) = self.db.get_assignment(experiment_id, user_id).await? {
            debug!("User {} already in {} for {}", user_id, existing.variant, experiment_id);
            return Ok(existing.variant);
        }

        let index = bucket_for(experiment_id, user_id, experiment.variants.len());
        let computed = &experiment.variants[index].name;
        let stored = self
            .db
            .insert_assignment_if_absent(experiment_id, user_id, computed, Utc::now())
            .await?;

        info!("Assigned user {} to {} in {}", user_id, stored, experiment_id);
        Ok(stored)
    }

    /// Stored assignment, never creating one
    pub async fn lookup(&self, experiment_id: &str, user_id: &str) -> Result<Option<Assignment>> {
        self.db.get_assignment(experiment_id, user_id).await
    }
}
