//! Fitted skill model artifact.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineWarning;
use crate::skill::SkillFit;
use crate::types::CompetitorId;

/// Skills learned by ListMLE plus the provenance needed to audit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillModel {
    pub skills: BTreeMap<CompetitorId, f64>,
    /// Power EP fractional power used at inference time
    pub alpha: f64,
    pub converged: bool,
    pub iterations: usize,
    pub final_loss: f64,
    pub races_used: usize,
    #[serde(default)]
    pub loss_history: Vec<f64>,
    #[serde(default)]
    pub warnings: Vec<EngineWarning>,
    /// Hash of the training corpus
    #[serde(default)]
    pub corpus_hash: String,
}

impl SkillModel {
    pub fn from_fit(fit: SkillFit, alpha: f64, corpus_hash: String) -> Self {
        Self {
            skills: fit.skills,
            alpha,
            converged: fit.converged,
            iterations: fit.iterations,
            final_loss: fit.final_loss,
            races_used: fit.races_used,
            loss_history: fit.loss_history,
            warnings: fit.warnings,
            corpus_hash,
        }
    }

    /// Skill of a competitor. Unseen competitors get the neutral 0.0.
    pub fn skill_of(&self, id: &CompetitorId) -> f64 {
        self.skills.get(id).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// Load a model from JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read skill model {}", path.display()))?;
        let model: SkillModel =
            serde_json::from_str(&content).context("Failed to parse skill model")?;
        Ok(model)
    }
}

/// Thread-safe model wrapper for use in web handlers.
pub type SharedModel = Arc<SkillModel>;

/// Create a shared model instance.
pub fn create_shared_model<P: AsRef<Path>>(path: P) -> Result<SharedModel> {
    let model = SkillModel::load(path)?;
    tracing::info!("Loaded skill model with {} competitors", model.len());
    Ok(Arc::new(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model() -> SkillModel {
        let mut skills = BTreeMap::new();
        skills.insert(CompetitorId::new("H1"), 0.4);
        skills.insert(CompetitorId::new("H2"), -0.4);
        SkillModel {
            skills,
            alpha: 0.5,
            converged: true,
            iterations: 12,
            final_loss: 0.61,
            races_used: 3,
            loss_history: vec![0.69, 0.61],
            warnings: Vec::new(),
            corpus_hash: "sha256:abc".to_string(),
        }
    }

    #[test]
    fn test_unseen_competitor_is_neutral() {
        let m = model();
        assert_eq!(m.skill_of(&CompetitorId::new("H1")), 0.4);
        assert_eq!(m.skill_of(&CompetitorId::new("NEW")), 0.0);
    }

    #[test]
    fn test_load_from_json() {
        let json = serde_json::to_string_pretty(&model()).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();

        let shared = create_shared_model(file.path()).unwrap();
        assert_eq!(*shared, model());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(SkillModel::load("/nonexistent/skills.json").is_err());
    }
}
