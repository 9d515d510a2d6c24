//! Writing frozen artifacts.
//!
//! Every artifact is rendered before the first byte hits disk, and each file
//! is written to a temporary sibling and renamed into place.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::calibration::CalibrationArtifact;
use crate::pipeline::PipelineOutput;

pub const MODEL_FILE: &str = "model.json";
pub const CALIBRATION_FILE: &str = "calibration.json";
pub const PREDICTIONS_FILE: &str = "predictions.json";
pub const AUDIT_FILE: &str = "audit.json";

/// Pretty JSON with a trailing newline.
pub fn render_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write bytes to `path` via a temporary sibling and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &render_json(value)?)
}

/// Render and write the four artifacts of a run into `dir`.
pub fn write_all(dir: &Path, output: &PipelineOutput) -> Result<Vec<PathBuf>> {
    let calibration = CalibrationArtifact {
        calibrator: output.calibrator.clone(),
        reports: output.audit.calibration.clone(),
    };
    let rendered = [
        (MODEL_FILE, render_json(&output.model)?),
        (CALIBRATION_FILE, render_json(&calibration)?),
        (PREDICTIONS_FILE, render_json(&output.predictions)?),
        (AUDIT_FILE, render_json(&output.audit)?),
    ];

    let mut written = Vec::with_capacity(rendered.len());
    for (name, bytes) in &rendered {
        let path = dir.join(name);
        write_atomic(&path, bytes)?;
        tracing::info!("Wrote {} ({} bytes)", path.display(), bytes.len());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibrator;
    use crate::config::EngineConfig;
    use crate::corpus::chronological_split;
    use crate::model::SkillModel;
    use crate::pipeline::run_pipeline;
    use crate::pipeline::tests::synthetic_corpus;

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_json(&path, &vec![1, 2, 3]).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[\n  1,\n  2,\n  3\n]\n");
        assert!(!dir.path().join("nested").join("out.json.tmp").exists());
    }

    #[test]
    fn test_artifacts_byte_identical_across_runs() {
        let corpus = synthetic_corpus(30);
        let splits = chronological_split(&corpus.race_ids(), 60, 20);
        let mut config = EngineConfig::default();
        config.training.max_iterations = 50;

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_all(first.path(), &run_pipeline(&corpus, &splits, &config).unwrap()).unwrap();
        write_all(second.path(), &run_pipeline(&corpus, &splits, &config).unwrap()).unwrap();

        for name in [MODEL_FILE, CALIBRATION_FILE, PREDICTIONS_FILE, AUDIT_FILE] {
            let a = fs::read(first.path().join(name)).unwrap();
            let b = fs::read(second.path().join(name)).unwrap();
            assert_eq!(a, b, "{} differs between runs", name);
        }

        let model = SkillModel::load(first.path().join(MODEL_FILE)).unwrap();
        assert!(!model.skills.is_empty());
        let calibrator = Calibrator::from_file(first.path().join(CALIBRATION_FILE)).unwrap();
        assert!(calibrator.is_enabled());

        let text = fs::read_to_string(first.path().join(CALIBRATION_FILE)).unwrap();
        let artifact: CalibrationArtifact = serde_json::from_str(&text).unwrap();
        assert_eq!(artifact.reports.len(), 2);
        assert_eq!(artifact.reports[0].target, "win");
    }
}
