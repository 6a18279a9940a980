//! Per-instance persistence for resumable evaluation runs.
//!
//! Layout under the output directory:
//! - `{id}-{rep}-record.json`: written by the decoding engine
//! - `{id}-{rep}-output.json`: the model's weighted posterior
//! - `{id}-{rep}-results.json`: the evaluated result
//! - `summary.json`: the aggregate of the last report
//!
//! All writes go through a temp file and a rename, so a crash never leaves a
//! truncated JSON file behind.

use crate::models::{AggregateResult, CtrlError, InstanceResult, ModelOutput, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const SUMMARY_FILE: &str = "summary.json";

fn artifact_path(output_dir: &Path, instance_id: &str, replicate: usize, kind: &str) -> PathBuf {
    output_dir.join(format!("{instance_id}-{replicate}-{kind}.json"))
}

/// Location of the engine record for an (instance, replicate) pair.
pub fn record_path(output_dir: &Path, instance_id: &str, replicate: usize) -> PathBuf {
    artifact_path(output_dir, instance_id, replicate, "record")
}

pub fn output_path(output_dir: &Path, instance_id: &str, replicate: usize) -> PathBuf {
    artifact_path(output_dir, instance_id, replicate, "output")
}

pub fn results_path(output_dir: &Path, instance_id: &str, replicate: usize) -> PathBuf {
    artifact_path(output_dir, instance_id, replicate, "results")
}

/// JSON artifact store rooted at the run's output directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Open the store, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| CtrlError::io(format!("creating output dir {}", dir.display()), e))?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, instance_id: &str, replicate: usize) -> PathBuf {
        record_path(&self.dir, instance_id, replicate)
    }

    pub fn load_output(&self, instance_id: &str, replicate: usize) -> Result<Option<ModelOutput>> {
        read_json(&output_path(&self.dir, instance_id, replicate))
    }

    pub fn save_output(&self, instance_id: &str, replicate: usize, output: &ModelOutput) -> Result<()> {
        write_json(&output_path(&self.dir, instance_id, replicate), output)
    }

    pub fn load_result(&self, instance_id: &str, replicate: usize) -> Result<Option<InstanceResult>> {
        read_json(&results_path(&self.dir, instance_id, replicate))
    }

    pub fn save_result(&self, result: &InstanceResult) -> Result<()> {
        write_json(
            &results_path(&self.dir, &result.instance_id, result.replicate),
            result,
        )
    }

    pub fn save_summary(&self, summary: &AggregateResult) -> Result<()> {
        write_json(&self.dir.join(SUMMARY_FILE), summary)
    }

    /// Every persisted result in the directory, ordered by file name.
    pub fn collect_results(&self) -> Result<Vec<InstanceResult>> {
        let pattern = self.dir.join("*-results.json");
        let pattern = pattern.to_string_lossy();

        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| CtrlError::InvalidInput(format!("bad results pattern: {e}")))?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(result) = read_json(&path)? {
                results.push(result);
            }
        }
        debug!(count = results.len(), dir = %self.dir.display(), "Collected results");
        Ok(results)
    }
}

/// Read a JSON file; a missing file is `None`.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CtrlError::io(format!("opening {}", path.display()), e)),
    };
    let value = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| CtrlError::ParseError(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Write-then-rename.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let file = File::create(&temp_path)
        .map_err(|e| CtrlError::io(format!("creating {}", temp_path.display()), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| CtrlError::Internal(format!("Serializing {}: {e}", path.display())))?;
    writer
        .flush()
        .map_err(|e| CtrlError::io(format!("flushing {}", temp_path.display()), e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| CtrlError::io(format!("renaming into {}", path.display()), e))?;
    debug!(path = %path.display(), "Saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelResponse;
    use chrono::Utc;
    use tempfile::TempDir;

    fn result(id: &str, replicate: usize, accuracy: f64) -> InstanceResult {
        InstanceResult {
            instance_id: id.to_string(),
            replicate,
            weighted_accuracy: accuracy,
            runtime_secs: 0.5,
            record_path: PathBuf::from(format!("{id}-{replicate}-record.json")),
            model_type: "base".to_string(),
            run_id: "run".to_string(),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_path_format() {
        assert_eq!(
            record_path(Path::new("out"), "spider-7", 2),
            PathBuf::from("out/spider-7-2-record.json")
        );
    }

    #[test]
    fn test_output_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(&dir.path().join("run")).unwrap();

        assert!(store.load_output("q1", 0).unwrap().is_none());

        let output = ModelOutput {
            responses: vec![ModelResponse {
                response: "CCO".to_string(),
                weight: 1.0,
            }],
            runtime_secs: 2.0,
        };
        store.save_output("q1", 0, &output).unwrap();

        let loaded = store.load_output("q1", 0).unwrap().unwrap();
        assert_eq!(loaded.responses, output.responses);
        assert!(!dir.path().join("run/q1-0-output.json.tmp").exists());
    }

    #[test]
    fn test_output_larger_than_write_buffer_is_complete() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path()).unwrap();
        let output = ModelOutput {
            responses: (0..2000)
                .map(|i| ModelResponse {
                    response: format!("SELECT name FROM singer WHERE singer_id = {i}"),
                    weight: 1.0 / 2000.0,
                })
                .collect(),
            runtime_secs: 12.5,
        };
        store.save_output("q1", 0, &output).unwrap();

        let raw = fs::read(dir.path().join("q1-0-output.json")).unwrap();
        assert!(raw.len() > 8 * 1024);
        let loaded = store.load_output("q1", 0).unwrap().unwrap();
        assert_eq!(loaded.responses.len(), 2000);
        assert_eq!(loaded.responses, output.responses);
    }

    #[test]
    fn test_unwritable_dir_is_io_error() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path()).unwrap();
        fs::remove_dir_all(dir.path()).unwrap();
        assert!(matches!(
            store.save_result(&result("q1", 0, 1.0)),
            Err(CtrlError::Io { .. })
        ));
    }

    #[test]
    fn test_collect_results_sorted() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path()).unwrap();
        store.save_result(&result("b", 0, 0.5)).unwrap();
        store.save_result(&result("a", 1, 1.0)).unwrap();
        store.save_result(&result("a", 0, 0.0)).unwrap();
        store
            .save_output("a", 0, &ModelOutput {
                responses: vec![],
                runtime_secs: 0.0,
            })
            .unwrap();

        let results = store.collect_results().unwrap();
        let keys: Vec<(&str, usize)> = results
            .iter()
            .map(|r| (r.instance_id.as_str(), r.replicate))
            .collect();
        assert_eq!(keys, vec![("a", 0), ("a", 1), ("b", 0)]);
    }

    #[test]
    fn test_corrupt_result_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("q1-0-results.json"), "{not json").unwrap();
        assert!(matches!(
            store.load_result("q1", 0),
            Err(CtrlError::ParseError(_))
        ));
    }
}
