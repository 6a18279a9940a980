//! Evaluation harness.
//!
//! Pipeline flow:
//! Instances × Replicates → Model → Outputs → Evaluator → Results → RecordStore

use crate::checkpoint::RecordStore;
use crate::client::DecodingEngine;
use crate::models::{
    CtrlError, EvaluationConfig, Instance, InstanceFailure, InstanceResult, ModelOutput, Result,
};
use crate::pipeline::Model;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Scores a single decoded response against an instance.
pub trait Evaluator: Send + Sync {
    /// Score in [0, 1].
    fn evaluate(&self, instance: &Instance, response: &str) -> Result<f64>;
}

/// Posterior-weighted score: Σ wᵢ·scoreᵢ / Σ wᵢ, or 0 when there is no mass.
pub fn weighted_accuracy(
    evaluator: &dyn Evaluator,
    instance: &Instance,
    output: &ModelOutput,
) -> Result<f64> {
    let total = output.total_weight();
    if total <= 0.0 {
        return Ok(0.0);
    }

    let mut weighted = 0.0;
    for response in &output.responses {
        if response.weight == 0.0 {
            continue;
        }
        let score = evaluator.evaluate(instance, &response.response)?;
        weighted += response.weight * score.clamp(0.0, 1.0);
    }
    Ok(weighted / total)
}

/// Harness knobs.
#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    pub output_dir: PathBuf,
    pub n_replicates: usize,
    pub max_instances: Option<usize>,
    pub overwrite_results: bool,
    pub overwrite_outputs: bool,
    pub concurrency: usize,
    pub show_progress: bool,
}

impl From<&EvaluationConfig> for EvaluationSettings {
    fn from(config: &EvaluationConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            n_replicates: config.n_replicates,
            max_instances: config.max_instances,
            overwrite_results: config.overwrite_results,
            overwrite_outputs: config.overwrite_outputs,
            concurrency: config.concurrency,
            show_progress: true,
        }
    }
}

/// Outcome of a harness run.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub run_id: String,
    pub results: Vec<InstanceResult>,
    pub failures: Vec<InstanceFailure>,
    /// Results taken from disk without decoding or re-scoring
    pub reused: usize,
    pub runtime_secs: f64,
}

enum PairOutcome {
    Reused(InstanceResult),
    Evaluated(InstanceResult),
}

/// Runs a model over a dataset and scores every (instance, replicate) pair.
pub struct Evaluation<E> {
    model: Arc<Model<E>>,
    evaluator: Arc<dyn Evaluator>,
    store: RecordStore,
    settings: EvaluationSettings,
}

impl<E: DecodingEngine + 'static> Evaluation<E> {
    pub fn new(
        model: Arc<Model<E>>,
        evaluator: Arc<dyn Evaluator>,
        settings: EvaluationSettings,
    ) -> Result<Self> {
        let store = RecordStore::new(&settings.output_dir)?;
        Ok(Self {
            model,
            evaluator,
            store,
            settings,
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Load instances from a JSONL file.
    pub fn load_instances(path: &Path) -> Result<Vec<Instance>> {
        let file = File::open(path).map_err(|e| CtrlError::io("opening instances file", e))?;
        let reader = BufReader::new(file);
        let mut instances = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| CtrlError::io("reading instances file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let instance: Instance = serde_json::from_str(&line)
                .map_err(|e| CtrlError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            instances.push(instance);
        }

        info!(count = instances.len(), "Loaded instances");
        Ok(instances)
    }

    /// Evaluate every pair.
    ///
    /// Instance-scoped failures are collected and the batch continues; any
    /// other error aborts the outstanding pairs and is returned.
    pub async fn run(&self, instances: Vec<Instance>) -> Result<EvaluationReport> {
        let start = Instant::now();
        let run_id = Uuid::new_v4().to_string();

        let limit = self.settings.max_instances.unwrap_or(instances.len());
        let instances: Vec<Arc<Instance>> = instances.into_iter().take(limit).map(Arc::new).collect();
        let replicates = self.settings.n_replicates;
        let total = instances.len() * replicates;

        info!(
            run_id = %run_id,
            model_type = %self.model.model_type(),
            instances = instances.len(),
            replicates,
            concurrency = self.settings.concurrency,
            "Starting evaluation"
        );

        let pb = if self.settings.show_progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut handles = Vec::with_capacity(total);

        for instance in &instances {
            for replicate in 0..replicates {
                let task = PairTask {
                    model: Arc::clone(&self.model),
                    evaluator: Arc::clone(&self.evaluator),
                    store: self.store.clone(),
                    instance: Arc::clone(instance),
                    replicate,
                    run_id: run_id.clone(),
                    overwrite_results: self.settings.overwrite_results,
                    overwrite_outputs: self.settings.overwrite_outputs,
                };
                let semaphore = Arc::clone(&semaphore);
                let handle = tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| CtrlError::Internal("Semaphore closed".to_string()))?;
                    task.run().await
                });
                handles.push((Arc::clone(instance), replicate, handle));
            }
        }

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut reused = 0;

        let mut pending = handles.into_iter();
        while let Some((instance, replicate, handle)) = pending.next() {
            let error = match handle.await {
                Ok(Ok(PairOutcome::Reused(result))) => {
                    reused += 1;
                    results.push(result);
                    None
                }
                Ok(Ok(PairOutcome::Evaluated(result))) => {
                    results.push(result);
                    None
                }
                Ok(Err(e)) if !e.is_instance_scoped() => {
                    for (_, _, rest) in pending {
                        rest.abort();
                    }
                    pb.abandon_with_message("Aborted");
                    return Err(e);
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("task panicked: {e}")),
            };

            if let Some(error) = error {
                warn!(
                    instance_id = %instance.instance_id,
                    replicate,
                    error = %error,
                    "Instance failed"
                );
                failures.push(InstanceFailure {
                    instance_id: instance.instance_id.clone(),
                    replicate,
                    error,
                });
            }

            pb.inc(1);
            pb.set_message(format!("ok: {}, failed: {}", results.len(), failures.len()));
        }

        pb.finish_with_message(format!(
            "Done! {} evaluated, {} failed",
            results.len(),
            failures.len()
        ));

        let report = EvaluationReport {
            run_id,
            results,
            failures,
            reused,
            runtime_secs: start.elapsed().as_secs_f64(),
        };

        info!(
            evaluated = report.results.len(),
            reused = report.reused,
            failed = report.failures.len(),
            runtime_secs = format!("{:.1}", report.runtime_secs),
            "Evaluation complete"
        );

        Ok(report)
    }
}

/// Everything a spawned task needs for one (instance, replicate) pair.
struct PairTask<E> {
    model: Arc<Model<E>>,
    evaluator: Arc<dyn Evaluator>,
    store: RecordStore,
    instance: Arc<Instance>,
    replicate: usize,
    run_id: String,
    overwrite_results: bool,
    overwrite_outputs: bool,
}

impl<E: DecodingEngine> PairTask<E> {
    async fn run(self) -> Result<PairOutcome> {
        let id = self.instance.instance_id.clone();
        let replicate = self.replicate;
        self.execute()
            .await
            .map_err(|e| e.for_instance(id, replicate))
    }

    async fn execute(&self) -> Result<PairOutcome> {
        let id = self.instance.instance_id.as_str();

        if !self.overwrite_results {
            if let Some(result) = self.store.load_result(id, self.replicate)? {
                debug!(instance_id = %id, replicate = self.replicate, "Reusing persisted result");
                return Ok(PairOutcome::Reused(result));
            }
        }

        let cached = if self.overwrite_outputs {
            None
        } else {
            self.store.load_output(id, self.replicate)?
        };

        let output = match cached {
            Some(output) => {
                debug!(instance_id = %id, replicate = self.replicate, "Re-scoring persisted output");
                output
            }
            None => {
                let output = self
                    .model
                    .run(&self.instance, self.store.dir(), self.replicate)
                    .await?;
                self.store.save_output(id, self.replicate, &output)?;
                output
            }
        };

        let accuracy = weighted_accuracy(self.evaluator.as_ref(), &self.instance, &output)?;
        let result = InstanceResult {
            instance_id: id.to_string(),
            replicate: self.replicate,
            weighted_accuracy: accuracy,
            runtime_secs: output.runtime_secs,
            record_path: self.store.record_path(id, self.replicate),
            model_type: self.model.model_type().to_string(),
            run_id: self.run_id.clone(),
            evaluated_at: Utc::now(),
        };
        self.store.save_result(&result)?;

        debug!(
            instance_id = %id,
            replicate = self.replicate,
            weighted_accuracy = accuracy,
            top_response = output.map_response().map(|r| r.response.as_str()).unwrap_or(""),
            "Instance evaluated"
        );
        Ok(PairOutcome::Evaluated(result))
    }
}
