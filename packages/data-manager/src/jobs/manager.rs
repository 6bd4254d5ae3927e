//! Job management: decomposing submitted jobs into per-year tasks and
//! folding task outcomes back into the job's state.
//!
//! `create_tasks` and the task outcome handlers each run inside one
//! transaction, so a job's tasks are either fully materialised and queued or
//! not created at all, and aggregation can never race a concurrent task
//! transition.

use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use super::job::Job;
use super::ops::JobOperations;
use super::queue::TaskQueueOperations;
use super::spec_keys;
use super::task::{Task, TaskState};
use crate::catalog::{Bundle, DataSet, SchemaOperations};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::transaction::Transaction;

/// What became of a task reported as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retries were left: the task is back in NEW and re-queued.
    Retried { retry_count: i32 },
    /// Retries exhausted: the task stays FAILED and the job aggregation ran.
    Fatal,
}

/// A planned task: one dataset, one year.
#[derive(Debug, Clone)]
struct TaskPlan {
    dataset_id: String,
    year: i32,
    spec: JsonValue,
}

/// Performs job management against the persistent store.
#[derive(Debug, Clone)]
pub struct JobManager {
    store: Store,
    config: Config,
}

impl JobManager {
    pub fn new(store: Store, config: Config) -> Self {
        Self { store, config }
    }

    /// Materialise the tasks for a freshly submitted job: one task per
    /// (dataset, year) covered by the job's spec, each persisted and queued.
    ///
    /// Runs in a single transaction; a failure part-way leaves the job in
    /// NEW with no tasks and no queue rows, which is a safe retry point.
    pub async fn create_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        info!(job_id = %job_id, "creating tasks");
        let mut tx = self.store.begin().await?;

        let mut job = tx.get_job(job_id).await?.ok_or_else(|| Error::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;

        let bundle_id = spec_str(&job.spec, spec_keys::BUNDLE_ID)?;
        let bundle = tx
            .get_bundle(&bundle_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "bundle",
                id: bundle_id.clone(),
            })?;

        let mut datasets = Vec::new();
        for (dataset_id, _) in group_variables(&job.spec)? {
            let dataset = tx
                .get_dataset(&dataset_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    entity: "dataset",
                    id: dataset_id.clone(),
                })?;
            datasets.push(dataset);
        }

        let plans = plan_tasks(job_id, &job.spec, &bundle, &datasets, &self.config)?;

        let mut tasks = Vec::with_capacity(plans.len());
        for plan in plans {
            let task = Task::create(plan.spec, job_id);
            tx.create_task(&task).await?;
            tx.queue_task(job_id, &task.task_name).await?;
            info!(
                job_id = %job_id,
                task_name = %task.task_name,
                dataset_id = %plan.dataset_id,
                year = plan.year,
                "created task"
            );
            tasks.push(task);
        }

        job.set_running();
        tx.update_job(&job).await?;
        tx.commit().await?;
        Ok(tasks)
    }

    /// Re-evaluate a job's state from its tasks after a terminal task
    /// transition.
    pub async fn update_job(&self, job_id: &str) -> Result<Job> {
        let mut tx = self.store.begin().await?;
        let job = aggregate_job(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Dequeue the next pending task, mark it RUNNING, and hand it to the
    /// caller. Returns `None` when the queue is empty.
    pub async fn claim_next_task(&self) -> Result<Option<Task>> {
        let mut tx = self.store.begin().await?;
        let Some(mut task) = tx.get_next_task().await? else {
            return Ok(None);
        };
        task.set_running();
        tx.update_task(&task).await?;
        tx.commit().await?;
        debug!(job_id = %task.job_id, task_name = %task.task_name, "claimed task");
        Ok(Some(task))
    }

    /// Record a task's success and fold the outcome into the job.
    pub async fn complete_task(&self, job_id: &str, task_name: &str) -> Result<Job> {
        let mut tx = self.store.begin().await?;
        let mut task = get_task_required(&mut tx, job_id, task_name).await?;
        task.set_completed();
        tx.update_task(&task).await?;
        info!(job_id = %job_id, task_name = %task_name, "task completed");

        let job = aggregate_job(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Record a worker-reported task failure.
    ///
    /// While retries remain the task is reset to NEW and re-queued; once
    /// they are exhausted it stays FAILED and the job aggregation runs.
    pub async fn fail_task(
        &self,
        job_id: &str,
        task_name: &str,
        error: &str,
    ) -> Result<FailureOutcome> {
        let mut tx = self.store.begin().await?;
        let mut task = get_task_required(&mut tx, job_id, task_name).await?;

        if task.retry_count < self.config.max_task_retries as i32 {
            task.retry();
            tx.update_task(&task).await?;
            tx.queue_task(job_id, task_name).await?;
            tx.commit().await?;
            warn!(
                job_id = %job_id,
                task_name = %task_name,
                error = %error,
                retry_count = task.retry_count,
                "task failed, re-queued for retry"
            );
            Ok(FailureOutcome::Retried {
                retry_count: task.retry_count,
            })
        } else {
            task.set_failed(error);
            tx.update_task(&task).await?;
            warn!(
                job_id = %job_id,
                task_name = %task_name,
                error = %error,
                "task failed, retries exhausted"
            );
            aggregate_job(&mut tx, job_id).await?;
            tx.commit().await?;
            Ok(FailureOutcome::Fatal)
        }
    }
}

/// Count this job's remaining work and write the aggregate state: COMPLETED
/// once every task succeeded, FAILED once no task is active and at least one
/// failed, RUNNING otherwise. Counts and the final write share the caller's
/// transaction.
async fn aggregate_job(tx: &mut Transaction, job_id: &str) -> Result<Job> {
    let active = tx
        .count_tasks_by_state(&TaskState::ACTIVE, Some(job_id))
        .await?;
    let mut job = tx.get_job(job_id).await?.ok_or_else(|| Error::NotFound {
        entity: "job",
        id: job_id.to_string(),
    })?;

    if active == 0 {
        let failed = tx
            .count_tasks_by_state(&[TaskState::Failed], Some(job_id))
            .await?;
        if failed == 0 {
            job.set_completed();
            info!(job_id = %job_id, "job completed");
        } else {
            job.set_failed(format!("{failed} tasks failed"));
            info!(job_id = %job_id, failed, "job failed");
        }
    } else {
        debug!(job_id = %job_id, active, "job has active tasks");
        job.set_running();
    }

    tx.update_job(&job).await?;
    Ok(job)
}

async fn get_task_required(tx: &mut Transaction, job_id: &str, task_name: &str) -> Result<Task> {
    tx.get_task(job_id, task_name)
        .await?
        .ok_or_else(|| Error::NotFound {
            entity: "task",
            id: format!("{job_id}/{task_name}"),
        })
}

/// Plan the tasks for a job: one per (dataset, year), each with the job spec
/// specialised to that slice of the request.
fn plan_tasks(
    job_id: &str,
    job_spec: &JsonValue,
    bundle: &Bundle,
    datasets: &[DataSet],
    config: &Config,
) -> Result<Vec<TaskPlan>> {
    if !job_spec.is_object() {
        return Err(Error::InvalidSpec("job spec must be an object".to_string()));
    }

    let start_year = spec_year(job_spec, spec_keys::START_YEAR)?;
    let end_year = spec_year(job_spec, spec_keys::END_YEAR)?;
    let bounds = &bundle.spec["bounds"];

    let mut plans = Vec::new();
    for (dataset_id, variable_ids) in group_variables(job_spec)? {
        let dataset = datasets
            .iter()
            .find(|d| d.dataset_id == dataset_id)
            .ok_or_else(|| Error::NotFound {
                entity: "dataset",
                id: dataset_id.clone(),
            })?;

        // Instantiate the non-datetime parts of the output filename pattern
        // from the dataset's metadata.
        let metadata = &dataset.spec["metadata"];
        let level = metadata["level"].as_str().unwrap_or("LEVEL");
        let product = metadata["product"].as_str().unwrap_or("PRODUCT");
        let version = metadata["version"].as_str().unwrap_or("VERSION");
        let output_name_pattern = config
            .output_filename_pattern
            .replace("{LEVEL}", level)
            .replace("{PRODUCT}", product)
            .replace("{VERSION}", version);

        for year in start_year..=end_year {
            let mut spec = job_spec.clone();

            // Interior years cover the whole calendar year.
            if year > start_year {
                spec[spec_keys::START_MONTH] = json!("1");
                spec[spec_keys::START_DAY] = json!("1");
            }
            if year < end_year {
                spec[spec_keys::END_MONTH] = json!("12");
                spec[spec_keys::END_DAY] = json!("31");
            }
            spec[spec_keys::START_YEAR] = json!(year.to_string());
            spec[spec_keys::END_YEAR] = json!(year.to_string());

            spec[spec_keys::VARIABLES] = json!(variable_ids);
            spec[spec_keys::IN_PATH] = json!(dataset.location.replace("{YEAR}", &year.to_string()));
            spec[spec_keys::OUT_PATH] = json!(config
                .output_path
                .join(job_id)
                .join(year.to_string())
                .to_string_lossy());
            spec[spec_keys::OUTPUT_NAME_PATTERN] = json!(output_name_pattern);

            // Fall back to the bundle's bounding box, then the whole globe.
            let corners = [
                (spec_keys::LON_MIN, "minx", -180),
                (spec_keys::LON_MAX, "maxx", 180),
                (spec_keys::LAT_MIN, "miny", -90),
                (spec_keys::LAT_MAX, "maxy", 90),
            ];
            for (key, corner, default) in corners {
                if spec.get(key).is_none() {
                    spec[key] = match &bounds[corner] {
                        JsonValue::Null => json!(default),
                        value => value.clone(),
                    };
                }
            }

            plans.push(TaskPlan {
                dataset_id: dataset_id.clone(),
                year,
                spec,
            });
        }
    }

    Ok(plans)
}

/// Group the job's `"{dataset}:{variable}"` references by dataset, keeping
/// datasets in order of first appearance.
fn group_variables(job_spec: &JsonValue) -> Result<Vec<(String, Vec<String>)>> {
    let refs = job_spec
        .get(spec_keys::VARIABLES)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| Error::InvalidSpec(format!("missing {} list", spec_keys::VARIABLES)))?;

    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for reference in refs {
        let reference = reference
            .as_str()
            .ok_or_else(|| Error::InvalidSpec(format!("non-string entry in {}", spec_keys::VARIABLES)))?;
        let (dataset_id, variable_id) = reference.split_once(':').ok_or_else(|| {
            Error::InvalidSpec(format!("variable reference {reference:?} is not dataset:variable"))
        })?;

        match groups.iter_mut().find(|(id, _)| id == dataset_id) {
            Some((_, variables)) => variables.push(variable_id.to_string()),
            None => groups.push((dataset_id.to_string(), vec![variable_id.to_string()])),
        }
    }
    Ok(groups)
}

fn spec_str(spec: &JsonValue, key: &str) -> Result<String> {
    spec.get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidSpec(format!("missing {key}")))
}

/// Read a year that may be stored as a number or a numeric string.
fn spec_year(spec: &JsonValue, key: &str) -> Result<i32> {
    let value = spec
        .get(key)
        .ok_or_else(|| Error::InvalidSpec(format!("missing {key}")))?;
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .map(|n| n as i32)
            .ok_or_else(|| Error::InvalidSpec(format!("{key} is not an integer"))),
        JsonValue::String(s) => s
            .parse()
            .map_err(|_| Error::InvalidSpec(format!("{key} is not an integer"))),
        _ => Err(Error::InvalidSpec(format!("{key} is not an integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{SpatialResolution, TemporalResolution, Variable};
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            database_url: "postgresql://localhost/unused".to_string(),
            output_path: PathBuf::from("/out"),
            output_filename_pattern: "{PRODUCT}-{LEVEL}-{VERSION}-{Y}{m}{d}".to_string(),
            task_quota: 4,
            job_quota: 2,
            cleanup_after_secs: 3600,
            max_task_retries: 1,
        }
    }

    fn sst_dataset() -> DataSet {
        DataSet {
            dataset_id: "sst".to_string(),
            dataset_name: "Sea Surface Temperatures".to_string(),
            temporal_resolution: TemporalResolution::Daily,
            spatial_resolution: SpatialResolution::Deg0_05,
            start_date: NaiveDate::from_ymd_opt(1981, 9, 1).unwrap(),
            end_date: None,
            location: "/data/sst/{YEAR}/*.nc".to_string(),
            spec: json!({"metadata": {"level": "L4", "product": "SST", "version": "v2"}}),
            variables: vec![
                Variable::new("sst", "Sea Surface Temperature", json!({})),
                Variable::new("sst_uncertainty", "Uncertainty", json!({})),
            ],
            enabled: true,
        }
    }

    fn oc_dataset() -> DataSet {
        DataSet {
            dataset_id: "oc".to_string(),
            dataset_name: "Ocean Colour".to_string(),
            temporal_resolution: TemporalResolution::Daily,
            spatial_resolution: SpatialResolution::Deg0_05,
            start_date: NaiveDate::from_ymd_opt(1997, 1, 1).unwrap(),
            end_date: None,
            location: "/data/oc/{YEAR}/*.nc".to_string(),
            spec: json!({}),
            variables: vec![Variable::new("chlor_a", "Chlorophyll-a", json!({}))],
            enabled: true,
        }
    }

    fn ocean_bundle() -> Bundle {
        Bundle {
            bundle_id: "ocean".to_string(),
            bundle_name: "Ocean Data Bundle".to_string(),
            spec: json!({"bounds": {"minx": -25.0, "miny": 40.0, "maxx": 15.0, "maxy": 65.0}}),
            dataset_ids: vec!["sst".to_string(), "oc".to_string()],
            enabled: true,
        }
    }

    #[test]
    fn one_task_is_planned_per_dataset_and_year() {
        let spec = json!({
            "BUNDLE_ID": "ocean",
            "VARIABLES": ["sst:sst", "oc:chlor_a"],
            "START_YEAR": 2018,
            "END_YEAR": 2020,
            "OUTPUT_FORMAT": "netcdf",
        });
        let plans = plan_tasks(
            "job-1",
            &spec,
            &ocean_bundle(),
            &[sst_dataset(), oc_dataset()],
            &test_config(),
        )
        .unwrap();
        assert_eq!(plans.len(), 6);
    }

    #[test]
    fn multi_year_job_splits_into_calendar_years() {
        let spec = json!({
            "BUNDLE_ID": "ocean",
            "VARIABLES": ["sst:sst", "sst:sst_uncertainty"],
            "START_YEAR": "2018",
            "START_MONTH": "3",
            "END_YEAR": "2020",
            "END_MONTH": "10",
            "OUTPUT_FORMAT": "netcdf",
        });
        let plans = plan_tasks("job-1", &spec, &ocean_bundle(), &[sst_dataset()], &test_config())
            .unwrap();

        assert_eq!(plans.len(), 3);
        let by_year: Vec<&TaskPlan> = plans.iter().collect();

        for (plan, year) in by_year.iter().zip([2018, 2019, 2020]) {
            assert_eq!(plan.year, year);
            assert_eq!(plan.spec["START_YEAR"], year.to_string());
            assert_eq!(plan.spec["END_YEAR"], year.to_string());
            assert_eq!(
                plan.spec["IN_PATH"],
                format!("/data/sst/{year}/*.nc")
            );
            assert_eq!(
                plan.spec["OUT_PATH"],
                format!("/out/job-1/{year}")
            );
            assert_eq!(plan.spec["VARIABLES"], json!(["sst", "sst_uncertainty"]));
        }

        // First year keeps the job's start, later years start January 1st.
        assert_eq!(by_year[0].spec["START_MONTH"], "3");
        assert!(by_year[0].spec.get("START_DAY").is_none());
        assert_eq!(by_year[1].spec["START_MONTH"], "1");
        assert_eq!(by_year[1].spec["START_DAY"], "1");
        assert_eq!(by_year[2].spec["START_MONTH"], "1");

        // Last year keeps the job's end, earlier years run to December 31st.
        assert_eq!(by_year[0].spec["END_MONTH"], "12");
        assert_eq!(by_year[0].spec["END_DAY"], "31");
        assert_eq!(by_year[1].spec["END_MONTH"], "12");
        assert_eq!(by_year[2].spec["END_MONTH"], "10");
        assert!(by_year[2].spec.get("END_DAY").is_none());
    }

    #[test]
    fn bounds_default_to_the_bundle_then_the_globe() {
        let spec = json!({
            "BUNDLE_ID": "ocean",
            "VARIABLES": ["sst:sst"],
            "START_YEAR": 2020,
            "END_YEAR": 2020,
            "LON_MIN": -5.0,
        });
        let bundle = ocean_bundle();
        let plans =
            plan_tasks("job-1", &spec, &bundle, &[sst_dataset()], &test_config()).unwrap();
        let task_spec = &plans[0].spec;

        // explicitly requested bound wins
        assert_eq!(task_spec["LON_MIN"], json!(-5.0));
        // bundle bounds fill the rest
        assert_eq!(task_spec["LON_MAX"], json!(15.0));
        assert_eq!(task_spec["LAT_MIN"], json!(40.0));
        assert_eq!(task_spec["LAT_MAX"], json!(65.0));

        let mut unbounded = bundle;
        unbounded.spec = json!({});
        let plans =
            plan_tasks("job-1", &spec, &unbounded, &[sst_dataset()], &test_config()).unwrap();
        assert_eq!(plans[0].spec["LON_MAX"], json!(180));
        assert_eq!(plans[0].spec["LAT_MIN"], json!(-90));
    }

    #[test]
    fn output_name_pattern_substitutes_dataset_metadata() {
        let spec = json!({
            "BUNDLE_ID": "ocean",
            "VARIABLES": ["sst:sst"],
            "START_YEAR": 2020,
            "END_YEAR": 2020,
        });
        let plans =
            plan_tasks("job-1", &spec, &ocean_bundle(), &[sst_dataset()], &test_config()).unwrap();
        assert_eq!(plans[0].spec["OUTPUT_NAME_PATTERN"], "SST-L4-v2-{Y}{m}{d}");

        // Missing metadata leaves the literal placeholders in place.
        let plans =
            plan_tasks(
                "job-1",
                &json!({
                    "BUNDLE_ID": "ocean",
                    "VARIABLES": ["oc:chlor_a"],
                    "START_YEAR": 2020,
                    "END_YEAR": 2020,
                }),
                &ocean_bundle(),
                &[oc_dataset()],
                &test_config(),
            )
            .unwrap();
        assert_eq!(
            plans[0].spec["OUTPUT_NAME_PATTERN"],
            "PRODUCT-LEVEL-VERSION-{Y}{m}{d}"
        );
    }

    #[test]
    fn variables_group_by_dataset_in_first_appearance_order() {
        let spec = json!({"VARIABLES": ["sst:sst", "oc:chlor_a", "sst:sst_uncertainty"]});
        let groups = group_variables(&spec).unwrap();
        assert_eq!(
            groups,
            vec![
                (
                    "sst".to_string(),
                    vec!["sst".to_string(), "sst_uncertainty".to_string()]
                ),
                ("oc".to_string(), vec!["chlor_a".to_string()]),
            ]
        );
    }

    #[test]
    fn malformed_variable_reference_is_rejected() {
        let spec = json!({"VARIABLES": ["sst"]});
        assert!(matches!(
            group_variables(&spec),
            Err(Error::InvalidSpec(_))
        ));
    }

    #[test]
    fn years_accept_numbers_and_strings() {
        assert_eq!(spec_year(&json!({"Y": 2020}), "Y").unwrap(), 2020);
        assert_eq!(spec_year(&json!({"Y": "2020"}), "Y").unwrap(), 2020);
        assert!(spec_year(&json!({"Y": "soon"}), "Y").is_err());
        assert!(spec_year(&json!({}), "Y").is_err());
    }
}
