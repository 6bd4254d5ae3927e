//! Catalog repository operations.
//!
//! Implemented for [`Transaction`] so that a schema reload is atomic: the
//! whole populate either commits or rolls back with the catalog untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::info;

use super::bundle::Bundle;
use super::dataset::{DataSet, SpatialResolution, TemporalResolution, Variable};
use crate::error::{conflict_or_storage, Error, Result};
use crate::store::Store;
use crate::transaction::Transaction;

/// Persistence and retrieval of the static catalog (bundles, datasets,
/// variables).
#[async_trait]
pub trait SchemaOperations {
    /// Reload the catalog from a directory holding `datasets/` and `bundles/`
    /// sub-directories of YAML files.
    ///
    /// Reloading is declarative: the catalog tables are cleared and rebuilt
    /// from the files. Dynamically discovered per-dataset end dates survive
    /// the reload for any dataset id that still exists.
    async fn populate_schema(&mut self, schema_dir: &Path) -> Result<()>;

    /// Delete all rows from the catalog tables.
    async fn clear_schema(&mut self) -> Result<()>;

    /// Insert a dataset and its variables.
    async fn create_dataset(&mut self, dataset: &DataSet) -> Result<()>;

    /// Insert a bundle and its dataset memberships.
    async fn create_bundle(&mut self, bundle: &Bundle) -> Result<()>;

    /// All stored bundles, with their dataset ids rehydrated.
    async fn list_bundles(&mut self) -> Result<Vec<Bundle>>;

    /// All stored datasets, with their variables rehydrated.
    async fn list_datasets(&mut self) -> Result<Vec<DataSet>>;

    async fn get_bundle(&mut self, bundle_id: &str) -> Result<Option<Bundle>>;

    async fn get_dataset(&mut self, dataset_id: &str) -> Result<Option<DataSet>>;

    /// Snapshot of every dataset's end date.
    async fn dataset_end_dates(&mut self) -> Result<BTreeMap<String, Option<NaiveDate>>>;

    async fn update_dataset_end_date(
        &mut self,
        dataset_id: &str,
        end_date: Option<NaiveDate>,
    ) -> Result<()>;

    /// Delete a bundle. Its `dataset_bundle` rows cascade; the datasets
    /// themselves are untouched.
    async fn remove_bundle(&mut self, bundle_id: &str) -> Result<u64>;
}

#[async_trait]
impl SchemaOperations for Transaction {
    async fn populate_schema(&mut self, schema_dir: &Path) -> Result<()> {
        let datasets = DataSet::load_dir(&schema_dir.join("datasets"))?;
        let bundles = Bundle::load_dir(&schema_dir.join("bundles"))?;

        let end_dates = self.dataset_end_dates().await?;
        self.clear_schema().await?;

        let mut inserted_ids = BTreeSet::new();
        for dataset in datasets.iter().filter(|d| d.enabled) {
            self.create_dataset(dataset).await?;
            inserted_ids.insert(dataset.dataset_id.clone());
            info!(dataset_id = %dataset.dataset_id, "added dataset");
        }

        for bundle in bundles.iter().filter(|b| b.enabled) {
            for dataset_id in &bundle.dataset_ids {
                if !inserted_ids.contains(dataset_id) {
                    return Err(Error::Catalog(format!(
                        "bundle {} references unknown dataset {}",
                        bundle.bundle_id, dataset_id
                    )));
                }
            }
            self.create_bundle(bundle).await?;
            info!(bundle_id = %bundle.bundle_id, "added bundle");
        }

        for (dataset_id, end_date) in end_dates {
            if end_date.is_some() && inserted_ids.contains(&dataset_id) {
                self.update_dataset_end_date(&dataset_id, end_date).await?;
            }
        }

        Ok(())
    }

    async fn clear_schema(&mut self) -> Result<()> {
        // dataset_bundle and variables cascade from these two
        sqlx::query("DELETE FROM datasets").execute(self.conn()).await?;
        sqlx::query("DELETE FROM bundles").execute(self.conn()).await?;
        Ok(())
    }

    async fn create_dataset(&mut self, dataset: &DataSet) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO datasets (dataset_id, dataset_name, temporal_resolution,
                                  spatial_resolution, start_date, end_date, location, spec)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&dataset.dataset_id)
        .bind(&dataset.dataset_name)
        .bind(dataset.temporal_resolution.as_str())
        .bind(dataset.spatial_resolution.as_str())
        .bind(Store::encode_date(Some(dataset.start_date)))
        .bind(Store::encode_date(dataset.end_date))
        .bind(&dataset.location)
        .bind(dataset.spec.to_string())
        .execute(self.conn())
        .await
        .map_err(|e| conflict_or_storage(e, "dataset", dataset.dataset_id.clone()))?;

        for variable in &dataset.variables {
            sqlx::query(
                r#"
                INSERT INTO variables (dataset_id, variable_id, variable_name, spec)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&dataset.dataset_id)
            .bind(&variable.variable_id)
            .bind(&variable.variable_name)
            .bind(variable.spec.to_string())
            .execute(self.conn())
            .await
            .map_err(|e| conflict_or_storage(e, "variable", variable.variable_id.clone()))?;
        }

        Ok(())
    }

    async fn create_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        sqlx::query("INSERT INTO bundles (bundle_id, bundle_name, spec) VALUES ($1, $2, $3)")
            .bind(&bundle.bundle_id)
            .bind(&bundle.bundle_name)
            .bind(bundle.spec.to_string())
            .execute(self.conn())
            .await
            .map_err(|e| conflict_or_storage(e, "bundle", bundle.bundle_id.clone()))?;

        for dataset_id in &bundle.dataset_ids {
            sqlx::query("INSERT INTO dataset_bundle (bundle_id, dataset_id) VALUES ($1, $2)")
                .bind(&bundle.bundle_id)
                .bind(dataset_id)
                .execute(self.conn())
                .await?;
        }

        Ok(())
    }

    async fn list_bundles(&mut self) -> Result<Vec<Bundle>> {
        let rows = sqlx::query("SELECT * FROM bundles ORDER BY bundle_id")
            .fetch_all(self.conn())
            .await?;

        let mut bundles = Vec::with_capacity(rows.len());
        for row in &rows {
            bundles.push(collect_bundle(self, row).await?);
        }
        Ok(bundles)
    }

    async fn list_datasets(&mut self) -> Result<Vec<DataSet>> {
        let rows = sqlx::query("SELECT * FROM datasets ORDER BY dataset_id")
            .fetch_all(self.conn())
            .await?;

        let mut datasets = Vec::with_capacity(rows.len());
        for row in &rows {
            datasets.push(collect_dataset(self, row).await?);
        }
        Ok(datasets)
    }

    async fn get_bundle(&mut self, bundle_id: &str) -> Result<Option<Bundle>> {
        let rows = sqlx::query("SELECT * FROM bundles WHERE bundle_id = $1")
            .bind(bundle_id)
            .fetch_all(self.conn())
            .await?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(collect_bundle(self, row).await?)),
            _ => Err(Error::Corrupt(format!("duplicate bundle rows for {bundle_id}"))),
        }
    }

    async fn get_dataset(&mut self, dataset_id: &str) -> Result<Option<DataSet>> {
        let rows = sqlx::query("SELECT * FROM datasets WHERE dataset_id = $1")
            .bind(dataset_id)
            .fetch_all(self.conn())
            .await?;

        match rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(collect_dataset(self, row).await?)),
            _ => Err(Error::Corrupt(format!(
                "duplicate dataset rows for {dataset_id}"
            ))),
        }
    }

    async fn dataset_end_dates(&mut self) -> Result<BTreeMap<String, Option<NaiveDate>>> {
        let rows = sqlx::query("SELECT dataset_id, end_date FROM datasets")
            .fetch_all(self.conn())
            .await?;

        let mut end_dates = BTreeMap::new();
        for row in rows {
            let dataset_id: String = row.try_get("dataset_id")?;
            let end_date = Store::decode_date(&row.try_get::<String, _>("end_date")?)?;
            end_dates.insert(dataset_id, end_date);
        }
        Ok(end_dates)
    }

    async fn update_dataset_end_date(
        &mut self,
        dataset_id: &str,
        end_date: Option<NaiveDate>,
    ) -> Result<()> {
        sqlx::query("UPDATE datasets SET end_date = $1 WHERE dataset_id = $2")
            .bind(Store::encode_date(end_date))
            .bind(dataset_id)
            .execute(self.conn())
            .await?;
        Ok(())
    }

    async fn remove_bundle(&mut self, bundle_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM bundles WHERE bundle_id = $1")
            .bind(bundle_id)
            .execute(self.conn())
            .await?;
        Ok(result.rows_affected())
    }
}

/// Rehydrate a bundle row, pulling in its dataset memberships.
async fn collect_bundle(tx: &mut Transaction, row: &PgRow) -> Result<Bundle> {
    let bundle_id: String = row.try_get("bundle_id")?;

    let dataset_ids: Vec<String> = sqlx::query_scalar(
        "SELECT dataset_id FROM dataset_bundle WHERE bundle_id = $1 ORDER BY dataset_id",
    )
    .bind(&bundle_id)
    .fetch_all(tx.conn())
    .await?;

    Ok(Bundle {
        bundle_id,
        bundle_name: row.try_get("bundle_name")?,
        spec: Store::decode_spec(&row.try_get::<String, _>("spec")?)?,
        dataset_ids,
        enabled: true,
    })
}

/// Rehydrate a dataset row, pulling in its variables.
async fn collect_dataset(tx: &mut Transaction, row: &PgRow) -> Result<DataSet> {
    let dataset_id: String = row.try_get("dataset_id")?;

    let variable_rows =
        sqlx::query("SELECT * FROM variables WHERE dataset_id = $1 ORDER BY variable_id")
            .bind(&dataset_id)
            .fetch_all(tx.conn())
            .await?;

    let mut variables = Vec::with_capacity(variable_rows.len());
    for v in variable_rows {
        variables.push(Variable {
            variable_id: v.try_get("variable_id")?,
            variable_name: v.try_get("variable_name")?,
            spec: Store::decode_spec(&v.try_get::<String, _>("spec")?)?,
        });
    }

    let start_date = Store::decode_date(&row.try_get::<String, _>("start_date")?)?
        .ok_or_else(|| Error::Corrupt(format!("dataset {dataset_id} has no start date")))?;

    Ok(DataSet {
        dataset_name: row.try_get("dataset_name")?,
        temporal_resolution: TemporalResolution::parse(
            &row.try_get::<String, _>("temporal_resolution")?,
        )?,
        spatial_resolution: SpatialResolution::parse(
            &row.try_get::<String, _>("spatial_resolution")?,
        )?,
        start_date,
        end_date: Store::decode_date(&row.try_get::<String, _>("end_date")?)?,
        location: row.try_get("location")?,
        spec: Store::decode_spec(&row.try_get::<String, _>("spec")?)?,
        variables,
        enabled: true,
        dataset_id,
    })
}
