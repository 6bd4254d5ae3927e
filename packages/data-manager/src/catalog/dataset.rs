//! Datasets and their variables.
//!
//! A dataset describes a catalog of files holding one measured phenomenon at
//! a fixed temporal and spatial resolution, together with the variables it
//! carries. Datasets are declared in YAML files whose filename stem supplies
//! the dataset id.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// Date format used for `start_date` in catalog files.
const CATALOG_DATE_FORMAT: &str = "%d-%m-%Y";

/// Resolution in time of a dataset's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalResolution {
    Daily,
    Pentad,
    Dekad,
    Monthly,
    Yearly,
}

impl TemporalResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalResolution::Daily => "daily",
            TemporalResolution::Pentad => "pentad",
            TemporalResolution::Dekad => "dekad",
            TemporalResolution::Monthly => "monthly",
            TemporalResolution::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(TemporalResolution::Daily),
            "pentad" => Ok(TemporalResolution::Pentad),
            "dekad" => Ok(TemporalResolution::Dekad),
            "monthly" => Ok(TemporalResolution::Monthly),
            "yearly" => Ok(TemporalResolution::Yearly),
            other => Err(Error::Catalog(format!(
                "invalid temporal resolution {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TemporalResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution in degrees of a dataset's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialResolution {
    Deg0_05,
    Deg0_1,
    Deg0_25,
    Deg0_5,
    Deg1,
}

impl SpatialResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpatialResolution::Deg0_05 => "0.05",
            SpatialResolution::Deg0_1 => "0.1",
            SpatialResolution::Deg0_25 => "0.25",
            SpatialResolution::Deg0_5 => "0.5",
            SpatialResolution::Deg1 => "1",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "0.05" => Ok(SpatialResolution::Deg0_05),
            "0.1" => Ok(SpatialResolution::Deg0_1),
            "0.25" => Ok(SpatialResolution::Deg0_25),
            "0.5" => Ok(SpatialResolution::Deg0_5),
            "1" => Ok(SpatialResolution::Deg1),
            other => Err(Error::Catalog(format!(
                "invalid spatial resolution {other:?}"
            ))),
        }
    }
}

impl fmt::Display for SpatialResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named measurement within a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub variable_id: String,
    pub variable_name: String,
    pub spec: JsonValue,
}

impl Variable {
    pub fn new(
        variable_id: impl Into<String>,
        variable_name: impl Into<String>,
        spec: JsonValue,
    ) -> Self {
        Self {
            variable_id: variable_id.into(),
            variable_name: variable_name.into(),
            spec,
        }
    }
}

/// A catalog of files holding one measured phenomenon.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSet {
    pub dataset_id: String,
    pub dataset_name: String,
    pub temporal_resolution: TemporalResolution,
    pub spatial_resolution: SpatialResolution,
    pub start_date: NaiveDate,
    /// Last date covered by the data, discovered dynamically; never set by
    /// the catalog files themselves.
    pub end_date: Option<NaiveDate>,
    /// Path template containing `{YEAR}` and optionally `{MONTH}`, `{DAY}`.
    pub location: String,
    pub spec: JsonValue,
    pub variables: Vec<Variable>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct VariableFile {
    name: String,
    #[serde(default = "empty_spec")]
    spec: JsonValue,
}

#[derive(Debug, Deserialize)]
struct DataSetFile {
    name: String,
    temporal_resolution: String,
    spatial_resolution: String,
    start_date: String,
    location: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "empty_spec")]
    spec: JsonValue,
    #[serde(default)]
    variables: BTreeMap<String, VariableFile>,
}

fn default_enabled() -> bool {
    true
}

pub(crate) fn empty_spec() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl DataSet {
    /// Parse a dataset declaration. `dataset_id` is the filename stem.
    pub fn from_yaml_str(dataset_id: &str, yaml: &str) -> Result<Self> {
        let file: DataSetFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Catalog(format!("dataset {dataset_id}: {e}")))?;

        if file.location.is_empty() {
            return Err(Error::Catalog(format!(
                "dataset {dataset_id}: location must not be empty"
            )));
        }

        let start_date = NaiveDate::parse_from_str(&file.start_date, CATALOG_DATE_FORMAT)
            .map_err(|e| Error::Catalog(format!("dataset {dataset_id}: start_date: {e}")))?;

        let variables = file
            .variables
            .into_iter()
            .map(|(id, v)| Variable::new(id, v.name, v.spec))
            .collect();

        Ok(Self {
            dataset_id: dataset_id.to_string(),
            dataset_name: file.name,
            temporal_resolution: TemporalResolution::parse(&file.temporal_resolution)?,
            spatial_resolution: SpatialResolution::parse(&file.spatial_resolution)?,
            start_date,
            end_date: None,
            location: file.location,
            spec: file.spec,
            variables,
            enabled: file.enabled,
        })
    }

    /// Load a single dataset file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let dataset_id = file_stem(path)?;
        let yaml = fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&dataset_id, &yaml)
    }

    /// Load every `*.yaml` file in a directory.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        load_yaml_dir(dir, Self::load_file)
    }
}

/// Filename stem of a catalog file, used as the entity id.
pub(crate) fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Catalog(format!("unusable catalog filename {}", path.display())))
}

/// Apply `load` to every `*.yaml` file in `dir`, in filename order.
pub(crate) fn load_yaml_dir<T>(dir: &Path, load: impl Fn(&Path) -> Result<T>) -> Result<Vec<T>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Catalog(format!("cannot read directory {}: {e}", dir.display())))?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    paths.sort();

    paths.iter().map(|p| load(p)).collect()
}
