//! Bundles: user-facing groupings of datasets.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::dataset::{empty_spec, file_stem, load_yaml_dir};
use crate::error::{Error, Result};

/// A named grouping of datasets with a geographic bounding box.
///
/// The bounding box lives under `spec.bounds.{minx,miny,maxx,maxy}`; task
/// materialisation falls back to the whole globe when it is absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub bundle_id: String,
    pub bundle_name: String,
    pub spec: JsonValue,
    pub dataset_ids: Vec<String>,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct BundleFile {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "empty_spec")]
    spec: JsonValue,
    #[serde(default)]
    datasets: Vec<String>,
    minx: Option<f64>,
    miny: Option<f64>,
    maxx: Option<f64>,
    maxy: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl Bundle {
    /// Parse a bundle declaration. `bundle_id` is the filename stem.
    ///
    /// Top-level `minx`/`miny`/`maxx`/`maxy` keys are folded into
    /// `spec.bounds` so consumers read the bounding box from one place.
    pub fn from_yaml_str(bundle_id: &str, yaml: &str) -> Result<Self> {
        let file: BundleFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Catalog(format!("bundle {bundle_id}: {e}")))?;

        let mut spec = file.spec;
        if !spec.is_object() {
            return Err(Error::Catalog(format!(
                "bundle {bundle_id}: spec must be a mapping"
            )));
        }
        let corners = [
            ("minx", file.minx),
            ("miny", file.miny),
            ("maxx", file.maxx),
            ("maxy", file.maxy),
        ];
        for (key, value) in corners {
            if let Some(value) = value {
                spec["bounds"][key] = json!(value);
            }
        }

        Ok(Self {
            bundle_id: bundle_id.to_string(),
            bundle_name: file.name,
            spec,
            dataset_ids: file.datasets,
            enabled: file.enabled,
        })
    }

    /// Load a single bundle file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let bundle_id = file_stem(path)?;
        let yaml = fs::read_to_string(path)
            .map_err(|e| Error::Catalog(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&bundle_id, &yaml)
    }

    /// Load every `*.yaml` file in a directory.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        load_yaml_dir(dir, Self::load_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OCEAN_YAML: &str = r#"
name: "Ocean Data Bundle"
spec:
  key1: "value"
datasets:
  - "sst"
  - "oc"
minx: -25.0
miny: 40.0
maxx: 15.0
maxy: 65.0
"#;

    #[test]
    fn bundle_loads_from_yaml() {
        let b = Bundle::from_yaml_str("ocean", OCEAN_YAML).unwrap();
        assert_eq!(b.bundle_id, "ocean");
        assert_eq!(b.bundle_name, "Ocean Data Bundle");
        assert_eq!(b.dataset_ids, vec!["sst", "oc"]);
        assert_eq!(b.spec["key1"], "value");
        assert!(b.enabled);
    }

    #[test]
    fn corner_keys_fold_into_spec_bounds() {
        let b = Bundle::from_yaml_str("ocean", OCEAN_YAML).unwrap();
        assert_eq!(b.spec["bounds"]["minx"], json!(-25.0));
        assert_eq!(b.spec["bounds"]["miny"], json!(40.0));
        assert_eq!(b.spec["bounds"]["maxx"], json!(15.0));
        assert_eq!(b.spec["bounds"]["maxy"], json!(65.0));
    }

    #[test]
    fn bundle_without_corners_has_no_bounds() {
        let b = Bundle::from_yaml_str("plain", "name: \"Plain\"\n").unwrap();
        assert!(b.spec.get("bounds").is_none());
        assert!(b.dataset_ids.is_empty());
    }
}
