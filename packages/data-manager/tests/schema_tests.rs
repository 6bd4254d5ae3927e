//! Integration tests for catalog persistence: populate, rehydration,
//! end-date preservation and the schema version gate.

mod common;

use chrono::NaiveDate;
use common::TestHarness;
use data_manager::catalog::{Bundle, DataSet, SchemaOperations};
use data_manager::{Error, Store};
use test_context::test_context;

/// Sort a bundle's dataset ids so entities loaded from files compare equal to
/// entities rehydrated from the database, which orders memberships by id.
fn normalized(mut bundles: Vec<Bundle>) -> Vec<Bundle> {
    for bundle in &mut bundles {
        bundle.dataset_ids.sort();
    }
    bundles.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
    bundles
}

#[test_context(TestHarness)]
#[tokio::test]
async fn populate_round_trips_the_catalog(ctx: &TestHarness) {
    ctx.populate_catalog().await.expect("populate failed");

    let mut tx = ctx.store.begin().await.unwrap();
    let stored_bundles = tx.list_bundles().await.unwrap();
    let stored_datasets = tx.list_datasets().await.unwrap();
    tx.commit().await.unwrap();

    // Compare with the entities loaded directly from the fixture files,
    // restricted to the enabled ones that populate persists.
    let schema_dir = TestHarness::schema_dir();
    let mut file_datasets: Vec<DataSet> = DataSet::load_dir(&schema_dir.join("datasets"))
        .unwrap()
        .into_iter()
        .filter(|d| d.enabled)
        .collect();
    file_datasets.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
    let file_bundles: Vec<Bundle> = Bundle::load_dir(&schema_dir.join("bundles"))
        .unwrap()
        .into_iter()
        .filter(|b| b.enabled)
        .collect();

    assert_eq!(stored_datasets, file_datasets);
    assert_eq!(normalized(stored_bundles), normalized(file_bundles));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn disabled_datasets_are_not_persisted(ctx: &TestHarness) {
    ctx.populate_catalog().await.expect("populate failed");

    let mut tx = ctx.store.begin().await.unwrap();
    assert!(tx.get_dataset("seaice").await.unwrap().is_none());
    assert_eq!(tx.list_datasets().await.unwrap().len(), 2);
    tx.commit().await.unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn end_dates_survive_a_repopulate(ctx: &TestHarness) {
    ctx.populate_catalog().await.expect("populate failed");

    let end_date = NaiveDate::from_ymd_opt(2022, 12, 31).unwrap();
    let mut tx = ctx.store.begin().await.unwrap();
    tx.update_dataset_end_date("sst", Some(end_date)).await.unwrap();
    tx.commit().await.unwrap();

    // A declarative reload clears the tables, but the dynamically discovered
    // end date must come back for datasets that still exist.
    ctx.populate_catalog().await.expect("repopulate failed");

    let mut tx = ctx.store.begin().await.unwrap();
    let sst = tx.get_dataset("sst").await.unwrap().expect("sst missing");
    let oc = tx.get_dataset("oc").await.unwrap().expect("oc missing");
    tx.commit().await.unwrap();

    assert_eq!(sst.end_date, Some(end_date));
    assert_eq!(oc.end_date, None);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn get_bundle_rehydrates_memberships(ctx: &TestHarness) {
    ctx.populate_catalog().await.expect("populate failed");

    let mut tx = ctx.store.begin().await.unwrap();
    let bundle = tx.get_bundle("ocean").await.unwrap().expect("ocean missing");
    assert_eq!(bundle.bundle_name, "Ocean Data Bundle");
    assert_eq!(bundle.dataset_ids, vec!["oc", "sst"]);
    assert_eq!(bundle.spec["bounds"]["minx"], -25.0);

    assert!(tx.get_bundle("atmosphere").await.unwrap().is_none());
    tx.commit().await.unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn removing_a_bundle_leaves_its_datasets(ctx: &TestHarness) {
    ctx.populate_catalog().await.expect("populate failed");

    let mut tx = ctx.store.begin().await.unwrap();
    assert_eq!(tx.remove_bundle("ocean").await.unwrap(), 1);
    assert!(tx.get_bundle("ocean").await.unwrap().is_none());
    assert_eq!(tx.list_datasets().await.unwrap().len(), 2);
    tx.commit().await.unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
async fn dataset_end_dates_snapshot_covers_every_dataset(ctx: &TestHarness) {
    ctx.populate_catalog().await.expect("populate failed");

    let end_date = NaiveDate::from_ymd_opt(2020, 6, 30).unwrap();
    let mut tx = ctx.store.begin().await.unwrap();
    tx.update_dataset_end_date("oc", Some(end_date)).await.unwrap();
    let snapshot = tx.dataset_end_dates().await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["oc"], Some(end_date));
    assert_eq!(snapshot["sst"], None);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn mismatched_schema_version_fails_startup(ctx: &TestHarness) {
    sqlx::query("UPDATE metadata SET schema = 'V0'")
        .execute(ctx.store.pool())
        .await
        .unwrap();

    let err = Store::open(&ctx.config.database_url).await.unwrap_err();
    assert!(matches!(err, Error::SchemaVersion { .. }), "got {err:?}");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicated_metadata_fails_startup(ctx: &TestHarness) {
    sqlx::query("INSERT INTO metadata (schema, creation_date) VALUES ('V1', '2024/01/01 00:00:00')")
        .execute(ctx.store.pool())
        .await
        .unwrap();

    let err = Store::open(&ctx.config.database_url).await.unwrap_err();
    assert!(matches!(err, Error::MetadataCorrupted), "got {err:?}");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn reopening_a_healthy_database_succeeds(ctx: &TestHarness) {
    // Second open must verify the existing metadata rather than re-insert.
    let reopened = Store::open(&ctx.config.database_url).await;
    assert!(reopened.is_ok());
}

#[test]
fn fixture_dataset_loads_with_all_fields() {
    let path = TestHarness::schema_dir().join("datasets/sst.yaml");
    let dataset = DataSet::load_file(&path).unwrap();

    assert_eq!(dataset.dataset_id, "sst");
    assert_eq!(dataset.dataset_name, "Sea Surface Temperatures");
    assert_eq!(dataset.start_date, NaiveDate::from_ymd_opt(1981, 9, 1).unwrap());
    assert_eq!(dataset.end_date, None);
    assert_eq!(dataset.location, "/data/sst/{YEAR}/*.nc");
    assert_eq!(dataset.variables.len(), 2);
    assert_eq!(dataset.variables[0].variable_id, "sst");
    assert_eq!(dataset.variables[1].spec["units"], "kelvin");
}

#[test]
fn fixture_bundle_loads_with_bounds_in_spec() {
    let path = TestHarness::schema_dir().join("bundles/ocean.yaml");
    let bundle = Bundle::load_file(&path).unwrap();

    assert_eq!(bundle.bundle_id, "ocean");
    assert_eq!(bundle.dataset_ids, vec!["sst", "oc"]);
    assert_eq!(bundle.spec["key1"], "value");
    assert_eq!(bundle.spec["bounds"]["maxy"], 65.0);
}
