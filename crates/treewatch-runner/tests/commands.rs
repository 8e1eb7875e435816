//! Commands against a store and ledger in a scratch directory.

use treewatch_core::{ArtifactKey, ArtifactStore, InvalidImageLedger, ProductLevel, Settings, TileParamStore};
use treewatch_raster::TileId;
use treewatch_runner::commands::{catalog, delete, params};
use treewatch_runner::context::Components;
use treewatch_runner::OutputFormat;

fn components(dir: &std::path::Path) -> Components {
    let mut settings = Settings::default();
    settings.store.root = dir.join("artifacts");
    settings.store.signing_key = Some("secret".to_string());
    settings.ledger.path = dir.join("ledger.sqlite");
    settings.source.staging_dir = dir.join("staging");
    settings.registry.first_year = 2023;
    settings.registry.last_year = Some(2024);
    Components::open(settings).unwrap()
}

fn tile() -> TileId {
    TileId::parse("105W_40N").unwrap()
}

#[test]
fn test_delete_removes_every_interval() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(dir.path());
    for interval in [1000, 1001] {
        for level in ProductLevel::ALL {
            c.store.put(&ArtifactKey::new(tile(), interval, level), b"tif").unwrap();
        }
    }
    let other = TileId::parse("012E_05S").unwrap();
    c.store.put(&ArtifactKey::new(other.clone(), 1000, ProductLevel::Raw), b"tif").unwrap();
    c.ledger.record(&tile(), 1002, "below threshold", 0.1).unwrap();

    let args = delete::DeleteArgs {
        tile: tile(),
        forget_rejections: false,
    };
    delete::execute(args, &c, OutputFormat::Text).unwrap();

    assert!(c.store.list_intervals(&tile()).unwrap().is_empty());
    assert_eq!(c.store.list_intervals(&other).unwrap(), vec![1000]);
    assert!(c.ledger.lookup(&tile(), 1002).unwrap().is_some());

    let args = delete::DeleteArgs {
        tile: tile(),
        forget_rejections: true,
    };
    delete::execute(args, &c, OutputFormat::Json).unwrap();
    assert!(c.ledger.lookup(&tile(), 1002).unwrap().is_none());
}

#[test]
fn test_params_set_keeps_unset_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(dir.path());

    let args = params::ParamsArgs {
        action: params::ParamsAction::Set {
            tile: tile(),
            min_valid_fraction: None,
            cut_threshold: Some(0.4),
            tree_lower_bound: None,
        },
    };
    params::execute(args, &c, OutputFormat::Text).unwrap();

    let change = c.ledger.change_params(&tile()).unwrap().expect("override stored");
    assert_eq!(change.cut_threshold, 0.4);
    assert_eq!(change.tree_lower_bound, 0.7);
    assert_eq!(c.ledger.min_valid_fraction(&tile()).unwrap(), None);

    let args = params::ParamsArgs {
        action: params::ParamsAction::Clear { tile: tile() },
    };
    params::execute(args, &c, OutputFormat::Text).unwrap();
    assert_eq!(c.ledger.change_params(&tile()).unwrap(), None);
}

#[test]
fn test_params_rejects_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(dir.path());
    let args = params::ParamsArgs {
        action: params::ParamsAction::Set {
            tile: tile(),
            min_valid_fraction: Some(1.5),
            cut_threshold: None,
            tree_lower_bound: None,
        },
    };
    assert!(params::execute(args, &c, OutputFormat::Text).is_err());
    assert_eq!(c.ledger.min_valid_fraction(&tile()).unwrap(), None);
}

#[test]
fn test_catalog_lists_derived_products() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(dir.path());
    let registry = c.registry(chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()).unwrap();
    let (ids, _) = registry.resolve();
    c.store.put(&ArtifactKey::new(tile(), ids[3], ProductLevel::Change), b"tif").unwrap();

    let args = catalog::CatalogArgs { date: None };
    catalog::execute(args, &c, OutputFormat::Json).unwrap();

    let catalog = c.catalog(std::sync::Arc::new(registry));
    let snapshot = catalog.rebuild().unwrap();
    assert_eq!(snapshot.tiles[&tile()][0].interval_id, ids[3]);
}
