//! Catalog rebuilds over a populated artifact store.

use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use treewatch_core::{
    verify_url_signature, ArtifactKey, ArtifactStore, Catalog, CatalogRefresher, FsArtifactStore, IntervalRecord,
    IntervalRegistry, IntervalTable, ProductLevel, Settings,
};
use treewatch_raster::TileId;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn registry() -> Arc<IntervalRegistry> {
    let table = IntervalTable::new(vec![
        IntervalRecord { id: 1, end_date: date(2024, 1, 1) },
        IntervalRecord { id: 2, end_date: date(2024, 1, 17) },
        IntervalRecord { id: 3, end_date: date(2024, 2, 2) },
    ])
    .unwrap();
    Arc::new(IntervalRegistry::from_table(table))
}

fn tile() -> TileId {
    TileId::parse("105W_40N").unwrap()
}

fn populated_store(dir: &std::path::Path) -> Arc<FsArtifactStore> {
    let store = Arc::new(FsArtifactStore::new(dir, "https://tiles.example.org", Some("secret".to_string())).unwrap());
    for interval in [1, 2, 3] {
        for level in [ProductLevel::Raw, ProductLevel::Composite, ProductLevel::Change] {
            store.put(&ArtifactKey::new(tile(), interval, level), b"tif").unwrap();
        }
    }
    // Raw only: not listed
    let raw_only = TileId::parse("012E_05S").unwrap();
    store.put(&ArtifactKey::new(raw_only, 2, ProductLevel::Raw), b"tif").unwrap();
    // Interval unknown to the registry: skipped
    store.put(&ArtifactKey::new(tile(), 99, ProductLevel::Composite), b"tif").unwrap();
    store
}

fn catalog(store: Arc<FsArtifactStore>) -> Catalog {
    Catalog::new(
        store,
        registry(),
        "https://tiles.example.org",
        Duration::from_secs(3600),
        vec!["GLAD ARD".to_string()],
    )
}

#[test]
fn test_rebuild_lists_derived_products() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(populated_store(dir.path()));
    assert_eq!(catalog.snapshot().tile_count(), 0);

    let snapshot = catalog.rebuild().unwrap();
    assert_eq!(snapshot.tile_count(), 1);
    let entries = &snapshot.tiles[&tile()];
    assert_eq!(entries.iter().map(|e| e.interval_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(entries[1].date, date(2024, 1, 17));

    let url = entries[1].change_url.as_deref().expect("change url");
    assert!(url.starts_with("https://tiles.example.org/105W_40N/2/change.tif?expires="));
    let (path, query) = url.trim_start_matches("https://tiles.example.org").split_once('?').unwrap();
    let params: Vec<(&str, &str)> = query.split('&').filter_map(|kv| kv.split_once('=')).collect();
    let expires: u64 = params[0].1.parse().unwrap();
    assert!(verify_url_signature("secret", path, expires, params[1].1, expires - 1));

    assert_eq!(snapshot.bounds[&tile()], tile().bounds());
    assert_eq!(snapshot.attributions, vec!["GLAD ARD".to_string()]);
}

#[test]
fn test_select_after_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog(populated_store(dir.path()));
    catalog.rebuild().unwrap();

    let selected = catalog.select(date(2024, 1, 20));
    assert_eq!(selected.tiles[&tile()].len(), 1);
    assert_eq!(selected.tiles[&tile()][0].date, date(2024, 1, 17));
}

#[test]
fn test_readers_keep_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = populated_store(dir.path());
    let catalog = catalog(store.clone());
    let before = catalog.rebuild().unwrap();

    store.delete_all(&tile(), 3).unwrap();
    let after = catalog.rebuild().unwrap();

    assert_eq!(before.tiles[&tile()].len(), 3);
    assert_eq!(after.tiles[&tile()].len(), 2);
    assert_eq!(catalog.snapshot().tiles[&tile()].len(), 2);
}

#[test]
fn test_failed_rebuild_keeps_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let catalog = catalog(populated_store(&root));
    let before = catalog.rebuild().unwrap();

    // Store root replaced by a file: listing fails
    std::fs::remove_dir_all(&root).unwrap();
    std::fs::write(&root, b"not a directory").unwrap();
    assert!(catalog.rebuild().is_err());
    assert!(Arc::ptr_eq(&catalog.snapshot(), &before));
}

#[test]
fn test_rebuild_with_default_settings() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.store.root = dir.path().join("store");
    assert!(settings.store.signing_key.is_none());

    let store = Arc::new(
        FsArtifactStore::new(&settings.store.root, settings.store.public_base_url.clone(), None).unwrap(),
    );
    store.put(&ArtifactKey::new(tile(), 2, ProductLevel::Composite), b"tif").unwrap();
    let catalog = Catalog::new(
        store,
        registry(),
        settings.store.public_base_url.clone(),
        Duration::from_secs(settings.store.url_ttl_secs),
        settings.catalog.attributions.clone(),
    );

    let snapshot = catalog.rebuild().unwrap();
    let entry = &snapshot.tiles[&tile()][0];
    let base = settings.store.public_base_url.trim_end_matches('/');
    assert_eq!(entry.composite_url.as_deref(), Some(format!("{}/105W_40N/2/composite.tif", base).as_str()));
    assert!(entry.change_url.is_none());
}

#[test]
fn test_refresher_builds_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(catalog(populated_store(dir.path())));

    let refresher = CatalogRefresher::start(Arc::clone(&catalog), Duration::from_secs(3600));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while catalog.snapshot().tile_count() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(catalog.snapshot().tile_count(), 1);

    // Returns promptly even though the next rebuild is an hour away
    let stopping = std::time::Instant::now();
    refresher.stop();
    assert!(stopping.elapsed() < Duration::from_secs(1));
}
