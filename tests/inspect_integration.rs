//! Integration tests for metadata inspection over a populated cache

use std::sync::Arc;

use blockcache::cache::{Cache, CacheConfig, InMemorySource, LocalFsStore};
use blockcache::inspect::{resolve_inspect_path, Inspector};

async fn populate(root: &std::path::Path) {
    let config = CacheConfig {
        local_root: root.to_path_buf(),
        block_size: 1000,
        buffer_size: 100,
        ..Default::default()
    };
    let cache = Cache::new(config, Arc::new(LocalFsStore::new(root))).unwrap();
    let file = cache
        .attach(Arc::new(InMemorySource::new(
            "root://server//store/run1/events.root",
            vec![7u8; 1500],
        )))
        .unwrap();
    let mut buf = vec![0u8; 1500];
    assert_eq!(file.read(&mut buf, 0).await.unwrap(), 1500);
    file.detach().await;
}

#[tokio::test]
async fn test_inspect_populated_cache_tree() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path()).await;

    let mut inspector = Inspector::new(Vec::new(), true);
    let summary = inspector.inspect(dir.path()).unwrap();
    assert_eq!(summary.records, 2);
    assert_eq!(summary.complete, 2);
    assert_eq!(summary.errors, 0);

    let text = String::from_utf8(inspector.into_inner()).unwrap();
    assert!(text.contains("events.root___1000_0.cinfo"));
    assert!(text.contains("events.root___1000_1000.cinfo"));
    assert!(text.contains("version == 1, bufferSize 100 nBlocks 10 nDownloaded 10 complete"));
    assert!(text.contains("version == 1, bufferSize 100 nBlocks 5 nDownloaded 5 complete"));
    assert!(text.contains("printing 5 blocks:\nx x x x x\n"));
    assert_eq!(text.matches("access 0 >> [").count(), 2);
    assert!(!text.contains("access 1 >>"));
}

#[tokio::test]
async fn test_inspect_root_url_resolves_under_cache_root() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path()).await;

    let target = resolve_inspect_path(
        "root://store/run1/events.root___1000_1000.cinfo",
        Some(dir.path()),
    )
    .unwrap();
    let mut inspector = Inspector::new(Vec::new(), false);
    let summary = inspector.inspect(&target).unwrap();
    assert_eq!(summary.records, 1);

    let text = String::from_utf8(inspector.into_inner()).unwrap();
    assert!(text.contains("nBlocks 5 nDownloaded 5 complete"));
    assert!(text.contains("bytesMissed="));
}
