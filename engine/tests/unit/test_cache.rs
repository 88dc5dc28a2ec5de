//! Dependency cache tests

use std::sync::Arc;
use std::time::Duration;

use shipyard::cache::dependency::{manifest_digest, CacheLimits, DependencyCache};
use shipyard::filesys::dir::Dir;

async fn installed_tree(root: &std::path::Path, marker: &str) -> Dir {
    let dir = Dir::new(root.join(format!("node_modules-{}", marker)));
    dir.subdir("left-pad").create().await.unwrap();
    dir.subdir("left-pad")
        .file("index.js")
        .write_bytes(format!("module.exports = '{}';", marker).as_bytes())
        .await
        .unwrap();
    dir
}

#[tokio::test]
async fn test_miss_then_hit() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = DependencyCache::open(Dir::new(tmp.path().join("cache")))
        .await
        .unwrap();
    let restore_to = tmp.path().join("restored");

    assert!(!cache.restore("d1", &restore_to).await.unwrap());

    let tree = installed_tree(tmp.path(), "a").await;
    let entry = cache.put("d1", &tree).await.unwrap();
    assert!(entry.size > 0);

    assert!(cache.restore("d1", &restore_to).await.unwrap());
    let restored = tokio::fs::read_to_string(restore_to.join("left-pad/index.js"))
        .await
        .unwrap();
    assert_eq!(restored, "module.exports = 'a';");
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let root = Dir::new(tmp.path().join("cache"));
    {
        let cache = DependencyCache::open(root.clone()).await.unwrap();
        let tree = installed_tree(tmp.path(), "a").await;
        cache.put("d1", &tree).await.unwrap();
    }
    let reopened = DependencyCache::open(root).await.unwrap();
    assert!(reopened.get("d1").is_some());
    assert_eq!(reopened.len(), 1);
}

#[tokio::test]
async fn test_concurrent_populate_keeps_one_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        DependencyCache::open(Dir::new(tmp.path().join("cache")))
            .await
            .unwrap(),
    );
    let first = installed_tree(tmp.path(), "a").await;
    let second = installed_tree(tmp.path(), "b").await;

    let (a, b) = tokio::join!(cache.put("same", &first), cache.put("same", &second));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    assert_eq!(cache.len(), 1);

    // no staging directories are left behind
    let leftovers = Dir::new(tmp.path().join("cache")).list_dirs().await.unwrap();
    assert_eq!(leftovers.len(), 1);
}

#[tokio::test]
async fn test_evict_by_count() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = DependencyCache::open(Dir::new(tmp.path().join("cache")))
        .await
        .unwrap();
    for digest in ["d1", "d2", "d3"] {
        let tree = installed_tree(tmp.path(), digest).await;
        cache.put(digest, &tree).await.unwrap();
    }

    let evicted = cache
        .evict(&CacheLimits {
            max_entries: 2,
            max_bytes: u64::MAX,
            max_age: Duration::from_secs(3600),
        })
        .await
        .unwrap();
    assert_eq!(evicted.len(), 1);
    assert_eq!(cache.len(), 2);
    assert!(!tmp.path().join("cache").join(&evicted[0]).exists());
}

#[tokio::test]
async fn test_manifest_digest_tracks_contents() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = Dir::new(tmp.path());
    let names = vec!["package-lock.json".to_string(), "yarn.lock".to_string()];

    assert_eq!(manifest_digest(&dir, &names).await.unwrap(), None);

    dir.file("package-lock.json").write_bytes(b"{\"v\":1}").await.unwrap();
    let first = manifest_digest(&dir, &names).await.unwrap().unwrap();
    assert_eq!(manifest_digest(&dir, &names).await.unwrap().unwrap(), first);

    dir.file("package-lock.json").write_bytes(b"{\"v\":2}").await.unwrap();
    let second = manifest_digest(&dir, &names).await.unwrap().unwrap();
    assert_ne!(first, second);
}
