use railgun::postgres::LogPosition;
use railgun::{CheckpointStore, FileCheckpointStore};
use tempfile::TempDir;

#[tokio::test]
async fn test_checkpoint_survives_restart() {
    let temp_dir = TempDir::new().unwrap();

    // First run
    {
        let store = FileCheckpointStore::open(temp_dir.path()).await.unwrap();
        assert!(store.load("orders").await.unwrap().is_none());
        assert!(store.advance("orders", LogPosition::new(0x16B3748)).await.unwrap());
    }

    // Restart
    {
        let store = FileCheckpointStore::open(temp_dir.path()).await.unwrap();
        let loaded = store
            .load("orders")
            .await
            .unwrap()
            .expect("Should recover checkpoint");
        assert_eq!(loaded.confirmed_position, LogPosition::new(0x16B3748));
        assert_eq!(loaded.slot_name, "orders");

        assert!(store.advance("orders", LogPosition::new(0x16B3800)).await.unwrap());
    }

    let store = FileCheckpointStore::open(temp_dir.path()).await.unwrap();
    let loaded = store.load("orders").await.unwrap().unwrap();
    assert_eq!(loaded.confirmed_position, LogPosition::new(0x16B3800));
}

#[tokio::test]
async fn test_checkpoint_never_moves_backwards_across_restart() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::open(temp_dir.path()).await.unwrap();
    store.advance("orders", LogPosition::new(500)).await.unwrap();
    drop(store);

    let store = FileCheckpointStore::open(temp_dir.path()).await.unwrap();
    assert!(!store.advance("orders", LogPosition::new(400)).await.unwrap());
    assert!(!store.advance("orders", LogPosition::new(500)).await.unwrap());
    assert_eq!(
        store.load("orders").await.unwrap().unwrap().confirmed_position,
        LogPosition::new(500)
    );
}

#[tokio::test]
async fn test_concurrent_advances_keep_the_highest() {
    let temp_dir = TempDir::new().unwrap();
    let store = std::sync::Arc::new(FileCheckpointStore::open(temp_dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for i in 1..=20u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.advance("orders", LogPosition::new(i * 100)).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let loaded = store.load("orders").await.unwrap().unwrap();
    assert_eq!(loaded.confirmed_position, LogPosition::new(2000));

    // No temporary files left behind.
    let mut entries = tokio::fs::read_dir(temp_dir.path()).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["orders.checkpoint.json".to_string()]);
}

#[tokio::test]
async fn test_reset_forgets_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileCheckpointStore::open(temp_dir.path()).await.unwrap();
    store.advance("orders", LogPosition::new(42)).await.unwrap();
    store.reset("orders").await.unwrap();
    assert!(store.load("orders").await.unwrap().is_none());

    // Resetting twice is fine.
    store.reset("orders").await.unwrap();
    assert!(store.advance("orders", LogPosition::new(1)).await.unwrap());
}
