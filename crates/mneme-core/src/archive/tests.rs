
    use super::*;
    use crate::thread::Message;
    use tempfile::TempDir;

    async fn create_sqlite_store() -> (SqliteArchivalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test_threads.db");
        let store = SqliteArchivalStore::new(&db_path).await.unwrap();
        (store, temp_dir)
    }

    fn thread_with(id: &str, count: usize) -> Thread {
        let mut thread = Thread::new(id);
        thread.append((0..count).map(|i| Message::user(format!("msg {}", i))));
        thread
    }

    async fn exercise_basic_operations(store: &dyn ArchivalStore) {
        assert!(store.get("t1").await.unwrap().is_none());

        let thread = thread_with("t1", 3);
        store.put(&thread).await.unwrap();

        let loaded = store.get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.thread, thread);

        let mut newer = thread.clone();
        newer.append(vec![Message::assistant("more")]);
        newer.merge_count = 1;
        store.put(&newer).await.unwrap();
        assert_eq!(store.get("t1").await.unwrap().unwrap().thread.message_count(), 4);

        store.put(&thread_with("t2", 0)).await.unwrap();
        let mut ids = store.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);

        assert!(store.delete("t1").await.unwrap());
        assert!(!store.delete("t1").await.unwrap());
        assert!(store.get("t1").await.unwrap().is_none());
    }

    async fn exercise_idempotent_put(store: &dyn ArchivalStore) {
        let thread = thread_with("idem", 2);
        let first = store.put(&thread).await.unwrap();
        let second = store.put(&thread).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get("idem").await.unwrap().unwrap(), first);
    }

    async fn exercise_merge_count_regression(store: &dyn ArchivalStore) {
        let mut thread = thread_with("conflict", 2);
        thread.merge_count = 3;
        store.put(&thread).await.unwrap();

        let mut stale = thread.clone();
        stale.merge_count = 2;
        let err = store.put(&stale).await.unwrap_err();
        assert!(matches!(err, Error::WriteConflict { .. }));
        assert_eq!(
            store.get("conflict").await.unwrap().unwrap().thread.merge_count,
            3
        );
    }

    #[tokio::test]
    async fn test_memory_archive_basic_operations() {
        exercise_basic_operations(&MemoryArchivalStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_archive_idempotent_put() {
        let store = MemoryArchivalStore::new();
        exercise_idempotent_put(&store).await;
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_archive_rejects_merge_count_regression() {
        exercise_merge_count_regression(&MemoryArchivalStore::new()).await;
    }

    #[tokio::test]
    async fn test_memory_archive_failure_injection() {
        let store = MemoryArchivalStore::new();
        store.fail_next(2);
        let thread = thread_with("t1", 1);

        assert!(store.put(&thread).await.unwrap_err().is_retryable());
        assert!(store.get("t1").await.unwrap_err().is_retryable());
        store.put(&thread).await.unwrap();

        store.set_available(false);
        assert!(store.get("t1").await.is_err());
        store.set_available(true);
        assert!(store.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_archive_basic_operations() {
        let (store, _temp) = create_sqlite_store().await;
        exercise_basic_operations(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_archive_idempotent_put() {
        let (store, _temp) = create_sqlite_store().await;
        exercise_idempotent_put(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_archive_rejects_merge_count_regression() {
        let (store, _temp) = create_sqlite_store().await;
        exercise_merge_count_regression(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_archive_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("reopen.db");
        let thread = thread_with("durable", 5);

        {
            let store = SqliteArchivalStore::new(&db_path).await.unwrap();
            store.put(&thread).await.unwrap();
            store.close().await;
        }

        let store = SqliteArchivalStore::new(&db_path).await.unwrap();
        let loaded = store.get("durable").await.unwrap().unwrap();
        assert_eq!(loaded.thread, thread);
    }

    #[tokio::test]
    async fn test_sqlite_closed_pool_is_unavailable() {
        let (store, _temp) = create_sqlite_store().await;
        assert!(store.health_check().await.unwrap());
        store.close().await;

        let err = store.get("t1").await.unwrap_err();
        assert!(err.is_unavailable(crate::error::StoreKind::Archive));
    }

    #[tokio::test]
    async fn test_backend_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = ArchiveConfig {
            backend: "sqlite".to_string(),
            sqlite_path: temp_dir
                .path()
                .join("config_test.db")
                .to_string_lossy()
                .to_string(),
        };
        let backend = ArchiveBackend::from_config(&config).await.unwrap();
        assert!(matches!(backend, ArchiveBackend::Sqlite(_)));
        backend.put(&thread_with("t1", 1)).await.unwrap();
        assert!(backend.get("t1").await.unwrap().is_some());

        let config = ArchiveConfig {
            backend: "tape".to_string(),
            ..ArchiveConfig::default()
        };
        assert!(ArchiveBackend::from_config(&config).await.is_err());
    }
