
    use super::*;
    use crate::archive::MemoryArchivalStore;
    use crate::cache::{MemoryCacheStore, MockCacheStore};
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        cache: Arc<MemoryCacheStore>,
        archive: Arc<MemoryArchivalStore>,
        coordinator: SessionCoordinator,
    }

    fn fast_config() -> MemoryConfig {
        let mut config = MemoryConfig::default();
        config.write_back.retry_initial_delay_ms = 5;
        config.write_back.retry_max_delay_ms = 20;
        config.write_back.retry_max_attempts = 4;
        config
    }

    fn harness_with(config: MemoryConfig) -> Harness {
        let cache = Arc::new(MemoryCacheStore::new());
        let archive = Arc::new(MemoryArchivalStore::new());
        let coordinator = SessionCoordinator::new(cache.clone(), archive.clone(), &config).unwrap();
        Harness {
            cache,
            archive,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(fast_config())
    }

    fn thread_with(id: &str, count: usize) -> Thread {
        let mut thread = Thread::new(id);
        thread.append((0..count).map(|i| Message::user(format!("msg {}", i))));
        thread
    }

    fn contents(thread: &Thread) -> Vec<String> {
        thread.messages.iter().map(|m| m.content.clone()).collect()
    }

    #[tokio::test]
    async fn test_new_thread_is_created_empty() {
        let h = harness();

        let thread = assert_ok!(h.coordinator.resolve_or_create(Some("t1")).await);

        assert_eq!(thread.id, "t1");
        assert!(thread.messages.is_empty());
        assert_eq!(thread.merge_count, 0);
        assert!(h.cache.get("t1").await.unwrap().is_some());
        assert!(h.archive.get("t1").await.unwrap().is_none());
        assert!(h.coordinator.scheduler().is_scheduled("t1"));
        assert_eq!(h.coordinator.list_active(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_id_generates_one() {
        let h = harness();

        let thread = h.coordinator.resolve_or_create(None).await.unwrap();

        assert!(!thread.id.is_empty());
        assert!(h.cache.get(&thread.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_archive_hit_rehydrates_cache() {
        let h = harness();
        h.archive.put(&thread_with("t2", 3)).await.unwrap();

        let before = Utc::now();
        let thread = h.coordinator.resolve_or_create(Some("t2")).await.unwrap();

        assert_eq!(contents(&thread), vec!["msg 0", "msg 1", "msg 2"]);
        let cached = h.cache.get("t2").await.unwrap().unwrap();
        assert_eq!(cached.thread, thread);
        let ttl = chrono::Duration::seconds(3600);
        assert!(cached.expires_at >= before + ttl);
        assert!(cached.expires_at <= Utc::now() + ttl);

        let session = h.coordinator.session("t2").unwrap();
        assert!(session.persisted);
        assert_eq!(session.message_count, 3);
    }

    #[tokio::test]
    async fn test_resolve_does_not_create() {
        let h = harness();

        assert!(h.coordinator.resolve("t1").await.unwrap().is_none());
        assert!(h.cache.get("t1").await.unwrap().is_none());
        assert!(h.coordinator.list_active().is_empty());

        h.archive.put(&thread_with("t1", 2)).await.unwrap();
        let thread = h.coordinator.resolve("t1").await.unwrap().unwrap();
        assert_eq!(thread.messages.len(), 2);
        assert!(h.cache.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_archive() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        h.archive.set_available(false);

        let thread = h.coordinator.resolve_or_create(Some("t1")).await;

        assert_ok!(thread);
    }

    #[tokio::test]
    async fn test_archive_outage_fails_restore() {
        let h = harness();
        h.archive.set_available(false);

        let err = assert_err!(h.coordinator.resolve_or_create(Some("t1")).await);

        assert!(err.is_unavailable(StoreKind::Archive));
        assert!(h.cache.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutate_unknown_thread() {
        let h = harness();

        let err = h
            .coordinator
            .mutate("ghost", vec![Message::user("hello")])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ThreadNotFound(id) if id == "ghost"));
        assert!(h.cache.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutate_appends_and_refreshes_cache() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        let first = h.cache.get("t1").await.unwrap().unwrap().expires_at;

        let thread = h
            .coordinator
            .mutate("t1", vec![Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();

        assert_eq!(contents(&thread), vec!["hi", "hello"]);
        let cached = h.cache.get("t1").await.unwrap().unwrap();
        assert_eq!(cached.thread.messages.len(), 2);
        assert!(cached.expires_at >= first);
        assert!(!h.coordinator.session("t1").unwrap().persisted);
        assert_eq!(h.archive.write_count(), 0);
    }

    #[tokio::test]
    async fn test_mutate_restores_expired_entry_from_archive() {
        let h = harness();
        h.archive.put(&thread_with("t1", 2)).await.unwrap();
        // Stale and already expired
        h.cache.put(&thread_with("t1", 1), Duration::ZERO).await.unwrap();

        let thread = h
            .coordinator
            .mutate("t1", vec![Message::user("next")])
            .await
            .unwrap();

        assert_eq!(contents(&thread), vec!["msg 0", "msg 1", "next"]);
    }

    #[tokio::test]
    async fn test_write_back_merges_stale_archive() {
        let h = harness();
        h.cache.put(&thread_with("t3", 5), Duration::from_secs(60)).await.unwrap();
        h.archive.put(&thread_with("t3", 3)).await.unwrap();

        let record = h.coordinator.write_back("t3").await.unwrap().unwrap();

        assert_eq!(record.thread.messages.len(), 5);
        assert_eq!(record.thread.merge_count, 1);
        let archived = h.archive.get("t3").await.unwrap().unwrap();
        assert_eq!(archived.thread, record.thread);
        // Cache copy stays hot
        assert_eq!(h.cache.get("t3").await.unwrap().unwrap().thread.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_write_back_marks_session_persisted() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        h.coordinator
            .mutate("t1", vec![Message::user("hi")])
            .await
            .unwrap();

        h.coordinator.write_back("t1").await.unwrap();

        assert!(h.coordinator.session("t1").unwrap().persisted);
        assert!(!h.coordinator.scheduler().is_scheduled("t1"));

        h.coordinator
            .mutate("t1", vec![Message::user("again")])
            .await
            .unwrap();
        assert!(!h.coordinator.session("t1").unwrap().persisted);
        assert!(h.coordinator.scheduler().is_scheduled("t1"));
    }

    #[tokio::test]
    async fn test_write_back_of_unknown_thread() {
        let h = harness();

        assert!(h.coordinator.write_back("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_back_retries_transient_failures() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t4")).await.unwrap();
        h.coordinator
            .mutate("t4", vec![Message::user("hi")])
            .await
            .unwrap();
        h.archive.fail_next(2);

        let record = h.coordinator.write_back("t4").await.unwrap().unwrap();

        assert_eq!(record.thread.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_write_back_gives_up_after_budget() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t4")).await.unwrap();
        h.archive.set_available(false);

        let err = h.coordinator.write_back("t4").await.unwrap_err();

        assert!(err.is_unavailable(StoreKind::Archive));
        assert!(!h.coordinator.session("t4").unwrap().persisted);
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        h.coordinator
            .mutate("t1", vec![Message::user("hi")])
            .await
            .unwrap();
        h.coordinator.write_back("t1").await.unwrap();

        assert!(h.coordinator.delete("t1").await.unwrap());

        assert!(h.cache.get("t1").await.unwrap().is_none());
        assert!(h.archive.get("t1").await.unwrap().is_none());
        assert!(!h.coordinator.scheduler().is_scheduled("t1"));
        assert!(h.coordinator.list_active().is_empty());
        assert!(!h.coordinator.delete("t1").await.unwrap());

        let thread = h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        assert!(thread.messages.is_empty());
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_archive() {
        let mut cache = MockCacheStore::new();
        cache
            .expect_get()
            .returning(|_| Err(Error::cache_unavailable("connection refused")));
        cache
            .expect_put()
            .returning(|_, _| Err(Error::cache_unavailable("connection refused")));
        let archive = Arc::new(MemoryArchivalStore::new());
        archive.put(&thread_with("t1", 2)).await.unwrap();
        let coordinator =
            SessionCoordinator::new(Arc::new(cache), archive.clone(), &fast_config()).unwrap();

        let thread = coordinator.resolve_or_create(Some("t1")).await.unwrap();
        assert_eq!(thread.messages.len(), 2);

        let thread = coordinator
            .mutate("t1", vec![Message::user("through")])
            .await
            .unwrap();

        assert_eq!(thread.messages.len(), 3);
        let archived = archive.get("t1").await.unwrap().unwrap();
        assert_eq!(contents(&archived.thread), vec!["msg 0", "msg 1", "through"]);
        let session = coordinator.session("t1").unwrap();
        assert!(session.persisted);
        assert!(session.expires_at.is_none());
        assert!(!coordinator.scheduler().is_scheduled("t1"));
    }

    #[tokio::test]
    async fn test_cache_outage_with_archive_outage_is_explicit() {
        let mut cache = MockCacheStore::new();
        cache
            .expect_get()
            .returning(|_| Err(Error::cache_unavailable("connection refused")));
        let archive = Arc::new(MemoryArchivalStore::new());
        archive.set_available(false);
        let coordinator = SessionCoordinator::new(Arc::new(cache), archive, &fast_config()).unwrap();

        let err = coordinator.resolve_or_create(Some("t1")).await.unwrap_err();

        assert!(err.is_unavailable(StoreKind::Archive));
    }

    #[tokio::test]
    async fn test_list_threads_merges_tiers() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("active")).await.unwrap();
        h.cache
            .put(&thread_with("cached", 1), Duration::from_secs(60))
            .await
            .unwrap();
        h.archive.put(&thread_with("archived", 4)).await.unwrap();
        h.archive.put(&thread_with("active", 0)).await.unwrap();

        let all = h.coordinator.list_threads(ListSource::All, 10).await.unwrap();

        let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["active", "cached", "archived"]);
        assert_eq!(all[0].location, ThreadLocation::Active);
        assert!(all[0].expires_at.is_some());
        assert_eq!(all[2].location, ThreadLocation::Archive);
        assert_eq!(all[2].message_count, 4);
        assert!(all[2].persisted);

        let archive_only = h
            .coordinator
            .list_threads(ListSource::Archive, 10)
            .await
            .unwrap();
        assert_eq!(archive_only.len(), 2);

        let capped = h.coordinator.list_threads(ListSource::All, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_list_threads_skips_unreachable_cache() {
        let mut cache = MockCacheStore::new();
        cache
            .expect_list_ids()
            .returning(|| Err(Error::cache_unavailable("connection refused")));
        let archive = Arc::new(MemoryArchivalStore::new());
        archive.put(&thread_with("archived", 1)).await.unwrap();
        let coordinator = SessionCoordinator::new(Arc::new(cache), archive, &fast_config()).unwrap();

        let all = coordinator.list_threads(ListSource::All, 10).await.unwrap();
        assert_eq!(all.len(), 1);

        let err = coordinator
            .list_threads(ListSource::Cache, 10)
            .await
            .unwrap_err();
        assert!(err.is_unavailable(StoreKind::Cache));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_unpersisted_sessions() {
        let h = harness();
        for id in ["a", "b", "c"] {
            h.coordinator.resolve_or_create(Some(id)).await.unwrap();
            h.coordinator
                .mutate(id, vec![Message::user(format!("hello {}", id))])
                .await
                .unwrap();
        }
        h.coordinator.write_back("c").await.unwrap();

        let flushed = h.coordinator.shutdown().await.unwrap();

        assert_eq!(flushed, 2);
        for id in ["a", "b", "c"] {
            let archived = h.archive.get(id).await.unwrap().unwrap();
            assert_eq!(archived.thread.messages.len(), 1);
        }
        assert!(h.coordinator.scheduler().pending().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_keep_every_message() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        let coordinator = Arc::new(h.coordinator);

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    coordinator
                        .mutate("t1", vec![Message::user(format!("m{}", i))])
                        .await
                        .unwrap();
                    if i % 5 == 0 {
                        coordinator.write_back("t1").await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let record = coordinator.write_back("t1").await.unwrap().unwrap();
        assert_eq!(record.thread.messages.len(), 20);
        let mut seen: Vec<String> = contents(&record.thread);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forced_write_back_never_drops_a_newer_timer() {
        let h = harness();
        let coordinator = Arc::new(h.coordinator);

        for round in 0..30 {
            let id = format!("race-{}", round);
            coordinator.resolve_or_create(Some(&id)).await.unwrap();
            coordinator
                .mutate(&id, vec![Message::user("first")])
                .await
                .unwrap();
            // Force a retry so the write-back spans a backoff sleep
            h.archive.fail_next(1);

            let writer = {
                let coordinator = Arc::clone(&coordinator);
                let id = id.clone();
                tokio::spawn(async move { coordinator.write_back(&id).await })
            };
            let mutator = {
                let coordinator = Arc::clone(&coordinator);
                let id = id.clone();
                tokio::spawn(async move {
                    coordinator
                        .mutate(&id, vec![Message::user("second")])
                        .await
                })
            };
            assert_ok!(writer.await.unwrap());
            assert_ok!(mutator.await.unwrap());

            let session = coordinator.session(&id).unwrap();
            let cached = h.cache.get(&id).await.unwrap().unwrap();
            assert_eq!(contents(&cached.thread), vec!["first", "second"]);
            if session.persisted {
                let archived = h.archive.get(&id).await.unwrap().unwrap();
                assert_eq!(contents(&archived.thread), vec!["first", "second"]);
            } else {
                assert!(
                    coordinator.scheduler().is_scheduled(&id),
                    "{} has unarchived turns and no pending write-back",
                    id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_expired_sessions_leave_list_active() {
        let mut config = MemoryConfig::with_timing(Duration::from_secs(2), Duration::from_secs(1));
        config.write_back.retry_initial_delay_ms = 5;
        config.write_back.retry_max_delay_ms = 20;
        let h = harness_with(config);
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        h.coordinator
            .mutate("t1", vec![Message::user("hi")])
            .await
            .unwrap();
        assert_eq!(h.coordinator.list_active(), vec!["t1".to_string()]);

        tokio::time::sleep(Duration::from_millis(2300)).await;

        assert_eq!(h.coordinator.scheduler().completed_count(), 1);
        assert!(h.coordinator.list_active().is_empty());
        assert!(h.coordinator.session("t1").is_none());
        assert!(!h.coordinator.core.locks.contains_key("t1"));

        let archived = h.archive.get("t1").await.unwrap().unwrap();
        assert_eq!(contents(&archived.thread), vec!["hi"]);
        let restored = h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        assert_eq!(contents(&restored), vec!["hi"]);
    }

    #[tokio::test]
    async fn test_write_back_after_delete_leaves_no_lock() {
        let h = harness();
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        h.coordinator.delete("t1").await.unwrap();

        assert!(h.coordinator.write_back("t1").await.unwrap().is_none());
        let outcome = h.coordinator.core.write_back_once("t1").await.unwrap();

        assert!(matches!(outcome, WriteBackOutcome::Nothing));
        assert!(h.coordinator.core.locks.is_empty());
        assert!(h.coordinator.core.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_write_back_lands_before_expiry() {
        let h = harness_with(MemoryConfig::with_timing(
            Duration::from_secs(20),
            Duration::from_secs(5),
        ));
        h.coordinator.resolve_or_create(Some("t4")).await.unwrap();
        h.coordinator
            .mutate("t4", vec![Message::user("hi")])
            .await
            .unwrap();
        h.archive.fail_next(3);

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(h.archive.write_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let archived = h.archive.get("t4").await.unwrap().unwrap();
        assert_eq!(archived.thread.messages.len(), 1);
        assert_eq!(h.coordinator.scheduler().alarm_count(), 0);
        assert!(h.coordinator.session("t4").unwrap().persisted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_wins_over_pending_write_back() {
        let h = harness_with(MemoryConfig::with_timing(
            Duration::from_secs(20),
            Duration::from_secs(5),
        ));
        h.coordinator.resolve_or_create(Some("t1")).await.unwrap();
        h.coordinator
            .mutate("t1", vec![Message::user("secret")])
            .await
            .unwrap();

        h.coordinator.delete("t1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(h.archive.get("t1").await.unwrap().is_none());
        assert_eq!(h.archive.write_count(), 0);
    }
