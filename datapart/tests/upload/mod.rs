//! Upload jobs against the in-memory mock backend.
//!
//! These exercise the coordinator end to end: session handling, scheduling, pause/resume,
//! cancellation and completion, with the mock standing in for both the REST backend and object
//! storage.
use crate::progress::{TestUploadProgressCallback, UploadProgressEventDiscriminants};
use crate::{wait_until, Result};
use assert_matches::assert_matches;
use bytes::Bytes;
use datapart::{
    BytesSource, Config, FileSessionStore, FileSource, MemorySessionStore, SessionStore,
    UploadError, UploadOptions, UploadOutcome, UploadSession, Uploader,
};
use datapart_testing::logging::test_with_logging;
use datapart_testing::mock::MockBackend;
use datapart_testing::test_data::{make_test_file, random_bytes};
use more_asserts::*;
use rand::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const OBJECT_NAME: &str = "datasets/corpus.jsonl";
const FILE_NAME: &str = "corpus.jsonl";

fn uploader(backend: &MockBackend, sessions: &MemorySessionStore) -> Uploader {
    Uploader::new(
        Config::default(),
        backend.clone(),
        backend.clone(),
        sessions.clone(),
    )
}

fn options(chunk_size: u64, concurrency: usize) -> UploadOptions {
    UploadOptions {
        concurrency: Some(concurrency),
        chunk_size: Some(chunk_size),
        initial_uploaded_bytes: 0,
    }
}

fn source(data: &Bytes) -> Arc<BytesSource> {
    Arc::new(BytesSource::new(FILE_NAME, data.clone()))
}

#[test]
fn uploads_every_part_and_completes_once() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        backend.assign_object_names_with_prefix("stored/");
        let sessions = MemorySessionStore::new();
        let data = random_bytes(10_000);
        let progress = TestUploadProgressCallback::new();

        let job = uploader(&backend, &sessions).begin(
            source(&data),
            OBJECT_NAME,
            options(1_000, 4),
            progress.clone(),
        );
        let outcome = job.wait().await?;

        assert_matches!(outcome, UploadOutcome::Completed { object_name, total_bytes, parts, .. } => {
            assert_eq!("stored/datasets/corpus.jsonl", object_name);
            assert_eq!(10_000, total_bytes);
            assert_eq!(10, parts);
        });

        let completions = backend.completions();
        assert_eq!(1, completions.len());
        let part_numbers = completions[0]
            .1
            .iter()
            .map(|part| part.part_number)
            .collect::<Vec<_>>();
        assert_eq!((1..=10).collect::<Vec<_>>(), part_numbers);

        assert_eq!(Some(data), backend.object("stored/datasets/corpus.jsonl"));
        assert_eq!(None, sessions.load(OBJECT_NAME).await?);
        assert_eq!(1, backend.init_count());

        progress.sanity_check_completed();
        assert_eq!(
            vec!["stored/datasets/corpus.jsonl".to_string()],
            progress.assigned_object_names()
        );

        Ok(())
    })
}

#[test]
fn never_more_parts_in_flight_than_the_concurrency_limit() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        backend.set_part_delay(Duration::from_millis(5));
        let sessions = MemorySessionStore::new();
        let data = random_bytes(10_000);

        let outcome = uploader(&backend, &sessions)
            .begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 4))
            .wait()
            .await?;

        assert_matches!(outcome, UploadOutcome::Completed { parts: 10, .. });
        assert_le!(backend.max_in_flight(), 4);
        // Every slot is refilled as soon as it frees up, so all four get used
        assert_eq!(4, backend.max_in_flight());

        Ok(())
    })
}

#[test]
fn concurrency_defaults_to_config() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        backend.set_part_delay(Duration::from_millis(5));
        let sessions = MemorySessionStore::new();
        let config = Config {
            max_concurrent_requests: 2,
            ..Default::default()
        };
        let data = random_bytes(6_000);

        let options = UploadOptions {
            chunk_size: Some(1_000),
            ..Default::default()
        };
        Uploader::new(config, backend.clone(), backend.clone(), sessions)
            .begin_without_progress(source(&data), OBJECT_NAME, options)
            .wait()
            .await?;

        assert_eq!(2, backend.max_in_flight());

        Ok(())
    })
}

#[test]
fn resume_transfers_only_missing_parts() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(8_000);
        let uploader = uploader(&backend, &sessions);

        // First attempt dies on part 6
        backend.fail_part(6);
        let result = uploader
            .begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 2))
            .wait()
            .await;
        assert_matches!(result, Err(UploadError::PartUploadRejected { .. }));

        let session = sessions.load(OBJECT_NAME).await?.unwrap();
        let recorded = session.parts.keys().copied().collect::<Vec<_>>();
        assert!(!recorded.contains(&6));
        assert_ge!(recorded.len(), 4);
        let uploaded_before = backend.uploaded_parts().len();

        // Second attempt reuses the session
        backend.clear_part_failures();
        let progress = TestUploadProgressCallback::new();
        let outcome = uploader
            .begin(source(&data), OBJECT_NAME, options(1_000, 2), progress.clone())
            .wait()
            .await?;

        assert_matches!(outcome, UploadOutcome::Completed { upload_id, .. } => {
            assert_eq!(session.upload_id, upload_id);
        });
        assert_eq!(1, backend.init_count());

        let mut resumed = backend.uploaded_parts()[uploaded_before..].to_vec();
        resumed.sort_unstable();
        let missing = (1..=8)
            .filter(|part_number| !recorded.contains(part_number))
            .collect::<Vec<_>>();
        assert_eq!(missing, resumed);

        assert_eq!(Some(data), backend.object(OBJECT_NAME));
        progress.sanity_check_completed();

        Ok(())
    })
}

#[test]
fn resume_with_random_recorded_subset() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(12_000);
        let uploader = uploader(&backend, &sessions);

        // Hold every part, let a random subset through, then stop the job
        let mut rng = rand::thread_rng();
        let released = (1..=12u32)
            .filter(|_| rng.gen_bool(0.5))
            .collect::<Vec<_>>();
        for part_number in 1..=12 {
            backend.hold_part(part_number);
        }

        let job = uploader.begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 12));
        backend.wait_for_in_flight(12).await;
        for part_number in &released {
            backend.release_part(*part_number);
        }
        // Wait for the job's ledger rather than the mock, which sees a part before the job does
        job.progress()
            .wait_for(|progress| progress.parts_uploaded == released.len())
            .await?;
        job.cancel_all();
        assert_matches!(job.wait().await?, UploadOutcome::Stopped { remaining_parts, .. } => {
            let mut expected = (1..=12).filter(|part_number| !released.contains(part_number)).collect::<Vec<_>>();
            expected.sort_unstable();
            assert_eq!(expected, remaining_parts);
        });

        for part_number in 1..=12 {
            backend.release_part(part_number);
        }
        let uploaded_before = backend.uploaded_parts().len();
        uploader
            .begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 3))
            .wait()
            .await?;

        let resumed = &backend.uploaded_parts()[uploaded_before..];
        for part_number in resumed {
            assert!(!released.contains(part_number), "part {part_number} was transferred twice");
        }
        assert_eq!(12 - released.len(), resumed.len());
        assert_eq!(Some(data), backend.object(OBJECT_NAME));

        Ok(())
    })
}

#[test]
fn stale_session_for_a_different_file_is_discarded() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();

        let mut stale = UploadSession::new("stale-upload", OBJECT_NAME, 100, "a", 50);
        stale.record_part(1, "\"stale-1\"", 50);
        stale.record_part(2, "\"stale-2\"", 50);
        sessions.save(&stale).await?;

        let data = random_bytes(200);
        let outcome = uploader(&backend, &sessions)
            .begin_without_progress(
                Arc::new(BytesSource::new("a", data.clone())),
                OBJECT_NAME,
                options(50, 2),
            )
            .wait()
            .await?;

        assert_matches!(outcome, UploadOutcome::Completed { upload_id, parts: 4, .. } => {
            assert_ne!("stale-upload", upload_id);
        });
        assert_eq!(1, backend.init_count());
        let mut uploaded = backend.uploaded_parts();
        uploaded.sort_unstable();
        assert_eq!(vec![1, 2, 3, 4], uploaded);
        assert_eq!(Some(data), backend.object(OBJECT_NAME));

        Ok(())
    })
}

#[test]
fn session_with_a_different_chunk_size_is_discarded() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(400);

        let mut stale = UploadSession::new("other-chunking", OBJECT_NAME, 400, FILE_NAME, 100);
        stale.record_part(1, "\"x\"", 100);
        sessions.save(&stale).await?;

        uploader(&backend, &sessions)
            .begin_without_progress(source(&data), OBJECT_NAME, options(200, 2))
            .wait()
            .await?;

        assert_eq!(1, backend.init_count());
        assert_eq!(2, backend.uploaded_parts().len());

        Ok(())
    })
}

#[test]
fn resumable_session_accounts_for_the_chunk_size() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(400);
        let uploader = uploader(&backend, &sessions);

        let mut session = UploadSession::new("chunked-by-100", OBJECT_NAME, 400, FILE_NAME, 100);
        session.record_part(1, "\"x\"", 100);
        session.record_part(2, "\"y\"", 100);
        sessions.save(&session).await?;

        // Same file, but the upload would split it differently, so nothing it recorded counts
        let source = source(&data);
        assert_eq!(
            None,
            uploader
                .resumable_session(&*source, OBJECT_NAME, &options(200, 2))
                .await?
        );

        let resumable = uploader
            .resumable_session(&*source, OBJECT_NAME, &options(100, 2))
            .await?
            .unwrap();
        assert_eq!(200, resumable.recorded_bytes());

        let other_file = BytesSource::new("other.jsonl", data.clone());
        assert_eq!(
            None,
            uploader
                .resumable_session(&other_file, OBJECT_NAME, &options(100, 2))
                .await?
        );

        Ok(())
    })
}

#[test]
fn last_two_parts_finishing_together_complete_once() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(10_000);
        backend.hold_part(9);
        backend.hold_part(10);

        let job = uploader(&backend, &sessions).begin_without_progress(
            source(&data),
            OBJECT_NAME,
            options(1_000, 2),
        );

        wait_until("parts 1 through 8 are uploaded", || {
            backend.uploaded_parts().len() == 8
        })
        .await;
        backend.wait_for_in_flight(2).await;
        assert!(backend.completions().is_empty());

        backend.release_part(9);
        backend.release_part(10);

        assert_matches!(job.wait().await?, UploadOutcome::Completed { parts: 10, .. });

        let completions = backend.completions();
        assert_eq!(1, completions.len());
        let part_numbers = completions[0]
            .1
            .iter()
            .map(|part| part.part_number)
            .collect::<Vec<_>>();
        assert_eq!((1..=10).collect::<Vec<_>>(), part_numbers);

        Ok(())
    })
}

#[test]
fn aborted_part_stops_the_job_without_an_error() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(4_000);
        backend.hold_part(2);
        let uploader = uploader(&backend, &sessions);

        let job = uploader.begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 1));
        wait_until("part 2 is in flight", || {
            backend.uploaded_parts() == vec![1] && backend.in_flight() == 1
        })
        .await;

        assert!(job.cancel_part(2));
        assert!(!job.cancel_part(3), "part 3 was never launched");

        assert_matches!(job.wait().await?, UploadOutcome::Stopped { remaining_parts, .. } => {
            assert_eq!(vec![2, 3, 4], remaining_parts);
        });
        assert!(backend.completions().is_empty());

        // The session survives the stop, so the upload can be resumed
        let session = sessions.load(OBJECT_NAME).await?.unwrap();
        assert_eq!(vec![1], session.parts.keys().copied().collect::<Vec<_>>());

        backend.release_part(2);
        let outcome = uploader
            .begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 1))
            .wait()
            .await?;
        assert_matches!(outcome, UploadOutcome::Completed { parts: 4, .. });
        assert_eq!(1, backend.init_count());
        assert_eq!(Some(data), backend.object(OBJECT_NAME));

        Ok(())
    })
}

#[test]
fn abort_and_hard_failure_reject_once_with_the_failure() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(3_000);
        backend.hold_part(1);
        backend.fail_part(3);

        let job = uploader(&backend, &sessions).begin_without_progress(
            source(&data),
            OBJECT_NAME,
            options(1_000, 3),
        );

        wait_until("part 2 is uploaded and part 3 has failed", || {
            backend.uploaded_parts() == vec![2] && backend.failed_parts() == vec![3]
        })
        .await;
        backend.wait_for_in_flight(1).await;
        assert!(job.cancel_part(1));

        assert_matches!(
            job.wait().await,
            Err(UploadError::PartUploadRejected { body, .. }) if body.contains("part 3")
        );
        assert!(backend.completions().is_empty());

        let session = sessions.load(OBJECT_NAME).await?.unwrap();
        assert_eq!(vec![2], session.parts.keys().copied().collect::<Vec<_>>());

        Ok(())
    })
}

#[test]
fn pause_holds_new_parts_until_resumed() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(6_000);
        backend.hold_part(1);
        backend.hold_part(2);
        let progress = TestUploadProgressCallback::new();

        let job = uploader(&backend, &sessions).begin(
            source(&data),
            OBJECT_NAME,
            options(1_000, 2),
            progress.clone(),
        );
        backend.wait_for_in_flight(2).await;

        job.pause();
        assert!(job.is_paused());

        // In-flight parts are allowed to finish while paused
        backend.release_part(1);
        backend.release_part(2);

        let mut progress_receiver = job.progress();
        progress_receiver
            .wait_for(|progress| progress.paused && progress.parts_uploaded == 2)
            .await?;

        // Give the scheduler every chance to misbehave
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(vec![1, 2], backend.requested_part_urls());
        assert_eq!(1, progress.count(UploadProgressEventDiscriminants::Paused));

        job.resume();
        assert_matches!(job.wait().await?, UploadOutcome::Completed { parts: 6, .. });

        // Scheduling continued with the next part, not from the start
        assert_eq!(vec![1, 2, 3, 4, 5, 6], backend.requested_part_urls());
        assert_eq!(1, progress.count(UploadProgressEventDiscriminants::Resumed));
        progress.sanity_check_completed();

        Ok(())
    })
}

#[test]
fn resume_refills_slots_freed_while_paused() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(4_000);
        backend.hold_part(1);
        backend.hold_part(2);

        let job = uploader(&backend, &sessions).begin_without_progress(
            source(&data),
            OBJECT_NAME,
            options(1_000, 2),
        );
        backend.wait_for_in_flight(2).await;

        // Part 2 finishes while paused, part 1 stays in flight throughout
        job.pause();
        backend.release_part(2);
        job.progress()
            .wait_for(|progress| progress.parts_uploaded == 1)
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!backend.requested_part_urls().contains(&3));

        job.resume();
        wait_until("part 3 is requested after resuming", || {
            backend.requested_part_urls().contains(&3)
        })
        .await;
        assert!(!backend.uploaded_parts().contains(&1));

        backend.release_part(1);
        assert_matches!(job.wait().await?, UploadOutcome::Completed { parts: 4, .. });
        assert_eq!(Some(data), backend.object(OBJECT_NAME));

        Ok(())
    })
}

#[test]
fn byte_counter_includes_initial_uploaded_bytes() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(2_000_000);
        let progress = TestUploadProgressCallback::new();

        let job = uploader(&backend, &sessions).begin(
            source(&data),
            OBJECT_NAME,
            UploadOptions {
                concurrency: Some(4),
                chunk_size: Some(500_000),
                initial_uploaded_bytes: 1_000_000,
            },
            progress.clone(),
        );
        let progress_receiver = job.progress();
        job.wait().await?;

        assert_eq!(Some(3_000_000), progress.last_reported_bytes());

        let final_progress = progress_receiver.borrow().clone();
        assert_eq!(3_000_000, final_progress.reported_bytes);
        assert_eq!(2_000_000, final_progress.uploaded_bytes);
        assert_eq!(4, final_progress.parts_uploaded);

        // Never more than the initial bytes plus the file
        for (_, bytes) in progress.byte_reports() {
            assert_le!(bytes, 3_000_000);
            assert_ge!(bytes, 1_000_000);
        }

        Ok(())
    })
}

#[test]
fn progress_stream_ends_with_the_final_state() -> Result<()> {
    use futures::StreamExt;

    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(5_000);

        let job = uploader(&backend, &sessions).begin_without_progress(
            source(&data),
            OBJECT_NAME,
            options(1_000, 2),
        );
        let updates = tokio::spawn(job.progress_stream().collect::<Vec<_>>());
        job.wait().await?;

        // The stream ends once the job is done with it
        let updates = updates.await?;
        let last = updates.last().unwrap();
        assert_eq!(5, last.parts_uploaded);
        assert_eq!(5_000, last.uploaded_bytes);
        assert!((last.percent - 100.0).abs() < 1e-9);

        Ok(())
    })
}

#[test]
fn cancel_all_then_abort_the_upload() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(3_000);
        backend.hold_part(1);
        let uploader = uploader(&backend, &sessions);

        let job = uploader.begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 1));
        backend.wait_for_in_flight(1).await;
        job.cancel_all();

        let upload_id = assert_matches!(
            job.wait().await?,
            UploadOutcome::Stopped { upload_id, remaining_parts, .. } => {
                assert_eq!(vec![1, 2, 3], remaining_parts);
                upload_id
            }
        );
        assert!(backend.completions().is_empty());

        // Cancelling the job leaves both the session and the backend upload alone
        let session = uploader.session(OBJECT_NAME).await?.unwrap();
        assert_eq!(upload_id, session.upload_id);
        assert!(!backend.is_aborted(&upload_id));

        let message = uploader.cancel(OBJECT_NAME, &upload_id).await?;
        assert!(message.contains("aborted"));
        assert!(backend.is_aborted(&upload_id));
        assert!(uploader.session(OBJECT_NAME).await?.is_some());

        uploader.discard_session(OBJECT_NAME).await?;
        assert_eq!(None, uploader.session(OBJECT_NAME).await?);

        Ok(())
    })
}

#[test]
fn failed_completion_keeps_the_session() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = random_bytes(3_000);
        backend.fail_completion();

        let result = uploader(&backend, &sessions)
            .begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 3))
            .wait()
            .await;

        assert_matches!(result, Err(UploadError::ApiRejected { code: 500, .. }));
        assert_eq!(1, backend.completions().len());

        let session = sessions.load(OBJECT_NAME).await?.unwrap();
        assert_eq!(3, session.parts.len());

        Ok(())
    })
}

#[test]
fn empty_file_is_uploaded_as_one_empty_part() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();
        let sessions = MemorySessionStore::new();
        let data = Bytes::new();

        let outcome = uploader(&backend, &sessions)
            .begin_without_progress(source(&data), OBJECT_NAME, options(1_000, 4))
            .wait()
            .await?;

        assert_matches!(outcome, UploadOutcome::Completed { parts: 1, total_bytes: 0, .. });
        assert_eq!(vec![1], backend.uploaded_parts());
        assert_eq!(Some(Bytes::new()), backend.object(OBJECT_NAME));

        Ok(())
    })
}

#[test]
fn file_upload_with_file_backed_sessions() -> Result<()> {
    test_with_logging(async move {
        let temp_dir = tempfile::tempdir()?;
        let (path, data) = make_test_file(temp_dir.path(), "data file.csv", 25_000).await?;
        let session_dir = temp_dir.path().join("sessions");

        let backend = MockBackend::new();
        backend.hold_part(3);
        let uploader = Uploader::new(
            Config::default(),
            backend.clone(),
            backend.clone(),
            FileSessionStore::new(&session_dir),
        );
        let source = Arc::new(FileSource::open(&path).await?);

        // Stop partway so there's something on disk
        let job = uploader.begin_without_progress(source.clone(), OBJECT_NAME, options(10_000, 1));
        wait_until("part 3 is in flight", || {
            backend.uploaded_parts() == vec![1, 2] && backend.in_flight() == 1
        })
        .await;
        job.cancel_all();
        job.wait().await?;

        let persisted = uploader.sessions().await?;
        assert_eq!(1, persisted.len());
        assert_eq!("data file.csv", persisted[0].file_name);
        assert_eq!(2, persisted[0].parts.len());

        backend.release_part(3);
        uploader
            .begin_without_progress(source, OBJECT_NAME, options(10_000, 1))
            .wait()
            .await?;

        assert_eq!(Some(data), backend.object(OBJECT_NAME));
        assert!(uploader.sessions().await?.is_empty());

        Ok(())
    })
}

#[test]
fn rollback_reports_but_never_raises_failures() -> Result<()> {
    test_with_logging(async move {
        let backend = MockBackend::new();

        assert!(datapart::rollback_dataset(&backend, 11, OBJECT_NAME).await);

        backend.fail_deletion();
        assert!(!datapart::rollback_dataset(&backend, 12, OBJECT_NAME).await);

        Ok(())
    })
}
