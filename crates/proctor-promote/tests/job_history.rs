//! Job history bounds and cancellation of running jobs

use futures::FutureExt;
use proctor_promote::{BackgroundJob, JobManager, JobStatus, JobType, PromoteConfig, PromoteError};
use proctor_store::persister::ADD_TEST_REVISION;
use proctor_store::TestMetadata;
use proctor_test_utils::{definition, file_store, head, meta, wait_for};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn job(title: String) -> Arc<BackgroundJob> {
    Arc::new(BackgroundJob::new(title, "alice", JobType::JobTest))
}

#[tokio::test]
async fn evicted_running_job_is_listed_once() {
    let manager = JobManager::new(&PromoteConfig::default());
    let (release, released) = oneshot::channel::<()>();

    let blocked = job("blocked".into());
    let blocked_id = manager.submit(
        Arc::clone(&blocked),
        Box::new(move |_| {
            async move {
                let _ = released.await;
                Ok(())
            }
            .boxed()
        }),
    );

    let mut quick = Vec::new();
    for i in 0..1000 {
        let j = job(format!("quick {i}"));
        manager.submit(Arc::clone(&j), Box::new(|_| async { Ok(()) }.boxed()));
        quick.push(j);
    }
    for j in &quick {
        assert_eq!(wait_for(j).await, JobStatus::Done);
    }

    assert!(manager.get_job_for_id(blocked_id).is_none());
    assert!(blocked.is_running());
    let recent = manager.recent_jobs();
    assert_eq!(recent.len(), 1001);
    assert_eq!(recent.iter().filter(|j| Arc::ptr_eq(j, &blocked)).count(), 1);
    assert!(Arc::ptr_eq(&recent[0], &blocked));

    release.send(()).unwrap();
    assert_eq!(wait_for(&blocked).await, JobStatus::Done);
    assert_eq!(manager.recent_jobs().len(), 1000);
}

#[tokio::test]
async fn cancelled_queued_job_never_runs() {
    let manager = JobManager::new(&PromoteConfig::default().with_worker_threads(1));
    let (release, released) = oneshot::channel::<()>();

    let first = job("first".into());
    manager.submit(
        Arc::clone(&first),
        Box::new(move |_| {
            async move {
                let _ = released.await;
                Ok(())
            }
            .boxed()
        }),
    );
    let queued = job("queued".into());
    manager.submit(
        Arc::clone(&queued),
        Box::new(|job| {
            async move {
                job.log("should not run");
                Ok(())
            }
            .boxed()
        }),
    );

    assert!(queued.cancel());
    release.send(()).unwrap();
    assert_eq!(wait_for(&first).await, JobStatus::Done);
    assert_eq!(wait_for(&queued).await, JobStatus::Cancelled);
    assert_eq!(queued.log_text(), "");
    assert!(!queued.cancel());
}

#[tokio::test]
async fn cancelled_running_job_still_commits() {
    let fixture = file_store("trunk");
    let store = Arc::clone(&fixture.store);
    let manager = JobManager::new(&PromoteConfig::default());
    let (started, running) = oneshot::channel::<()>();
    let (release, released) = oneshot::channel::<()>();

    let writer = job("writer".into());
    manager.submit(
        Arc::clone(&writer),
        Box::new(move |job| {
            async move {
                let _ = started.send(());
                let _ = released.await;
                store
                    .add_test_definition(
                        &meta("add while cancelled"),
                        ADD_TEST_REVISION,
                        "late_tst",
                        &definition("late_tst", 0.5),
                        &TestMetadata::new(),
                    )
                    .await?;
                job.set_end_message("committed");
                Ok::<_, PromoteError>(())
            }
            .boxed()
        }),
    );

    running.await.unwrap();
    assert!(writer.cancel());
    release.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(30), async {
        while manager.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(writer.status(), JobStatus::Cancelled);
    assert_eq!(writer.end_message(), "committed");
    assert!(head(&fixture.store, "late_tst").await.is_some());
}
