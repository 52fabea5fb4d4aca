//! Queue lifecycle under concurrency: claims never hand the same job to
//! two workers, and the status machine only moves along its allowed edges.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use vpo_db::{schema, DbPool};
use vpo_jobs::{
    cancel_job, claim_next_job, get_job, insert_job, release_job, requeue_job, ReleaseRequest,
};
use vpo_model::{Job, JobStatus, JobType};

async fn open_pool() -> (tempfile::TempDir, Arc<DbPool>) {
    let dir = tempfile::tempdir().unwrap();
    let pool = DbPool::open(&dir.path().join("queue.db"), Duration::from_secs(10))
        .await
        .unwrap();
    schema::initialize(&pool).await.unwrap();
    (dir, Arc::new(pool))
}

#[tokio::test]
async fn concurrent_claims_never_duplicate() {
    let (_dir, pool) = open_pool().await;
    for i in 0..20 {
        let job = Job::new(JobType::Process, format!("/m/{i}.mkv"));
        insert_job(&pool, &job).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = claim_next_job(&pool, 1000 + worker).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 20, "every job claimed exactly once");
    assert_eq!(unique.len(), 20, "no job claimed twice");
    pool.close().await;
}

#[tokio::test]
async fn status_transitions_follow_the_allowed_graph() {
    let (_dir, pool) = open_pool().await;
    let job = Job::new(JobType::Process, "/m/f.mkv");
    insert_job(&pool, &job).await.unwrap();

    // queued -> running -> failed -> queued (requeue) -> running -> completed
    claim_next_job(&pool, 1).await.unwrap().unwrap();
    release_job(
        &pool,
        &job.id,
        JobStatus::Failed,
        &ReleaseRequest {
            error_message: Some("first try".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(requeue_job(&pool, &job.id).await.unwrap());
    claim_next_job(&pool, 1).await.unwrap().unwrap();
    release_job(
        &pool,
        &job.id,
        JobStatus::Completed,
        &ReleaseRequest {
            set_progress_complete: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let stored = get_job(&pool, &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);

    // Completed is final: no cancel, no requeue, no re-release.
    assert!(!cancel_job(&pool, &job.id).await.unwrap());
    assert!(!requeue_job(&pool, &job.id).await.unwrap());
    assert!(!release_job(&pool, &job.id, JobStatus::Failed, &ReleaseRequest::default())
        .await
        .unwrap());
    assert_eq!(
        get_job(&pool, &job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
    pool.close().await;
}

#[tokio::test]
async fn cancelled_jobs_can_be_requeued_and_claimed() {
    let (_dir, pool) = open_pool().await;
    let job = Job::new(JobType::Transcode, "/m/f.mkv");
    insert_job(&pool, &job).await.unwrap();

    assert!(cancel_job(&pool, &job.id).await.unwrap());
    // Cancelled jobs are invisible to claims until requeued.
    assert!(claim_next_job(&pool, 1).await.unwrap().is_none());

    assert!(requeue_job(&pool, &job.id).await.unwrap());
    let claimed = claim_next_job(&pool, 1).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    pool.close().await;
}
