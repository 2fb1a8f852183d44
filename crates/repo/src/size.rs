//! Background repo size recomputation.
//!
//! Committing mutations enqueue the repo id on a bounded queue; a fixed
//! pool of workers recomputes `(size, file_count)` by diffing against the
//! head the stats were last computed for, falling back to a full tree
//! walk when no prior marker exists.

use crate::diff::{diff_trees, DiffStatus};
use crate::error::RepoResult;
use crate::registry::RepoManager;
use reef_core::ObjectId;
use reef_metadata::SizeRepo;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Queue capacity; matches the sweep the data plane has always used.
const JOB_QUEUE_SIZE: usize = 10;

/// Handle for scheduling size recomputation jobs.
#[derive(Clone)]
pub struct SizeScheduler {
    tx: mpsc::Sender<String>,
}

impl SizeScheduler {
    /// Spawn `workers` consumers over a bounded job queue.
    pub fn new(mgr: Arc<RepoManager>, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<String>(JOB_QUEUE_SIZE);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let mgr = mgr.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(repo_id) = job else { break };
                    if let Err(e) = compute_repo_size(&mgr, &repo_id).await {
                        tracing::warn!(repo_id, error = %e, "size recomputation failed");
                    }
                }
            });
        }
        Self { tx }
    }

    /// Enqueue a recomputation for `repo_id`; waits when the queue is full.
    pub async fn schedule(&self, repo_id: &str) {
        if self.tx.send(repo_id.to_string()).await.is_err() {
            tracing::warn!(repo_id, "size job queue closed");
        }
    }
}

/// Recompute a repo's cached size and file count.
pub async fn compute_repo_size(mgr: &RepoManager, repo_id: &str) -> RepoResult<()> {
    let repo = mgr.get(repo_id).await?;
    let info = mgr.metadata.get_repo_size(repo_id).await?;

    if let Some(info) = &info {
        if info.head_id == repo.head_commit_id.to_hex() {
            return Ok(());
        }
    }

    let head = mgr.commits.load(&repo.id, &repo.head_commit_id).await?;

    let old_head = match &info {
        Some(info) => match ObjectId::from_hex(&info.head_id) {
            Ok(id) => mgr.commits.load(&repo.id, &id).await.ok(),
            Err(_) => None,
        },
        None => None,
    };

    let (size, file_count) = if let (Some(info), Some(old_head)) = (&info, &old_head) {
        let results = diff_trees(
            &mgr.fs,
            &repo.store_id,
            &old_head.root_id,
            &head.root_id,
            false,
        )
        .await?;
        let mut change_size = 0i64;
        let mut change_files = 0i64;
        for de in &results {
            match de.status {
                DiffStatus::Added => {
                    change_size += de.size;
                    change_files += 1;
                }
                DiffStatus::Deleted => {
                    change_size -= de.origin_size;
                    change_files -= 1;
                }
                DiffStatus::Modified => {
                    change_size += de.size - de.origin_size;
                }
                _ => {}
            }
        }
        let old_count = mgr
            .metadata
            .get_repo_file_count(repo_id)
            .await?
            .map(|c| c.file_count)
            .unwrap_or(0);
        (info.size + change_size, old_count + change_files)
    } else {
        let full = mgr.fs.file_count_info(&repo.store_id, &head.root_id).await?;
        (full.size, full.file_count)
    };

    mgr.metadata
        .set_size_and_file_count(repo_id, &repo.head_commit_id.to_hex(), size, file_count)
        .await?;
    Ok(())
}
