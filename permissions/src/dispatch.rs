//! Fan-out of resolved grants to the worker topic.
//!
//! A grant can cover thousands of blobs. Each worker message carries at most
//! `blobs_per_chunk` of them so a single ACL update stays within limits.
//! Chunks that were already published are not withdrawn when a later publish
//! fails; redelivery of the grant request re-publishes everything.

use crate::metrics_defs::{DISPATCH_CHUNKS, DISPATCH_FAILURES};
use serde::{Deserialize, Serialize};
use shared::counter;
use shared::pubsub::{PublishError, Publisher};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const BLOBS_PER_CHUNK: usize = 100;

/// One unit of ACL work for the worker.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WorkBatch {
    #[serde(default)]
    pub user_email_list: Vec<String>,
    #[serde(default)]
    pub blob_name_list: Vec<String>,
    #[serde(default)]
    pub revoke: bool,
}

/// A message on the worker topic. The `_fn` key selects the function.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_fn")]
pub enum WorkerTask {
    #[serde(rename = "permissions_worker")]
    PermissionsWorker(WorkBatch),
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("could not encode worker task: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct ChunkDispatcher {
    publisher: Arc<dyn Publisher>,
    topic: String,
    blobs_per_chunk: usize,
    max_in_flight: usize,
}

impl ChunkDispatcher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic: String,
        blobs_per_chunk: usize,
        max_in_flight: usize,
    ) -> Self {
        ChunkDispatcher {
            publisher,
            topic,
            blobs_per_chunk: blobs_per_chunk.max(1),
            max_in_flight: max_in_flight.max(1),
        }
    }

    fn encode(users: &[String], chunk: &[String], revoke: bool) -> Result<Vec<u8>, DispatchError> {
        let task = WorkerTask::PermissionsWorker(WorkBatch {
            user_email_list: users.to_vec(),
            blob_name_list: chunk.to_vec(),
            revoke,
        });
        Ok(serde_json::to_vec(&task)?)
    }

    /// Publishes one worker message per chunk of `blobs` and returns how many
    /// were published. Each publish is acknowledged before this returns.
    pub async fn dispatch(
        &self,
        users: &[String],
        blobs: &[String],
        revoke: bool,
    ) -> Result<usize, DispatchError> {
        let result = if self.max_in_flight == 1 {
            self.dispatch_sequential(users, blobs, revoke).await
        } else {
            self.dispatch_parallel(users, blobs, revoke).await
        };

        if let Err(e) = &result {
            counter!(DISPATCH_FAILURES).increment(1);
            tracing::error!(topic = %self.topic, error = %e, "Dispatch aborted");
        }
        result
    }

    async fn dispatch_sequential(
        &self,
        users: &[String],
        blobs: &[String],
        revoke: bool,
    ) -> Result<usize, DispatchError> {
        let mut published = 0;
        for chunk in blobs.chunks(self.blobs_per_chunk) {
            let data = Self::encode(users, chunk, revoke)?;
            let message_id = self.publisher.publish(&self.topic, data).await?;
            counter!(DISPATCH_CHUNKS).increment(1);
            tracing::debug!(%message_id, blobs = chunk.len(), "Published chunk");
            published += 1;
        }
        Ok(published)
    }

    async fn dispatch_parallel(
        &self,
        users: &[String],
        blobs: &[String],
        revoke: bool,
    ) -> Result<usize, DispatchError> {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut join_set = JoinSet::<Result<(), PublishError>>::new();
        let mut published = 0;

        for chunk in blobs.chunks(self.blobs_per_chunk) {
            let data = Self::encode(users, chunk, revoke)?;
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            // A finished publish frees its permit, so look for failures only
            // once a permit is held. Nothing is spawned after a failure.
            while let Some(done) = join_set.try_join_next() {
                if let Err(e) = done? {
                    join_set.abort_all();
                    return Err(e.into());
                }
                published += 1;
            }

            let publisher = self.publisher.clone();
            let topic = self.topic.clone();
            let blob_count = chunk.len();
            join_set.spawn(async move {
                let _permit = permit;
                let message_id = publisher.publish(&topic, data).await?;
                counter!(DISPATCH_CHUNKS).increment(1);
                tracing::debug!(%message_id, blobs = blob_count, "Published chunk");
                Ok(())
            });
        }

        while let Some(done) = join_set.join_next().await {
            if let Err(e) = done? {
                join_set.abort_all();
                return Err(e.into());
            }
            published += 1;
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::CapturePublisher;
    use std::collections::HashSet;

    fn blobs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("foo/bar/{i}.bam")).collect()
    }

    fn users() -> Vec<String> {
        vec!["a@x.org".to_string(), "b@x.org".to_string()]
    }

    #[tokio::test]
    async fn test_150_blobs_make_two_batches() {
        let publisher = Arc::new(CapturePublisher::default());
        let dispatcher = ChunkDispatcher::new(publisher.clone(), "worker".into(), BLOBS_PER_CHUNK, 1);

        let published = dispatcher.dispatch(&users(), &blobs(150), false).await.unwrap();

        assert_eq!(published, 2);
        let batches = publisher.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].blob_name_list, blobs(150)[..100].to_vec());
        assert_eq!(batches[1].blob_name_list, blobs(150)[100..].to_vec());
        for batch in &batches {
            assert_eq!(batch.user_email_list, users());
            assert!(!batch.revoke);
        }
        assert!(publisher.topics().iter().all(|t| t == "worker"));
    }

    #[tokio::test]
    async fn test_chunk_count_and_coverage() {
        for n in [1, 99, 100, 101, 250, 1000] {
            for max_in_flight in [1, 4] {
                let publisher = Arc::new(CapturePublisher::default());
                let dispatcher =
                    ChunkDispatcher::new(publisher.clone(), "worker".into(), BLOBS_PER_CHUNK, max_in_flight);

                let published = dispatcher.dispatch(&users(), &blobs(n), true).await.unwrap();

                assert_eq!(published, n.div_ceil(BLOBS_PER_CHUNK));
                let batches = publisher.batches();
                assert_eq!(batches.len(), n.div_ceil(BLOBS_PER_CHUNK));

                let sent: Vec<String> = batches.into_iter().flat_map(|b| b.blob_name_list).collect();
                let unique: HashSet<&String> = sent.iter().collect();
                assert_eq!(sent.len(), n);
                assert_eq!(unique, blobs(n).iter().collect());
            }
        }
    }

    #[tokio::test]
    async fn test_publish_error_aborts_remaining() {
        let publisher = Arc::new(CapturePublisher::failing_after(1));
        let dispatcher = ChunkDispatcher::new(publisher.clone(), "worker".into(), BLOBS_PER_CHUNK, 1);

        let result = dispatcher.dispatch(&users(), &blobs(350), false).await;

        assert!(matches!(result, Err(DispatchError::Publish(_))));
        assert_eq!(publisher.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_publish_error() {
        let publisher = Arc::new(CapturePublisher::failing_after(0));
        let dispatcher = ChunkDispatcher::new(publisher.clone(), "worker".into(), BLOBS_PER_CHUNK, 3);

        let result = dispatcher.dispatch(&users(), &blobs(1000), false).await;

        assert!(matches!(result, Err(DispatchError::Publish(_))));
        assert!(publisher.batches().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_stops_spawning_after_failure() {
        let publisher = Arc::new(CapturePublisher::failing_after(0));
        let dispatcher = ChunkDispatcher::new(publisher.clone(), "worker".into(), BLOBS_PER_CHUNK, 2);

        let result = dispatcher.dispatch(&users(), &blobs(500), false).await;

        assert!(matches!(result, Err(DispatchError::Publish(_))));
        // Only chunks spawned before any permit was released get published.
        assert!(publisher.attempts() <= 2);
        assert!(publisher.batches().is_empty());
    }

    #[tokio::test]
    async fn test_no_blobs_publishes_nothing() {
        let publisher = Arc::new(CapturePublisher::default());
        let dispatcher = ChunkDispatcher::new(publisher.clone(), "worker".into(), BLOBS_PER_CHUNK, 1);

        assert_eq!(dispatcher.dispatch(&users(), &[], false).await.unwrap(), 0);
        assert!(publisher.batches().is_empty());
    }

    #[test]
    fn test_worker_task_wire_format() {
        let task = WorkerTask::PermissionsWorker(WorkBatch {
            user_email_list: vec!["a@x.org".into()],
            blob_name_list: vec!["foo/1.bam".into()],
            revoke: false,
        });
        assert_eq!(
            serde_json::to_value(&task).unwrap(),
            serde_json::json!({
                "_fn": "permissions_worker",
                "user_email_list": ["a@x.org"],
                "blob_name_list": ["foo/1.bam"],
                "revoke": false
            })
        );
    }
}
