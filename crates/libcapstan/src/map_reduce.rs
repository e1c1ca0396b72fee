//! Scatter-gather over the task engine.
//!
//! One mapper task per workload shard, fanned out like any other task batch,
//! then a single reducer job fed the concatenation of the mapper results.
//! Concatenation order is submission order — the aggregation contract holds
//! no matter which mappers finish first.

use bytes::{BufMut, Bytes, BytesMut};
use capstan_core::packet::Priority;

use crate::client::Client;
use crate::error::CapstanError;
use crate::task::{TaskId, TaskState};

/// A scatter-gather job description.
///
/// ```no_run
/// # use libcapstan::{Client, MapReduce};
/// # async fn demo(client: &mut Client) -> Result<(), libcapstan::CapstanError> {
/// let total = MapReduce::new("word_count", "sum")
///     .shard("chapter one")
///     .shard("chapter two")
///     .run(client)
///     .await?;
/// # Ok(()) }
/// ```
///
/// The mapper can be a worker-side identity function when the reducer is the
/// whole computation; the coordinator does not care what the mapper does,
/// only that each shard produces one result.
#[derive(Debug, Clone)]
pub struct MapReduce {
    mapper: String,
    reducer: String,
    context: Option<Bytes>,
    shards: Vec<Bytes>,
    priority: Priority,
}

impl MapReduce {
    pub fn new(mapper: impl Into<String>, reducer: impl Into<String>) -> Self {
        Self {
            mapper: mapper.into(),
            reducer: reducer.into(),
            context: None,
            shards: Vec::new(),
            priority: Priority::Normal,
        }
    }

    /// Fixed payload placed ahead of the mapper results in the reducer's
    /// workload.
    pub fn context(mut self, context: impl Into<Bytes>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Append one workload shard. Shard order fixes the concatenation order.
    pub fn shard(mut self, shard: impl Into<Bytes>) -> Self {
        self.shards.push(shard.into());
        self
    }

    pub fn shards<I>(mut self, shards: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        self.shards.extend(shards.into_iter().map(Into::into));
        self
    }

    /// Run the whole job: mappers first, reducer on their combined output.
    ///
    /// The first mapper failure (in submission order) aborts the job with
    /// that failure; the reducer never runs and the remaining mapper tasks
    /// are abandoned. With no shards at all, the reducer runs directly on
    /// the context payload.
    pub async fn run(self, client: &mut Client) -> Result<Bytes, CapstanError> {
        if self.shards.is_empty() {
            let workload = self.context.unwrap_or_default();
            return client
                .do_with(&self.reducer, None, workload, self.priority)
                .await;
        }

        let mut ids: Vec<TaskId> = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            match client.create_task(&self.mapper, None, shard.clone(), self.priority, false) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    abandon(client, &ids);
                    return Err(e);
                }
            }
        }

        if let Err(e) = client.run_until_failure(&ids).await {
            abandon(client, &ids);
            return Err(e);
        }

        // First failure in submission order decides the outcome.
        for &id in &ids {
            let failed = client.tasks().any(|t| {
                t.id() == id && matches!(t.state(), TaskState::Failed | TaskState::ConnError)
            });
            if failed {
                let error = client
                    .remove_task(id)
                    .and_then(|t| t.into_result().err())
                    .unwrap_or(CapstanError::Timeout);
                abandon(client, &ids);
                return Err(error);
            }
        }

        let mut combined = BytesMut::new();
        if let Some(context) = &self.context {
            combined.put_slice(context);
        }
        for &id in &ids {
            let Some(task) = client.remove_task(id) else {
                return Err(CapstanError::Timeout);
            };
            combined.put_slice(&task.into_result()?);
        }

        client
            .do_with(&self.reducer, None, combined.freeze(), self.priority)
            .await
    }
}

/// Best-effort cancel: forget the tasks client-side. Work already accepted
/// by a server keeps running there.
fn abandon(client: &mut Client, ids: &[TaskId]) {
    for &id in ids {
        client.remove_task(id);
    }
}
