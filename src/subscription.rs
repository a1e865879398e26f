use std::{sync::Arc, time::Duration};

use crossbeam_queue::SegQueue;
use snafu::ResultExt;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::Checkpoint,
    reader::{PrefetchReader, ReaderError, StorageSnafu, CHECKPOINT_POLL_INTERVAL},
    record::{self, StoredMessage},
    storage::PageStorage,
};

/// How often the loop re-checks the queue depth while the consumer is
/// holding it at the limit.
pub(crate) const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the loop backs off after an error before retrying.
pub(crate) const ERROR_BACKOFF: Duration = Duration::from_secs(20);

/// A live tail over a log: a background task streaming newly committed
/// messages into a multi-producer-safe queue.
///
/// The queue limit is cooperative rather than strict: the task stops
/// enqueueing at the limit and polls until the consumer drains below it.
/// Cancelling the token passed to [`Reader::subscribe`] ends the task
/// promptly; dropping the handle without cancelling aborts it.
///
/// [`Reader::subscribe`]: crate::reader::Reader::subscribe
pub struct Subscription {
    queue: Arc<SegQueue<StoredMessage>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<S, C>(
        storage: S,
        checkpoint: C,
        start: u64,
        buffer_size: usize,
        queue_limit: usize,
        cancel: CancellationToken,
    ) -> Subscription
    where
        S: PageStorage + 'static,
        C: Checkpoint + 'static,
    {
        let queue = Arc::new(SegQueue::new());
        let task_queue = Arc::clone(&queue);
        let task = tokio::spawn(async move {
            run(
                &storage,
                &checkpoint,
                &task_queue,
                start,
                buffer_size,
                queue_limit,
                &cancel,
            )
            .await;
        });

        Subscription { queue, task }
    }

    /// Dequeues the oldest pending message, if any.
    pub fn try_pop(&self) -> Option<StoredMessage> {
        self.queue.pop()
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Waits for the background task to finish.
    ///
    /// The task only finishes after its cancellation token has fired.
    pub async fn join(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S, C>(
    storage: &S,
    checkpoint: &C,
    queue: &SegQueue<StoredMessage>,
    start: u64,
    buffer_size: usize,
    queue_limit: usize,
    cancel: &CancellationToken,
) where
    S: PageStorage,
    C: Checkpoint,
{
    let mut buffer = vec![0_u8; buffer_size];
    let mut position = start;
    debug!(start, queue_limit, "Subscription started.");

    while !cancel.is_cancelled() {
        match forward_pass(
            storage,
            checkpoint,
            queue,
            &mut buffer,
            &mut position,
            queue_limit,
            cancel,
        )
        .await
        {
            // Made progress; look for more right away.
            Ok(true) => {}
            // Caught up; poll the checkpoint until it moves.
            Ok(false) => {
                if !cancellable_sleep(CHECKPOINT_POLL_INTERVAL, cancel).await {
                    break;
                }
            }
            // Transient failures must not kill the tail: log, back off, and
            // retry from the position reached so far.
            Err(error) => {
                warn!(%error, position, "Subscription pass failed, backing off before retrying.");
                if !cancellable_sleep(ERROR_BACKOFF, cancel).await {
                    break;
                }
            }
        }
    }

    debug!(position, "Subscription stopped.");
}

/// Drains `[position, committed)` into the queue, advancing `position` past
/// each enqueued message so neither errors nor cancellation lose or repeat
/// progress. Returns `false` when there was nothing to drain.
async fn forward_pass<S, C>(
    storage: &S,
    checkpoint: &C,
    queue: &SegQueue<StoredMessage>,
    buffer: &mut [u8],
    position: &mut u64,
    queue_limit: usize,
    cancel: &CancellationToken,
) -> Result<bool, ReaderError>
where
    S: PageStorage,
    C: Checkpoint,
{
    let committed = checkpoint.read().await.context(StorageSnafu)?;
    if committed <= *position {
        return Ok(false);
    }

    let mut window = PrefetchReader::new(storage, *position, committed, buffer);
    while let Some(message) = record::read_message(&mut window).await? {
        // Cooperative back-pressure: hold the message until the consumer
        // drains the queue below the limit.
        while queue.len() >= queue_limit {
            if cancel.is_cancelled()
                || !cancellable_sleep(BACKPRESSURE_POLL_INTERVAL, cancel).await
            {
                return Ok(true);
            }
        }

        queue.push(message);
        *position = window.position();
        trace!(position = *position, "Enqueued message for subscriber.");
    }

    Ok(true)
}

/// Sleeps for `duration`; returns `false` if the token fired first.
async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = sleep(duration) => true,
    }
}
