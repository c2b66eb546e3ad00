//! # Accessor
//!
//! The accessor owns a [`Processor`] (and through it the driver) on a
//! dedicated OS thread, and talks to the rest of the program over two bounded
//! Tokio channels.
//!
//! ```text
//!   callers                      accessor thread
//!  ┌────────┐  submit   ┌───────────────────────────────┐
//!  │ task A ├──────────►│  fetch ──► append_request     │
//!  │ task B ├──────────►│              │                │
//!  └────────┘           │              ▼                │
//!                       │           execute ──► Driver  │
//!  ┌────────┐ completed │              │                │
//!  │ reader │◄──────────┤◄─────────────┘                │
//!  └────────┘           └───────────────────────────────┘
//! ```
//!
//! ## Cycle
//!
//! 1. Wait for one request when the processor is idle, otherwise poll.
//! 2. Append it, plus the request right after it when it is a `pre_req`.
//! 3. Keep draining without waiting until the channel is empty or
//!    `max_pending_groups` groups are queued.
//! 4. Execute until the processor yields nothing, forwarding every completed
//!    request.
//!
//! A panic while appending or executing is caught, logged, and ends the
//! cycle; a panicking head is completed with a fault so it cannot wedge the
//! queue.
//!
//! The loop exits once every sender is gone and the queue is drained, and
//! hands the driver back through [`AccessorHandle::shutdown`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{error, info};

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::types::{DbReply, DbRequest};

// =============================================================================
// Configuration
// =============================================================================

/// Default cap on queued groups before the accessor stops draining.
pub const DEFAULT_MAX_PENDING_GROUPS: usize = 256;

/// Default capacity of the request and completion channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 4096;

/// Default pause before retrying a faulted head.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 10;

/// Configuration for the accessor loop.
#[derive(Debug, Clone)]
pub struct AccessorConfig {
    /// Stop pulling new requests once this many groups are queued.
    pub max_pending_groups: usize,

    /// Capacity of each channel.
    pub channel_size: usize,

    /// Sleep between retries when nothing new is waiting.
    pub retry_backoff: Duration,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            max_pending_groups: DEFAULT_MAX_PENDING_GROUPS,
            channel_size: DEFAULT_CHANNEL_SIZE,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Cloneable request side of an accessor.
#[derive(Debug, Clone)]
pub struct AccessorSender {
    tx: mpsc::Sender<DbRequest>,
}

impl AccessorSender {
    /// Queues `req`, waiting for channel capacity.
    pub async fn submit(&self, req: DbRequest) -> Result<()> {
        self.tx
            .send(req)
            .await
            .map_err(|_| Error::ChannelClosed("accessor requests"))
    }
}

/// Completion side of an accessor, owning its thread.
#[derive(Debug)]
pub struct AccessorReceiver<D> {
    rx: mpsc::Receiver<DbRequest>,
    thread: JoinHandle<D>,
}

impl<D> AccessorReceiver<D> {
    /// Next completed request, or `None` once the accessor has stopped.
    pub async fn completed(&mut self) -> Option<DbRequest> {
        self.rx.recv().await
    }

    /// Waits for the accessor thread to finish and returns its driver.
    ///
    /// Blocks until every [`AccessorSender`] is dropped and the queue is
    /// drained. Completions not yet received are discarded.
    pub fn shutdown(self) -> Result<D> {
        drop(self.rx);
        self.thread
            .join()
            .map_err(|_| Error::Driver("accessor thread panicked".to_string()))
    }
}

/// Both sides of a running accessor.
#[derive(Debug)]
pub struct AccessorHandle<D> {
    sender: AccessorSender,
    receiver: AccessorReceiver<D>,
}

impl<D> AccessorHandle<D> {
    pub async fn submit(&self, req: DbRequest) -> Result<()> {
        self.sender.submit(req).await
    }

    pub async fn completed(&mut self) -> Option<DbRequest> {
        self.receiver.completed().await
    }

    /// A new sender for the same accessor.
    pub fn sender(&self) -> AccessorSender {
        self.sender.clone()
    }

    /// Separates the request side from the completion side, so they can be
    /// moved to different tasks.
    pub fn split(self) -> (AccessorSender, AccessorReceiver<D>) {
        (self.sender, self.receiver)
    }

    /// Closes this handle's sender and waits for the accessor to finish.
    ///
    /// Senders obtained from [`sender`](Self::sender) must be dropped first.
    pub fn shutdown(self) -> Result<D> {
        drop(self.sender);
        self.receiver.shutdown()
    }
}

// =============================================================================
// Spawn
// =============================================================================

/// Starts an accessor thread driving `driver`.
pub fn spawn_accessor<D>(driver: D, config: AccessorConfig) -> Result<AccessorHandle<D>>
where
    D: Driver + Send + 'static,
{
    let (req_tx, req_rx) = mpsc::channel(config.channel_size.max(1));
    let (done_tx, done_rx) = mpsc::channel(config.channel_size.max(1));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    let processor = Processor::new(driver);
    let thread = std::thread::Builder::new()
        .name("rowcache-accessor".to_string())
        .spawn(move || rt.block_on(run_accessor(processor, req_rx, done_tx, config)))?;

    Ok(AccessorHandle {
        sender: AccessorSender { tx: req_tx },
        receiver: AccessorReceiver { rx: done_rx, thread },
    })
}

// =============================================================================
// Loop
// =============================================================================

enum Fetch {
    Got(DbRequest),
    Empty,
    Closed,
}

async fn fetch(rx: &mut mpsc::Receiver<DbRequest>, wait: bool) -> Fetch {
    if wait {
        return match rx.recv().await {
            Some(req) => Fetch::Got(req),
            None => Fetch::Closed,
        };
    }

    match rx.try_recv() {
        Ok(req) => Fetch::Got(req),
        Err(TryRecvError::Empty) => Fetch::Empty,
        Err(TryRecvError::Disconnected) => Fetch::Closed,
    }
}

/// Runs `f`, turning a panic into `None`.
fn guarded<T>(stage: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(stage, panic = %message, "recovered panic in accessor");
            None
        }
    }
}

/// Pulls requests into the processor. Returns true once the request channel
/// is closed.
async fn fill<D: Driver>(
    processor: &mut Processor<D>,
    rx: &mut mpsc::Receiver<DbRequest>,
    config: &AccessorConfig,
) -> bool {
    let mut wait = processor.is_empty();

    loop {
        if processor.pending_req_num() >= config.max_pending_groups {
            return false;
        }

        let req = match fetch(rx, wait).await {
            Fetch::Got(req) => req,
            Fetch::Empty => return false,
            Fetch::Closed => return true,
        };
        wait = false;

        let pre_req = req.pre_req;
        if guarded("append", || processor.append_request(req)).is_none() {
            return false;
        }

        if pre_req {
            let next = match fetch(rx, true).await {
                Fetch::Got(next) => next,
                Fetch::Empty => return false,
                Fetch::Closed => return true,
            };
            if guarded("append", || processor.append_request(next)).is_none() {
                return false;
            }
        }
    }
}

/// Executes queued groups until the processor yields nothing. Returns false
/// when the completion receiver is gone.
async fn drain<D: Driver>(processor: &mut Processor<D>, tx: &mpsc::Sender<DbRequest>) -> bool {
    loop {
        let (done, panicked) = match guarded("execute", || processor.execute()) {
            Some(Some(req)) => (req, false),
            Some(None) => return true,
            None => {
                let reply = DbReply::fault(Error::Driver("request panicked".to_string()));
                match processor.fail_head(reply) {
                    Some(req) => (req, true),
                    None => return true,
                }
            }
        };

        if tx.send(done).await.is_err() {
            return false;
        }
        if panicked {
            return true;
        }
    }
}

async fn run_accessor<D: Driver>(
    mut processor: Processor<D>,
    mut rx: mpsc::Receiver<DbRequest>,
    tx: mpsc::Sender<DbRequest>,
    config: AccessorConfig,
) -> D {
    info!(
        max_pending_groups = config.max_pending_groups,
        channel_size = config.channel_size,
        "accessor started"
    );

    let mut closed = false;
    let mut receiver_alive = true;
    loop {
        if !closed {
            closed = fill(&mut processor, &mut rx, &config).await;
        }

        if receiver_alive {
            receiver_alive = drain(&mut processor, &tx).await;
        } else {
            loop {
                match guarded("execute", || processor.execute()) {
                    Some(Some(_)) => {}
                    Some(None) => break,
                    None => {
                        processor.fail_head(DbReply::fault(Error::Driver("request panicked".to_string())));
                        break;
                    }
                }
            }
        }

        if processor.is_empty() {
            if closed {
                break;
            }
            continue;
        }

        if closed || rx.is_empty() {
            tokio::time::sleep(config.retry_backoff).await;
        }
    }

    info!("accessor stopped");
    processor.into_driver()
}

// =============================================================================
// Tests
// =============================================================================
