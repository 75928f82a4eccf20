//! The client-side subscription worker.
//!
//! A worker opens a subscription with its options, then runs a handler
//! over delivered batches, acknowledging each one explicitly. Transport
//! failures reconnect after `time_to_wait_before_connection_retry`;
//! continuous failure beyond `max_erroneous_period` gives up permanently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use loamdb_transport::{
    read_json_frame, write_json_frame, DynStream, TcpConnectionHeader, TcpOperation,
    SUBSCRIPTION_PROTOCOL_VERSION,
};

use crate::error::{Result, SubscriptionError};
use crate::messages::{
    BatchAck, BatchItem, DropCause, ServerFrame, SubscriptionConnectOptions,
    SubscriptionOpeningStrategy, SubscriptionStatus, SubscriptionStatusMessage,
};

/// Dials the node serving the subscription. Production workers use TCP;
/// tests use in-process pipes.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Establish a connection to the serving node.
    async fn connect(&self) -> Result<DynStream>;
}

/// Worker-side subscription options.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// The subscription to open.
    pub subscription_name: String,
    /// Contention strategy.
    pub strategy: SubscriptionOpeningStrategy,
    /// Upper bound on batch size.
    pub max_docs_per_batch: usize,
    /// Advance the cursor even when the handler fails.
    pub ignore_subscriber_errors: bool,
    /// Delay between reconnection attempts.
    pub time_to_wait_before_connection_retry: Duration,
    /// Give up permanently after continuous failures for this long.
    pub max_erroneous_period: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            subscription_name: String::new(),
            strategy: SubscriptionOpeningStrategy::OpenIfFree,
            max_docs_per_batch: 4096,
            ignore_subscriber_errors: false,
            time_to_wait_before_connection_retry: Duration::from_secs(5),
            max_erroneous_period: Duration::from_secs(5 * 60),
        }
    }
}

impl WorkerOptions {
    fn to_wire(&self) -> SubscriptionConnectOptions {
        SubscriptionConnectOptions {
            subscription_name: self.subscription_name.clone(),
            strategy: self.strategy,
            max_docs_per_batch: self.max_docs_per_batch,
            ignore_subscriber_errors: self.ignore_subscriber_errors,
            time_to_wait_before_connection_retry_ms: self
                .time_to_wait_before_connection_retry
                .as_millis() as u64,
            max_erroneous_period_ms: self.max_erroneous_period.as_millis() as u64,
        }
    }
}

/// One delivered batch.
#[derive(Debug, Clone)]
pub struct SubscriptionBatch {
    /// The documents in delivery order.
    pub items: Vec<BatchItem>,
}

impl SubscriptionBatch {
    /// How many documents this batch carries.
    pub fn number_of_items_in_batch(&self) -> usize {
        self.items.len()
    }
}

/// A worker consuming one subscription.
pub struct SubscriptionWorker {
    transport: Arc<dyn SubscriptionTransport>,
    database: String,
    options: WorkerOptions,
}

impl SubscriptionWorker {
    /// Create a worker for a database's subscription.
    pub fn new(
        transport: Arc<dyn SubscriptionTransport>,
        database: impl Into<String>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            transport,
            database: database.into(),
            options,
        }
    }

    /// The subscription this worker consumes.
    pub fn subscription_name(&self) -> &str {
        &self.options.subscription_name
    }

    /// Run the worker until the subscription ends: connect, process
    /// batches through `handler`, reconnect on transient failures.
    pub async fn run<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(&SubscriptionBatch) -> std::result::Result<(), String> + Send,
    {
        let mut last_success = Instant::now();
        loop {
            match self.run_connection(&mut handler, &mut last_success).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    if last_success.elapsed() > self.options.max_erroneous_period {
                        warn!(
                            subscription = %self.options.subscription_name,
                            error = %e,
                            "continuous failure exceeded the maximum erroneous period"
                        );
                        return Err(SubscriptionError::ErroneousPeriodExceeded {
                            name: self.options.subscription_name.clone(),
                            message: e.to_string(),
                        });
                    }
                    debug!(
                        subscription = %self.options.subscription_name,
                        error = %e,
                        "reconnecting after transient failure"
                    );
                    tokio::time::sleep(self.options.time_to_wait_before_connection_retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_connection<F>(
        &self,
        handler: &mut F,
        last_success: &mut Instant,
    ) -> Result<()>
    where
        F: FnMut(&SubscriptionBatch) -> std::result::Result<(), String> + Send,
    {
        let mut stream = self.transport.connect().await?;

        let header = TcpConnectionHeader {
            operation: TcpOperation::Subscription,
            protocol_version: SUBSCRIPTION_PROTOCOL_VERSION,
            database: self.database.clone(),
        };
        write_json_frame(&mut stream, &header).await?;
        write_json_frame(&mut stream, &self.options.to_wire()).await?;

        let status: SubscriptionStatusMessage = read_json_frame(&mut stream).await?;
        match status.status {
            SubscriptionStatus::Accepted => {
                *last_success = Instant::now();
            }
            SubscriptionStatus::InUse => {
                return Err(SubscriptionError::InUse {
                    name: self.options.subscription_name.clone(),
                })
            }
            SubscriptionStatus::NotFound => {
                return Err(SubscriptionError::NotFound {
                    name: self.options.subscription_name.clone(),
                })
            }
            SubscriptionStatus::DatabaseGone => {
                return Err(match status.message {
                    Some(message) => SubscriptionError::Server { message },
                    None => SubscriptionError::DatabaseDoesNotExist {
                        database: self.database.clone(),
                    },
                })
            }
            SubscriptionStatus::Invalid => {
                return Err(SubscriptionError::Protocol {
                    msg: status.message.unwrap_or_else(|| "rejected".to_string()),
                })
            }
        }

        loop {
            let frame: ServerFrame = read_json_frame(&mut stream).await?;
            match frame {
                ServerFrame::Heartbeat => continue,
                ServerFrame::Batch {
                    items,
                    last_change_vector,
                } => {
                    let batch = SubscriptionBatch { items };
                    match handler(&batch) {
                        Ok(()) => {
                            write_json_frame(&mut stream, &BatchAck::ok(&last_change_vector))
                                .await?;
                            *last_success = Instant::now();
                        }
                        Err(message) => {
                            write_json_frame(
                                &mut stream,
                                &BatchAck::failed(&last_change_vector, message),
                            )
                            .await?;
                            // The server decides: advance (ignore errors) or
                            // drop this connection.
                        }
                    }
                }
                ServerFrame::Dropped { cause, message } => {
                    return Err(match cause {
                        DropCause::TakenOver | DropCause::Dropped => SubscriptionError::Closed {
                            name: self.options.subscription_name.clone(),
                            reason: message,
                        },
                        DropCause::DatabaseDeleted | DropCause::SubscriptionRemoved => {
                            SubscriptionError::Server { message }
                        }
                        DropCause::SubscriberError => {
                            SubscriptionError::SubscriberError { message }
                        }
                    })
                }
            }
        }
    }
}
