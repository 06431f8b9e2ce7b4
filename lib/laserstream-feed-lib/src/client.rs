use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use laserstream_config_lib::LaserstreamConfig;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use yellowstone_grpc_proto::geyser::{SubscribeRequest, SubscribeUpdate};

use crate::errors::LaserstreamError;
use crate::grpc_channel;
use crate::stream_session::{run_stream_session, SessionContext, SessionOutcome};
use crate::subscription_store::{plan_resume_slot, SubscriptionStore};

/// 20 minutes of retries at the fixed 5 second interval.
const RECONNECT_ATTEMPT_HARD_CAP: u32 = 240;
const RECONNECT_DELAY: Duration = Duration::from_millis(5000);
const WRITE_QUEUE_DEPTH: usize = 100;
const WRITE_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const UPDATE_QUEUE_DEPTH: usize = 1024;

/// Consumer-facing stream of updates. Per-attempt connection errors are
/// handled internally; the only `Err` items are non-fatal write failures and
/// the single terminal reconnect-exhaustion error, after which the channel
/// closes.
pub type UpdateReceiver = async_channel::Receiver<Result<SubscribeUpdate, LaserstreamError>>;

/// Handle on a running subscription. Cloneable and usable from any task;
/// dropping it leaves the stream running (it only keeps the subscription
/// store alive, never the connection).
#[derive(Clone)]
pub struct StreamHandle {
    store: Arc<Mutex<SubscriptionStore>>,
    write_tx: async_channel::Sender<SubscribeRequest>,
    exit: broadcast::Sender<()>,
}

impl StreamHandle {
    /// Merge `request` into the effective subscription and send it on the
    /// live stream. The store is updated before the request is queued, so a
    /// session dying before the send goes out still reconnects with the
    /// merged subscription.
    pub async fn write(&self, request: SubscribeRequest) -> Result<(), LaserstreamError> {
        {
            let mut store = self
                .store
                .lock()
                .expect("subscription store mutex poisoned");
            store.merge(&request);
        }
        match tokio::time::timeout(WRITE_ENQUEUE_TIMEOUT, self.write_tx.send(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LaserstreamError::NotConnected),
            Err(_) => Err(LaserstreamError::WriteTimeout),
        }
    }

    /// Stop the supervisor and drop the connection. Idempotent.
    pub fn close(&self) {
        let _ = self.exit.send(());
    }
}

/// Open a resilient subscription against `config.endpoint`. Returns once the
/// supervisor is spawned; the first dial happens asynchronously. Transient
/// failures are retried every 5 seconds with slot-based replay until the
/// attempt cap is reached.
pub fn subscribe(
    config: LaserstreamConfig,
    request: SubscribeRequest,
) -> Result<(UpdateReceiver, StreamHandle), LaserstreamError> {
    let authority = grpc_channel::normalize_endpoint(&config.endpoint)?;
    if config.api_key.is_empty() {
        return Err(LaserstreamError::MissingApiKey);
    }
    let x_token = config
        .api_key
        .parse()
        .map_err(|_| LaserstreamError::InvalidApiKey)?;
    let replay_enabled = config.replay.unwrap_or(true);
    let max_attempts = effective_max_attempts(config.max_reconnect_attempts);

    let store = SubscriptionStore::new(request, replay_enabled);
    let internal_slot_sub_id = store.internal_slot_sub_id().map(str::to_owned);
    let store = Arc::new(Mutex::new(store));

    let ctx = Arc::new(SessionContext {
        authority,
        x_token,
        options: config.channel_options.unwrap_or_default(),
        replay_enabled,
        internal_slot_sub_id,
        tracked_slot: AtomicU64::new(0),
        made_progress: AtomicBool::new(false),
    });

    let (update_tx, update_rx) = async_channel::bounded(UPDATE_QUEUE_DEPTH);
    let (write_tx, write_rx) = async_channel::bounded(WRITE_QUEUE_DEPTH);
    let (exit_tx, exit_rx) = broadcast::channel(1);

    let handle = StreamHandle {
        store: Arc::clone(&store),
        write_tx,
        exit: exit_tx.clone(),
    };

    tokio::spawn(supervise_subscription(
        ctx,
        store,
        max_attempts,
        write_rx,
        update_tx,
        exit_tx,
        exit_rx,
    ));

    Ok((update_rx, handle))
}

fn effective_max_attempts(configured: Option<u32>) -> u32 {
    match configured {
        None | Some(0) => RECONNECT_ATTEMPT_HARD_CAP,
        Some(limit) => limit.min(RECONNECT_ATTEMPT_HARD_CAP),
    }
}

/// Reconnect controller: runs sessions until the consumer closes the
/// subscription or the attempt cap is reached. Attempts that forwarded at
/// least one update reset the counter; graceful stream ends skip the delay
/// entirely.
async fn supervise_subscription(
    ctx: Arc<SessionContext>,
    store: Arc<Mutex<SubscriptionStore>>,
    max_attempts: u32,
    write_rx: async_channel::Receiver<SubscribeRequest>,
    update_tx: async_channel::Sender<Result<SubscribeUpdate, LaserstreamError>>,
    // keeps the exit channel open while no close signal has fired
    _exit_guard: broadcast::Sender<()>,
    mut exit: broadcast::Receiver<()>,
) {
    let mut attempts: u32 = 0;
    loop {
        let request = {
            let mut store = store.lock().expect("subscription store mutex poisoned");
            let resume = plan_resume_slot(
                ctx.replay_enabled,
                ctx.tracked_slot.load(Ordering::Relaxed),
                store.commitment(),
            );
            store.apply_resume(resume);
            store.snapshot()
        };
        ctx.made_progress.store(false, Ordering::Relaxed);

        match run_stream_session(&ctx, request, &write_rx, &update_tx, &mut exit).await {
            SessionOutcome::Shutdown => {
                info!("subscription to {} closed", ctx.authority);
                break;
            }
            SessionOutcome::Ended => {
                info!("stream from {} ended, resubscribing", ctx.authority);
                attempts = 0;
            }
            SessionOutcome::Failed(err) => {
                attempts += 1;
                if ctx.made_progress.load(Ordering::Relaxed) {
                    // the connection did useful work; only count this failure
                    attempts = 1;
                }
                if attempts >= max_attempts {
                    error!(
                        "giving up on {} after {} attempts: {err}",
                        ctx.authority, max_attempts
                    );
                    let terminal = LaserstreamError::ReconnectExhausted {
                        attempts: max_attempts,
                        cause: err.to_string(),
                    };
                    let _ = update_tx.send(Err(terminal)).await;
                    break;
                }
                warn!(
                    "stream attempt {attempts}/{max_attempts} to {} failed, retrying in {}s: {err}",
                    ctx.authority,
                    RECONNECT_DELAY.as_secs(),
                );
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = exit.recv() => break,
                }
            }
        }
    }
    update_tx.close();
    write_rx.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use laserstream_config_lib::LaserstreamConfig;
    use test_case::test_case;
    use yellowstone_grpc_proto::geyser::SubscribeRequestFilterTransactions;

    fn test_handle(
        queue_depth: usize,
    ) -> (StreamHandle, async_channel::Receiver<SubscribeRequest>) {
        let (write_tx, write_rx) = async_channel::bounded(queue_depth);
        let (exit, _) = broadcast::channel(1);
        let store = SubscriptionStore::new(SubscribeRequest::default(), true);
        let handle = StreamHandle {
            store: Arc::new(Mutex::new(store)),
            write_tx,
            exit,
        };
        (handle, write_rx)
    }

    #[test_case(None => 240 ; "absent takes the cap")]
    #[test_case(Some(0) => 240 ; "zero takes the cap")]
    #[test_case(Some(3) => 3 ; "small values pass through")]
    #[test_case(Some(240) => 240 ; "cap itself passes through")]
    #[test_case(Some(1000) => 240 ; "larger values are clamped")]
    fn attempt_caps(configured: Option<u32>) -> u32 {
        effective_max_attempts(configured)
    }

    #[tokio::test]
    async fn subscribe_rejects_bad_configuration() {
        let empty_endpoint = LaserstreamConfig::new(String::new(), "key".to_string());
        assert!(matches!(
            subscribe(empty_endpoint, SubscribeRequest::default()),
            Err(LaserstreamError::InvalidEndpoint(_, _))
        ));

        let missing_key =
            LaserstreamConfig::new("laserstream.example.org:4003".to_string(), String::new());
        assert!(matches!(
            subscribe(missing_key, SubscribeRequest::default()),
            Err(LaserstreamError::MissingApiKey)
        ));

        let bad_key =
            LaserstreamConfig::new("laserstream.example.org:4003".to_string(), "k\ney".to_string());
        assert!(matches!(
            subscribe(bad_key, SubscribeRequest::default()),
            Err(LaserstreamError::InvalidApiKey)
        ));
    }

    #[tokio::test]
    async fn write_after_supervisor_stop_reports_not_connected() {
        let (handle, write_rx) = test_handle(WRITE_QUEUE_DEPTH);
        write_rx.close();
        let err = handle.write(SubscribeRequest::default()).await.unwrap_err();
        assert!(matches!(err, LaserstreamError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn write_times_out_when_the_queue_is_full() {
        let (handle, _write_rx) = test_handle(2);
        handle.write(SubscribeRequest::default()).await.unwrap();
        handle.write(SubscribeRequest::default()).await.unwrap();
        let err = handle.write(SubscribeRequest::default()).await.unwrap_err();
        assert!(matches!(err, LaserstreamError::WriteTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn store_is_updated_even_when_the_queue_rejects_the_write() {
        let (handle, _write_rx) = test_handle(1);
        handle.write(SubscribeRequest::default()).await.unwrap();

        let mut late = SubscribeRequest::default();
        late.transactions.insert(
            "late".to_string(),
            SubscribeRequestFilterTransactions::default(),
        );
        let err = handle.write(late).await.unwrap_err();
        assert!(matches!(err, LaserstreamError::WriteTimeout));

        // the next reconnect snapshot must still carry the merged filter
        let store = handle.store.lock().unwrap();
        assert!(store.snapshot().transactions.contains_key("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_delivers_the_terminal_error_exactly_once() {
        let config = LaserstreamConfig {
            endpoint: "127.0.0.1:1".to_string(),
            api_key: "key".to_string(),
            max_reconnect_attempts: Some(3),
            ..Default::default()
        };
        let (updates, _handle) = subscribe(config, SubscribeRequest::default()).unwrap();

        let terminal = updates.recv().await.unwrap().unwrap_err();
        assert!(terminal
            .to_string()
            .starts_with("Connection failed after 3 attempts:"));
        // nothing follows the terminal error; the channel just closes
        assert!(updates.recv().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_supervisor_without_a_terminal_error() {
        let config = LaserstreamConfig {
            endpoint: "127.0.0.1:1".to_string(),
            api_key: "key".to_string(),
            ..Default::default()
        };
        let (updates, handle) = subscribe(config, SubscribeRequest::default()).unwrap();
        handle.close();
        handle.close();

        assert!(updates.recv().await.is_err());
    }
}
