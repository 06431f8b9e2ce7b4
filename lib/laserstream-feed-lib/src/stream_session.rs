use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use laserstream_config_lib::{ChannelOptions, CompressionMode};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use yellowstone_grpc_proto::geyser::{
    subscribe_update::UpdateOneof, SubscribeRequest, SubscribeRequestPing, SubscribeUpdate,
};
use yellowstone_grpc_proto::prelude::geyser_client::GeyserClient;
use yellowstone_grpc_proto::tonic::{
    codec::CompressionEncoding, metadata::AsciiMetadataValue, Code, Status,
};

use crate::errors::LaserstreamError;
use crate::grpc_channel;

const KEEPALIVE_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Everything one connection attempt needs, shared with the supervisor.
pub struct SessionContext {
    pub authority: String,
    pub x_token: AsciiMetadataValue,
    pub options: ChannelOptions,
    pub replay_enabled: bool,
    pub internal_slot_sub_id: Option<String>,
    pub tracked_slot: AtomicU64,
    pub made_progress: AtomicBool,
}

pub enum SessionOutcome {
    /// Cancelled, or the consumer dropped the update stream.
    Shutdown,
    /// Server closed the stream without an error.
    Ended,
    Failed(LaserstreamError),
}

/// One live bidirectional subscription attempt: dial, subscribe, then pump
/// frames until either side gives up. All sends (initial request, consumer
/// writes, pings, pongs) go through the one gRPC sink owned by this task.
pub async fn run_stream_session(
    ctx: &SessionContext,
    request: SubscribeRequest,
    write_rx: &async_channel::Receiver<SubscribeRequest>,
    update_tx: &async_channel::Sender<Result<SubscribeUpdate, LaserstreamError>>,
    exit: &mut broadcast::Receiver<()>,
) -> SessionOutcome {
    info!("connecting to laserstream source {}", ctx.authority);
    let channel = tokio::select! {
        connected = grpc_channel::connect_channel(&ctx.authority, &ctx.options) => match connected {
            Ok(channel) => channel,
            Err(err) => return SessionOutcome::Failed(err),
        },
        _ = exit.recv() => return SessionOutcome::Shutdown,
    };

    let mut client = GeyserClient::with_interceptor(
        channel,
        grpc_channel::request_interceptor(ctx.x_token.clone()),
    )
    .max_decoding_message_size(
        ctx.options
            .max_recv_msg_bytes
            .unwrap_or(grpc_channel::DEFAULT_MAX_RECV_MSG_BYTES),
    )
    .max_encoding_message_size(
        ctx.options
            .max_send_msg_bytes
            .unwrap_or(grpc_channel::DEFAULT_MAX_SEND_MSG_BYTES),
    )
    .accept_compressed(CompressionEncoding::Gzip)
    .accept_compressed(CompressionEncoding::Zstd);
    match ctx.options.compression.unwrap_or_default() {
        CompressionMode::Gzip => client = client.send_compressed(CompressionEncoding::Gzip),
        CompressionMode::Zstd => client = client.send_compressed(CompressionEncoding::Zstd),
        CompressionMode::None => {}
    }

    let (mut grpc_tx, grpc_rx) = mpsc::unbounded();
    if grpc_tx.send(request).await.is_err() {
        return SessionOutcome::Failed(LaserstreamError::SubscribeSend);
    }
    let response = tokio::select! {
        opened = client.subscribe(grpc_rx) => match opened {
            Ok(response) => response,
            Err(status) => return SessionOutcome::Failed(LaserstreamError::SubscribeOpen(status)),
        },
        _ = exit.recv() => return SessionOutcome::Shutdown,
    };
    let mut stream = response.into_inner();
    debug!("subscription to {} is live", ctx.authority);

    let mut keepalive = tokio::time::interval(KEEPALIVE_PING_INTERVAL);
    keepalive.tick().await; // the immediate first tick
    let mut keepalive_open = true;
    let mut writes_open = true;

    loop {
        tokio::select! {
            _ = exit.recv() => return SessionOutcome::Shutdown,
            _ = keepalive.tick(), if keepalive_open => {
                let ping = SubscribeRequest {
                    ping: Some(SubscribeRequestPing { id: keepalive_ping_id() }),
                    ..Default::default()
                };
                if let Err(err) = grpc_tx.send(ping).await {
                    // the receive loop will observe the underlying failure
                    debug!("keepalive ping not sent: {err}");
                    keepalive_open = false;
                }
            }
            queued = write_rx.recv(), if writes_open => {
                match queued {
                    Ok(write) => {
                        if let Err(err) = grpc_tx.send(write).await {
                            warn!("failed to send subscription write: {err}");
                            let _ = update_tx
                                .send(Err(LaserstreamError::WriteSend(err.to_string())))
                                .await;
                        }
                    }
                    // every handle is gone; nothing more will be queued
                    Err(_) => writes_open = false,
                }
            }
            incoming = stream.next() => {
                let Some(incoming) = incoming else {
                    return SessionOutcome::Ended;
                };
                let mut update = match incoming {
                    Ok(update) => update,
                    Err(status) => return SessionOutcome::Failed(classify_recv_error(status)),
                };

                match &update.update_oneof {
                    Some(UpdateOneof::Ping(_)) => {
                        // answered on the consumer's behalf, never forwarded
                        let pong = SubscribeRequest {
                            ping: Some(SubscribeRequestPing { id: 1 }),
                            ..Default::default()
                        };
                        if let Err(err) = grpc_tx.send(pong).await {
                            return SessionOutcome::Failed(
                                LaserstreamError::WriteSend(err.to_string()),
                            );
                        }
                        continue;
                    }
                    Some(UpdateOneof::Pong(_)) => continue,
                    _ => {}
                }

                if ctx.replay_enabled {
                    track_slot(&update, &ctx.tracked_slot);
                    if let Some(tag) = &ctx.internal_slot_sub_id {
                        if !scrub_internal_filters(&mut update, tag) {
                            continue;
                        }
                    }
                }

                ctx.made_progress.store(true, Ordering::Relaxed);
                if update_tx.send(Ok(update)).await.is_err() {
                    return SessionOutcome::Shutdown;
                }
            }
        }
    }
}

fn keepalive_ping_id() -> i32 {
    // opaque to the server; millisecond timestamp truncated to the wire type
    Utc::now().timestamp_millis() as i32
}

fn classify_recv_error(status: Status) -> LaserstreamError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded => LaserstreamError::StreamUnavailable(status),
        _ => LaserstreamError::StreamRecv(status),
    }
}

/// Record the latest slot observed on the wire. Block updates feed the
/// tracker too, covering consumers that never subscribed to slots.
fn track_slot(update: &SubscribeUpdate, tracked_slot: &AtomicU64) {
    match &update.update_oneof {
        Some(UpdateOneof::Slot(slot)) => tracked_slot.store(slot.slot, Ordering::Relaxed),
        Some(UpdateOneof::Block(block)) => tracked_slot.store(block.slot, Ordering::Relaxed),
        _ => {}
    }
}

/// Hide the slot-tracker bookkeeping from consumers: updates that exist only
/// because of the internal tag are dropped entirely, and the tag is stripped
/// from everything else.
fn scrub_internal_filters(update: &mut SubscribeUpdate, internal_tag: &str) -> bool {
    if update.filters.len() == 1 && update.filters[0] == internal_tag {
        return false;
    }
    update.filters.retain(|tag| tag != internal_tag);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use yellowstone_grpc_proto::geyser::{
        SubscribeUpdateAccount, SubscribeUpdateBlock, SubscribeUpdateSlot,
    };

    const INTERNAL: &str = "__internal_slot_tracker_ab12cd34";

    fn slot_update(slot: u64, filters: &[&str]) -> SubscribeUpdate {
        SubscribeUpdate {
            filters: filters.iter().map(|f| f.to_string()).collect(),
            update_oneof: Some(UpdateOneof::Slot(SubscribeUpdateSlot {
                slot,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn block_update(slot: u64, filters: &[&str]) -> SubscribeUpdate {
        SubscribeUpdate {
            filters: filters.iter().map(|f| f.to_string()).collect(),
            update_oneof: Some(UpdateOneof::Block(SubscribeUpdateBlock {
                slot,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    #[test]
    fn internal_only_update_is_suppressed() {
        let mut update = slot_update(10, &[INTERNAL]);
        assert!(!scrub_internal_filters(&mut update, INTERNAL));
    }

    #[test]
    fn internal_tag_is_stripped_preserving_order() {
        let mut update = slot_update(10, &["user-a", INTERNAL, "user-b"]);
        assert!(scrub_internal_filters(&mut update, INTERNAL));
        assert_eq!(update.filters, vec!["user-a", "user-b"]);
    }

    #[test]
    fn updates_without_internal_tag_are_untouched() {
        let mut update = slot_update(10, &["user-slots"]);
        assert!(scrub_internal_filters(&mut update, INTERNAL));
        assert_eq!(update.filters, vec!["user-slots"]);
    }

    #[test]
    fn a_user_tag_equal_in_length_is_not_confused_with_the_internal_one() {
        let mut update = slot_update(10, &["__internal_slot_tracker_zzzzzzzz"]);
        assert!(scrub_internal_filters(&mut update, INTERNAL));
        assert_eq!(update.filters.len(), 1);
    }

    #[test]
    fn slot_updates_feed_the_tracker() {
        let tracked = AtomicU64::new(0);
        track_slot(&slot_update(1000, &["user-slots"]), &tracked);
        assert_eq!(tracked.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn block_updates_feed_the_tracker_as_fallback() {
        let tracked = AtomicU64::new(17);
        track_slot(&block_update(1234, &["blocks"]), &tracked);
        assert_eq!(tracked.load(Ordering::Relaxed), 1234);
    }

    #[test]
    fn other_updates_leave_the_tracker_alone() {
        let tracked = AtomicU64::new(55);
        let update = SubscribeUpdate {
            filters: vec!["accounts".to_string()],
            update_oneof: Some(UpdateOneof::Account(SubscribeUpdateAccount::default())),
            ..Default::default()
        };
        track_slot(&update, &tracked);
        assert_eq!(tracked.load(Ordering::Relaxed), 55);
    }

    #[test]
    fn tracker_stores_the_last_observed_value() {
        let tracked = AtomicU64::new(0);
        track_slot(&slot_update(1000, &[]), &tracked);
        track_slot(&slot_update(998, &[]), &tracked);
        assert_eq!(tracked.load(Ordering::Relaxed), 998);
    }

    #[test]
    fn unavailable_and_deadline_map_to_stream_unavailable() {
        assert!(matches!(
            classify_recv_error(Status::unavailable("gone")),
            LaserstreamError::StreamUnavailable(_)
        ));
        assert!(matches!(
            classify_recv_error(Status::deadline_exceeded("late")),
            LaserstreamError::StreamUnavailable(_)
        ));
        assert!(matches!(
            classify_recv_error(Status::internal("boom")),
            LaserstreamError::StreamRecv(_)
        ));
    }
}
