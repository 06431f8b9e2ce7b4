use std::env;

use anyhow::Context;
use itertools::Itertools;
use laserstream_config_lib::{Config, SubscriptionConfig};
use laserstream_feed_lib::client::subscribe;
use tracing::{info, warn};
use yellowstone_grpc_proto::geyser::{
    subscribe_update::UpdateOneof, CommitmentLevel, SubscribeRequest,
    SubscribeRequestFilterAccounts, SubscribeRequestFilterBlocksMeta, SubscribeRequestFilterSlots,
    SubscribeUpdate,
};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    laserstream_feed_lib::utils::tracing_subscriber_init();

    let config_path = env::args()
        .nth(1)
        .context("usage: laserstream-tester <config.toml>")?;
    let config = Config::load(&config_path)?;

    let request = build_subscribe_request(&config.subscription)?;
    info!("starting laserstream-tester against {}", config.source.endpoint);
    let (updates, handle) = subscribe(config.source, request)?;

    let closer = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("listening for ctrl-c");
        info!("shutting down laserstream-tester...");
        closer.close();
    });

    while let Ok(item) = updates.recv().await {
        match item {
            Ok(update) => log_update(&update),
            Err(err) => warn!("stream reported: {err}"),
        }
    }

    info!("DONE.");
    Ok(())
}

fn parse_commitment(value: &str) -> anyhow::Result<CommitmentLevel> {
    match value {
        "processed" => Ok(CommitmentLevel::Processed),
        "confirmed" => Ok(CommitmentLevel::Confirmed),
        "finalized" => Ok(CommitmentLevel::Finalized),
        other => anyhow::bail!("unsupported commitment level `{other}`"),
    }
}

fn build_subscribe_request(subscription: &SubscriptionConfig) -> anyhow::Result<SubscribeRequest> {
    let mut request = SubscribeRequest::default();

    if let Some(commitment) = &subscription.commitment {
        request.commitment = Some(parse_commitment(commitment)? as i32);
    }
    if !subscription.accounts.is_empty() {
        request.accounts.insert(
            "accounts".to_string(),
            SubscribeRequestFilterAccounts {
                account: subscription.accounts.clone(),
                ..Default::default()
            },
        );
    }
    for owner in &subscription.owners {
        request.accounts.insert(
            format!("owner_{owner}"),
            SubscribeRequestFilterAccounts {
                owner: vec![owner.clone()],
                ..Default::default()
            },
        );
    }
    if subscription.include_slots.unwrap_or(false) {
        request.slots.insert(
            "slots".to_string(),
            SubscribeRequestFilterSlots::default(),
        );
    }
    if subscription.include_block_meta.unwrap_or(false) {
        request.blocks_meta.insert(
            "block_meta".to_string(),
            SubscribeRequestFilterBlocksMeta::default(),
        );
    }

    Ok(request)
}

fn log_update(update: &SubscribeUpdate) {
    let filters = update.filters.iter().join(",");
    match &update.update_oneof {
        Some(UpdateOneof::Account(account)) => {
            let pubkey = account
                .account
                .as_ref()
                .map(|info| bs58::encode(&info.pubkey).into_string())
                .unwrap_or_default();
            info!(
                "account update [{}] slot={} pubkey={}",
                filters, account.slot, pubkey
            );
        }
        Some(UpdateOneof::Slot(slot)) => {
            info!("slot update [{}] slot={}", filters, slot.slot);
        }
        Some(UpdateOneof::Transaction(tx)) => {
            info!("transaction update [{}] slot={}", filters, tx.slot);
        }
        Some(UpdateOneof::TransactionStatus(tx)) => {
            info!("transaction status [{}] slot={}", filters, tx.slot);
        }
        Some(UpdateOneof::Block(block)) => {
            info!(
                "block update [{}] slot={} transactions={}",
                filters,
                block.slot,
                block.transactions.len()
            );
        }
        Some(UpdateOneof::BlockMeta(meta)) => {
            info!("block meta [{}] slot={}", filters, meta.slot);
        }
        Some(UpdateOneof::Entry(entry)) => {
            info!("entry [{}] slot={}", filters, entry.slot);
        }
        // answered or swallowed inside the feed lib
        Some(UpdateOneof::Ping(_)) | Some(UpdateOneof::Pong(_)) => {}
        None => warn!("update without payload"),
    }
}
