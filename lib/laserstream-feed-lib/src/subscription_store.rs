use rand::distributions::Alphanumeric;
use rand::Rng;
use yellowstone_grpc_proto::geyser::{
    CommitmentLevel, SubscribeRequest, SubscribeRequestFilterSlots,
};

/// Consumers are documented not to use filter tags with this prefix.
pub const INTERNAL_SLOT_TRACKER_PREFIX: &str = "__internal_slot_tracker_";

const INTERNAL_TAG_SUFFIX_LEN: usize = 8;

/// Slots to rewind on a PROCESSED-commitment resume, covering a realistic
/// maximum re-org depth.
pub const PROCESSED_RESUME_REWIND_SLOTS: u64 = 31;

fn generate_internal_tag() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INTERNAL_TAG_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{INTERNAL_SLOT_TRACKER_PREFIX}{suffix}")
}

fn internal_slot_filter() -> SubscribeRequestFilterSlots {
    SubscribeRequestFilterSlots {
        filter_by_commitment: Some(true),
        interslot_updates: Some(false),
        ..Default::default()
    }
}

/// Single source of truth for the effective subscription: the consumer's
/// last-written filters merged with the internal slot tracker, plus the
/// resume hint set before each connection attempt.
pub struct SubscriptionStore {
    request: SubscribeRequest,
    internal_slot_sub_id: Option<String>,
}

impl SubscriptionStore {
    pub fn new(consumer_request: SubscribeRequest, replay_enabled: bool) -> Self {
        let mut request = consumer_request;
        let internal_slot_sub_id = if replay_enabled {
            let tag = generate_internal_tag();
            request.slots.insert(tag.clone(), internal_slot_filter());
            Some(tag)
        } else {
            request.from_slot = None;
            None
        };
        Self {
            request,
            internal_slot_sub_id,
        }
    }

    pub fn internal_slot_sub_id(&self) -> Option<&str> {
        self.internal_slot_sub_id.as_deref()
    }

    pub fn commitment(&self) -> Option<i32> {
        self.request.commitment
    }

    /// The request to send on the wire for the next (re)connect.
    pub fn snapshot(&self) -> SubscribeRequest {
        self.request.clone()
    }

    pub fn apply_resume(&mut self, from_slot: Option<u64>) {
        self.request.from_slot = from_slot;
    }

    /// Integrate a consumer write. Filter maps are upserted key-wise,
    /// `accounts_data_slice` is replaced wholesale (the server rejects
    /// overlapping slices, so accumulating across writes would poison every
    /// later reconnect), and scalar fields are taken when present. The
    /// internal slot tag always wins over consumer input.
    pub fn merge(&mut self, update: &SubscribeRequest) {
        let base = &mut self.request;

        base.accounts
            .extend(update.accounts.iter().map(|(k, v)| (k.clone(), v.clone())));
        base.slots
            .extend(update.slots.iter().map(|(k, v)| (k.clone(), v.clone())));
        base.transactions.extend(
            update
                .transactions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        base.transactions_status.extend(
            update
                .transactions_status
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        base.blocks
            .extend(update.blocks.iter().map(|(k, v)| (k.clone(), v.clone())));
        base.blocks_meta.extend(
            update
                .blocks_meta
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        base.entry
            .extend(update.entry.iter().map(|(k, v)| (k.clone(), v.clone())));

        if !update.accounts_data_slice.is_empty() {
            base.accounts_data_slice = update.accounts_data_slice.clone();
        }
        if let Some(commitment) = update.commitment {
            base.commitment = Some(commitment);
        }
        if let Some(from_slot) = update.from_slot {
            base.from_slot = Some(from_slot);
        }

        if let Some(tag) = &self.internal_slot_sub_id {
            base.slots.insert(tag.clone(), internal_slot_filter());
        }
    }
}

/// Compute the `from_slot` hint for the next connection attempt.
///
/// PROCESSED data may be re-org'd, so resume rewinds by the fork-depth
/// margin; CONFIRMED and FINALIZED resume exactly. Unknown commitment values
/// get the PROCESSED treatment.
pub fn plan_resume_slot(replay_enabled: bool, tracked_slot: u64, commitment: Option<i32>) -> Option<u64> {
    if !replay_enabled || tracked_slot == 0 {
        return None;
    }
    match commitment {
        Some(level)
            if level == CommitmentLevel::Confirmed as i32
                || level == CommitmentLevel::Finalized as i32 =>
        {
            Some(tracked_slot)
        }
        _ => Some(tracked_slot.saturating_sub(PROCESSED_RESUME_REWIND_SLOTS)),
    }
}
