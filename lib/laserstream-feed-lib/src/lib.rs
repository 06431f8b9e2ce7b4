pub mod client;
pub mod errors;
pub mod grpc_channel;
pub mod stream_session;
pub mod subscription_store;
pub mod utils;

pub use client::{subscribe, StreamHandle, UpdateReceiver};
pub use errors::LaserstreamError;
pub use laserstream_config_lib::{
    ChannelOptions, CompressionMode, LaserstreamConfig, SubscriptionConfig,
};
pub use subscription_store::INTERNAL_SLOT_TRACKER_PREFIX;

// vendor wire types, so consumers do not need their own proto dependency
pub use yellowstone_grpc_proto::geyser;
