use thiserror::Error;
use yellowstone_grpc_proto::tonic::Status;

#[derive(Debug, Error)]
pub enum LaserstreamError {
    #[error("invalid endpoint `{0}`: {1}")]
    InvalidEndpoint(String, String),

    #[error("api key is missing")]
    MissingApiKey,

    #[error("api key is not a valid metadata value")]
    InvalidApiKey,

    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: yellowstone_grpc_proto::tonic::transport::Error,
    },

    #[error("failed to open subscribe stream: {0}")]
    SubscribeOpen(Status),

    #[error("failed to send subscription request")]
    SubscribeSend,

    #[error("stream unavailable: {0}")]
    StreamUnavailable(Status),

    #[error("stream error: {0}")]
    StreamRecv(Status),

    #[error("subscription write failed: {0}")]
    WriteSend(String),

    #[error("write timeout: channel full")]
    WriteTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("Connection failed after {attempts} attempts: {cause}")]
    ReconnectExhausted { attempts: u32, cause: String },
}
