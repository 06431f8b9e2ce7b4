use std::time::Duration;

use laserstream_config_lib::ChannelOptions;
use url::Url;
use yellowstone_grpc_proto::tonic::{
    metadata::{AsciiMetadataValue, MetadataValue},
    transport::{Channel, ClientTlsConfig, Endpoint},
    Request, Status,
};

use crate::errors::LaserstreamError;

pub const SDK_NAME: &str = "laserstream-connector";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KEEPALIVE_TIME_SECS: u64 = 30;
const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_STREAM_WINDOW_BYTES: u32 = 4 * 1024 * 1024;
const DEFAULT_CONN_WINDOW_BYTES: u32 = 8 * 1024 * 1024;
const DEFAULT_BUFFER_BYTES: usize = 64 * 1024;

pub const DEFAULT_MAX_RECV_MSG_BYTES: usize = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_SEND_MSG_BYTES: usize = 32 * 1024 * 1024;

/// Reduce an endpoint string to the `https://host:port` target actually
/// dialed. The scheme of the input is advisory only; the connection always
/// uses TLS against the system trust store, and a missing port means 443.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, LaserstreamError> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(LaserstreamError::InvalidEndpoint(
            endpoint.to_string(),
            "endpoint is empty".to_string(),
        ));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url = Url::parse(trimmed).map_err(|e| {
            LaserstreamError::InvalidEndpoint(endpoint.to_string(), e.to_string())
        })?;
        let host = url.host_str().ok_or_else(|| {
            LaserstreamError::InvalidEndpoint(endpoint.to_string(), "missing host".to_string())
        })?;
        let port = url.port().unwrap_or(443);
        Ok(format!("https://{host}:{port}"))
    } else if trimmed.contains(':') {
        Ok(format!("https://{trimmed}"))
    } else {
        Ok(format!("https://{trimmed}:443"))
    }
}

/// Adds authentication and the informational SDK headers to every request on
/// the stream.
pub fn request_interceptor(
    x_token: AsciiMetadataValue,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |mut request: Request<()>| {
        request.metadata_mut().insert("x-token", x_token.clone());
        request
            .metadata_mut()
            .insert("x-sdk-name", MetadataValue::from_static(SDK_NAME));
        request
            .metadata_mut()
            .insert("x-sdk-version", MetadataValue::from_static(SDK_VERSION));
        Ok(request)
    }
}

pub async fn connect_channel(
    authority: &str,
    options: &ChannelOptions,
) -> Result<Channel, LaserstreamError> {
    let dial_error = |source| LaserstreamError::Dial {
        endpoint: authority.to_string(),
        source,
    };

    let connect_timeout = options
        .connect_timeout_secs
        .or(options.min_connect_timeout_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    // tonic exposes one h2 buffer knob; take the larger of the two configured sides
    let buffer_bytes = match (options.write_buffer_bytes, options.read_buffer_bytes) {
        (Some(write), Some(read)) => write.max(read),
        (Some(write), None) => write,
        (None, Some(read)) => read,
        (None, None) => DEFAULT_BUFFER_BYTES,
    };

    let endpoint = Endpoint::from_shared(authority.to_string())
        .map_err(dial_error)?
        .connect_timeout(Duration::from_secs(connect_timeout))
        .http2_keep_alive_interval(Duration::from_secs(
            options
                .keepalive_time_secs
                .unwrap_or(DEFAULT_KEEPALIVE_TIME_SECS),
        ))
        .keep_alive_timeout(Duration::from_secs(
            options
                .keepalive_timeout_secs
                .unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT_SECS),
        ))
        .keep_alive_while_idle(options.permit_without_stream.unwrap_or(true))
        .initial_stream_window_size(Some(
            options
                .initial_stream_window_bytes
                .unwrap_or(DEFAULT_STREAM_WINDOW_BYTES),
        ))
        .initial_connection_window_size(Some(
            options
                .initial_conn_window_bytes
                .unwrap_or(DEFAULT_CONN_WINDOW_BYTES),
        ))
        .buffer_size(Some(buffer_bytes))
        .tcp_nodelay(true)
        .http2_adaptive_window(true)
        .tls_config(ClientTlsConfig::new().with_native_roots())
        .map_err(dial_error)?;

    endpoint.connect().await.map_err(dial_error)
}
