use std::{env, fs::File, io::Read};

use serde::{Deserialize, Deserializer};

/// Connection settings for one Laserstream endpoint.
#[derive(Clone, Debug, Default, serde_derive::Deserialize)]
pub struct LaserstreamConfig {
    /// `scheme://host[:port]` or plain `host[:port]`; TLS is always used and a
    /// missing port defaults to 443.
    #[serde(deserialize_with = "serde_string_or_env")]
    pub endpoint: String,
    /// Sent as `x-token` metadata on every stream.
    #[serde(deserialize_with = "serde_string_or_env")]
    pub api_key: String,
    /// Hard-capped at 240 attempts (20 minutes at the fixed 5s interval);
    /// 0 or absent means the cap itself.
    pub max_reconnect_attempts: Option<u32>,
    /// Resume from the last tracked slot on reconnect. Default: true.
    pub replay: Option<bool>,
    pub channel_options: Option<ChannelOptions>,
}

impl LaserstreamConfig {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            endpoint,
            api_key,
            ..Default::default()
        }
    }
}

/// gRPC channel tuning. Unset fields fall back to the documented defaults.
#[derive(Clone, Debug, Default, serde_derive::Deserialize)]
pub struct ChannelOptions {
    pub connect_timeout_secs: Option<u64>,
    /// Floor for the connect timeout when `connect_timeout_secs` is unset.
    pub min_connect_timeout_secs: Option<u64>,
    /// Default: 1 GiB.
    pub max_recv_msg_bytes: Option<usize>,
    /// Default: 32 MiB.
    pub max_send_msg_bytes: Option<usize>,
    /// HTTP/2 keepalive interval. Default: 30s.
    pub keepalive_time_secs: Option<u64>,
    /// Default: 5s.
    pub keepalive_timeout_secs: Option<u64>,
    /// Keepalive even without active streams. Default: true.
    pub permit_without_stream: Option<bool>,
    /// Default: 4 MiB.
    pub initial_stream_window_bytes: Option<u32>,
    /// Default: 8 MiB.
    pub initial_conn_window_bytes: Option<u32>,
    /// Default: 64 KiB.
    pub write_buffer_bytes: Option<usize>,
    /// Default: 64 KiB.
    pub read_buffer_bytes: Option<usize>,
    /// Compression applied to requests we send; gzip and zstd responses are
    /// always accepted. Default: none.
    pub compression: Option<CompressionMode>,
}

impl ChannelOptions {
    pub fn with_gzip_compression(mut self) -> Self {
        self.compression = Some(CompressionMode::Gzip);
        self
    }

    pub fn with_zstd_compression(mut self) -> Self {
        self.compression = Some(CompressionMode::Zstd);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde_derive::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// What the tester binary subscribes to; filter tags are derived from the
/// entries (`accounts`, `owner_<pubkey>`, ...).
#[derive(Clone, Debug, Default, serde_derive::Deserialize)]
pub struct SubscriptionConfig {
    /// `processed`, `confirmed` or `finalized`. Default: processed.
    pub commitment: Option<String>,
    pub accounts: Vec<String>,
    pub owners: Vec<String>,
    pub include_slots: Option<bool>,
    pub include_block_meta: Option<bool>,
}

#[derive(Clone, Debug, Default, serde_derive::Deserialize)]
pub struct Config {
    pub source: LaserstreamConfig,
    pub subscription: SubscriptionConfig,
}

impl Config {
    pub fn load(path: &String) -> Result<Config, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        match toml::from_str(&contents) {
            Ok(c) => Ok(c),
            Err(e) => Err(anyhow::Error::new(e)),
        }
    }
}

/// Get a string content, or the content of an Env variable if the string
/// starts with $
///
/// Example:
///  - "abc" -> "abc"
///  - "$something" -> read env variable named something and return its content
///
/// *WARNING*: May kill the program if we are asking for an environment
/// variable that does not exist
pub fn serde_string_or_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value_or_env = String::deserialize(deserializer)?;
    Ok(string_or_env(value_or_env))
}

pub fn string_or_env(value_or_env: String) -> String {
    match value_or_env.strip_prefix('$') {
        Some(var) => {
            env::var(var).unwrap_or_else(|_| panic!("reading `{var}` from env"))
        }
        None => value_or_env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_or_env_passes_plain_values_through() {
        assert_eq!(string_or_env("abc".to_string()), "abc");
        assert_eq!(string_or_env("".to_string()), "");
    }

    #[test]
    fn string_or_env_reads_from_env() {
        env::set_var("LASERSTREAM_CONFIG_LIB_TEST_VAR", "resolved");
        assert_eq!(
            string_or_env("$LASERSTREAM_CONFIG_LIB_TEST_VAR".to_string()),
            "resolved"
        );
    }

    #[test]
    fn parses_minimal_source_config() {
        let cfg: Config = toml::from_str(
            r#"
            [source]
            endpoint = "https://laserstream.example.org"
            api_key = "secret"

            [subscription]
            accounts = []
            owners = []
            "#,
        )
        .unwrap();
        assert_eq!(cfg.source.endpoint, "https://laserstream.example.org");
        assert_eq!(cfg.source.api_key, "secret");
        assert!(cfg.source.replay.is_none());
        assert!(cfg.source.channel_options.is_none());
    }

    #[test]
    fn parses_channel_options_with_compression() {
        let cfg: Config = toml::from_str(
            r#"
            [source]
            endpoint = "laserstream.example.org:4003"
            api_key = "secret"
            max_reconnect_attempts = 12
            replay = false

            [source.channel_options]
            connect_timeout_secs = 20
            max_recv_msg_bytes = 536870912
            compression = "zstd"

            [subscription]
            accounts = ["So11111111111111111111111111111111111111112"]
            owners = []
            include_slots = true
            "#,
        )
        .unwrap();
        let options = cfg.source.channel_options.unwrap();
        assert_eq!(options.connect_timeout_secs, Some(20));
        assert_eq!(options.max_recv_msg_bytes, Some(536870912));
        assert_eq!(options.compression, Some(CompressionMode::Zstd));
        assert_eq!(cfg.source.max_reconnect_attempts, Some(12));
        assert_eq!(cfg.source.replay, Some(false));
        assert_eq!(cfg.subscription.include_slots, Some(true));
    }
}
