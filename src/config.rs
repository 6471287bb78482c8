use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default = "default_max_concurrent_transcodes")]
    pub max_concurrent_transcodes: usize,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_stream_key_ttl")]
    pub stream_key_ttl: u64,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            hls: HlsConfig::default(),
            max_concurrent_transcodes: default_max_concurrent_transcodes(),
            ffmpeg_path: default_ffmpeg_path(),
            stream_key_ttl: default_stream_key_ttl(),
            chat: ChatConfig::default(),
        }
    }
}

fn default_max_concurrent_transcodes() -> usize {
    4
}

fn default_ffmpeg_path() -> String {
    "/usr/bin/ffmpeg".to_string()
}

fn default_stream_key_ttl() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct HlsConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            segment_duration: default_segment_duration(),
            playlist_size: default_playlist_size(),
        }
    }
}

fn default_storage_path() -> String {
    "/tmp/fabriq-hls".to_string()
}

fn default_segment_duration() -> u32 {
    4
}

fn default_playlist_size() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_slow_mode_seconds")]
    pub slow_mode_seconds: u64,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            slow_mode_seconds: default_slow_mode_seconds(),
            max_message_length: default_max_message_length(),
        }
    }
}

fn default_slow_mode_seconds() -> u64 {
    0
}

fn default_max_message_length() -> usize {
    500
}
