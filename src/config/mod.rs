use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_address")]
    pub address: String,
    /// Prefix used when handing out artifact URLs in batch results.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Seconds a background production may run.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// Upper bound, in seconds, on how long any caller waits for a job.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: u64,
    #[serde(default = "default_max_image_size")]
    pub max_image_size: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_body_limit")]
    pub request_body_limit: u64,
}

impl AppConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            public_url: default_public_url(),
            cache_capacity: default_cache_capacity(),
            fetch_timeout: default_fetch_timeout(),
            wait_timeout: default_wait_timeout(),
            max_image_size: default_max_image_size(),
            jpeg_quality: default_jpeg_quality(),
            user_agent: default_user_agent(),
            request_body_limit: default_request_body_limit(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_wait_timeout() -> u64 {
    10
}

fn default_max_image_size() -> usize {
    15 * 1024 * 1024
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_user_agent() -> String {
    format!("resizn/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_body_limit() -> u64 {
    8 * 1024
}
