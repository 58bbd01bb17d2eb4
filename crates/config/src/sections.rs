use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Accept both `"8080"` and `8080`. Environment values are parsed by type,
/// and older config files quote their port.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    /// Upper bound for reading a whole request, upload body included.
    pub read_timeout_minutes: u64,
    /// Upper bound for streaming a download to the client.
    pub write_timeout_minutes: u64,
    /// How long in-flight requests may run after a shutdown signal.
    pub shutdown_timeout_seconds: u64,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: "8080".to_string(),
            read_timeout_minutes: 30,
            write_timeout_minutes: 30,
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    /// Scratch directory, relative to the upload directory unless absolute.
    pub temp_dir: PathBuf,
    pub max_upload_size_gb: u64,
    /// Download counter file, relative to the upload directory unless absolute.
    pub stats_file: PathBuf,
    /// Minimum delay between writes of the download counters. Zero writes as
    /// soon as the writer wakes up.
    pub stats_flush_interval_seconds: u64,
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::new(),
            temp_dir: PathBuf::from("temp"),
            max_upload_size_gb: 5,
            stats_file: PathBuf::from("stats.json"),
            stats_flush_interval_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryConfig {
    pub enabled: bool,
    pub max_files: usize,
    pub display_name: String,
    pub description: String,
}
impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_files: 3,
            display_name: String::new(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub cleanup_minutes: u64,
}
impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            burst_size: 10,
            cleanup_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    #[serde(deserialize_with = "string_or_number")]
    pub default_api_key: String,
    /// Trust `X-Forwarded-For` and `X-Real-IP` when identifying clients.
    pub trust_proxy_headers: bool,
    pub rate_limit: RateLimitConfig,
}
impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key_env: "API_KEY".to_string(),
            default_api_key: crate::DEFAULT_API_KEY.to_string(),
            trust_proxy_headers: true,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_uploads: usize,
    pub download_buffer_size_kb: usize,
}
impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 100,
            max_concurrent_uploads: 20,
            download_buffer_size_kb: 64,
        }
    }
}

/// User-facing strings, served to the web pages through `/api/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub app_name: String,
    pub app_title: String,
    pub app_subtitle: String,
    pub device_name: String,
    pub admin_title: String,
    pub upload_success: String,
    pub upload_failed: String,
    pub file_too_large: String,
    pub invalid_file: String,
    pub unauthorized: String,
    pub no_files_found: String,
    pub copy_success: String,
    pub copy_failed: String,
    pub server_error: String,
}
impl Default for TextConfig {
    fn default() -> Self {
        Self {
            app_name: "Shelf".to_string(),
            app_title: "Build Downloads".to_string(),
            app_subtitle: "Latest builds, newest first".to_string(),
            device_name: String::new(),
            admin_title: "Upload Builds".to_string(),
            upload_success: "Upload complete".to_string(),
            upload_failed: "Upload failed".to_string(),
            file_too_large: "File is too large".to_string(),
            invalid_file: "Invalid file".to_string(),
            unauthorized: "Unauthorized".to_string(),
            no_files_found: "No builds available yet".to_string(),
            copy_success: "Link copied".to_string(),
            copy_failed: "Could not copy link".to_string(),
            server_error: "Internal server error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `shelf=debug,tower_http=info`.
    /// `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
    pub enable_request_logging: bool,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            enable_request_logging: true,
        }
    }
}
