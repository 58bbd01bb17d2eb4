//! Configuration loading and validation.
//!
//! One file (JSON, TOML or YAML, chosen by extension) is layered over the
//! built-in defaults, then environment variables are applied on top:
//!
//! - `SHELF_` prefixed variables, with `__` separating nested keys
//!   (`SHELF_SERVER__PORT=9000`, `SHELF_SECURITY__RATE_LIMIT__ENABLED=false`);
//! - `PORT` and `UPLOAD_DIR`;
//! - the variable named by `security.api_key_env` (default `API_KEY`), which
//!   replaces `security.default_api_key`.

pub mod error;
mod sections;
mod validate;

pub use crate::sections::{
    CategoryConfig, ConcurrencyConfig, LogFormat, LoggingConfig, RateLimitConfig, SecurityConfig, ServerConfig,
    StorageConfig, TextConfig,
};

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use shelf_limits::RateLimitSettings;
use shelf_storage::{Category, StoreSettings};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The API key shipped in the defaults. Running with it is allowed, but loud.
pub const DEFAULT_API_KEY: &str = "changeme";

/// File names probed when no configuration file is given explicitly.
const CANDIDATES: [&str; 4] = ["config.json", "config.toml", "config.yaml", "config.yml"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub categories: BTreeMap<String, CategoryConfig>,
    pub allowed_extensions: Vec<String>,
    pub security: SecurityConfig,
    pub concurrency: ConcurrencyConfig,
    pub text: TextConfig,
    pub logging: LoggingConfig,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            categories: BTreeMap::new(),
            allowed_extensions: vec![".zip".to_string()],
            security: SecurityConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            text: TextConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load, apply environment overrides, and validate.
    ///
    /// With no explicit `path`, the working directory and then the user's
    /// configuration directory are searched; if nothing is found, only the
    /// defaults and the environment are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => discover(),
        };
        match &path {
            Some(path) => tracing::debug!(path = %path.display(), "Loading configuration"),
            None => tracing::debug!("No configuration file found, using defaults and environment"),
        }
        let mut config = Self::from_figment(Self::figment(path.as_deref())?)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the file at `path` (if any), then `SHELF_` variables.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = match path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref() {
                Some("json") => figment.merge(Json::file(path)),
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed("SHELF_").split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment.extract().or_raise(|| ErrorKind::Parse)
    }

    /// Apply the unprefixed environment overrides. `lookup` returns the value
    /// of a variable, if set.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());
        if let Some(port) = lookup("PORT") {
            self.server.port = port;
        }
        if let Some(upload_dir) = lookup("UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(upload_dir);
        }
        if !self.security.api_key_env.is_empty()
            && let Some(api_key) = lookup(&self.security.api_key_env)
        {
            self.security.default_api_key = api_key;
        }
    }

    /// The listening port. Only meaningful after validation.
    pub fn port(&self) -> u16 {
        self.server.port.trim().parse().unwrap_or(8080)
    }

    pub fn api_key(&self) -> &str {
        &self.security.default_api_key
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.security.default_api_key == DEFAULT_API_KEY
    }

    pub fn max_upload_size(&self) -> u64 {
        self.storage.max_upload_size_gb.saturating_mul(1024 * 1024 * 1024)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.storage.upload_dir.join(&self.storage.temp_dir)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.storage.upload_dir.join(&self.storage.stats_file)
    }

    pub fn stats_flush_interval(&self) -> Duration {
        Duration::from_secs(self.storage.stats_flush_interval_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout_minutes.saturating_mul(60))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.server.write_timeout_minutes.saturating_mul(60))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_seconds)
    }

    pub fn download_buffer_size(&self) -> usize {
        self.concurrency.download_buffer_size_kb.max(1) * 1024
    }

    /// Names of the enabled categories, sorted.
    pub fn enabled_categories(&self) -> impl Iterator<Item = (&String, &CategoryConfig)> {
        self.categories.iter().filter(|(_, category)| category.enabled)
    }

    /// What the storage engine needs to know. Disabled categories are left
    /// out entirely.
    pub fn store_settings(&self) -> StoreSettings {
        let settings = StoreSettings::new(&self.storage.upload_dir)
            .with_temp_dir(self.temp_dir())
            .with_extensions(&self.allowed_extensions);
        self.enabled_categories().fold(settings, |settings, (name, category)| {
            let display_name = if category.display_name.is_empty() { name } else { &category.display_name };
            settings.with_category(
                Category::new(name, category.max_files)
                    .with_display_name(display_name)
                    .with_description(&category.description),
            )
        })
    }

    /// Rate limiter settings, or `None` when rate limiting is disabled.
    pub fn rate_limit(&self) -> Option<RateLimitSettings> {
        let rate_limit = &self.security.rate_limit;
        rate_limit.enabled.then(|| RateLimitSettings {
            requests_per_minute: rate_limit.requests_per_minute,
            burst: rate_limit.burst_size,
            cleanup: Duration::from_secs(rate_limit.cleanup_minutes.max(1) * 60),
        })
    }
}

/// First configuration file found in the working directory, then in the
/// platform configuration directory.
fn discover() -> Option<PathBuf> {
    let local = CANDIDATES.iter().map(PathBuf::from);
    let user = ProjectDirs::from("", "", "shelf")
        .map(|dirs| CANDIDATES.iter().map(|name| dirs.config_dir().join(name)).collect::<Vec<_>>())
        .unwrap_or_default();
    local.chain(user).find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const JSON: &str = r#"{
        "server": { "port": "8080" },
        "storage": { "upload_dir": "./uploads", "max_upload_size_gb": 2 },
        "categories": {
            "vanilla": { "enabled": true, "max_files": 3, "display_name": "Vanilla", "description": "No GApps" },
            "gapps": { "enabled": true, "max_files": 2 },
            "beta": { "enabled": false, "max_files": 1 }
        },
        "allowed_extensions": [".zip"],
        "security": { "api_key_env": "ROM_API_KEY", "default_api_key": "changeme" },
        "concurrency": { "worker_pool_size": 4 }
    }"#;

    #[test]
    fn loads_json_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("config.json", JSON)?;
            let config = Config::from_figment(Config::figment(Some(Path::new("config.json"))).unwrap()).unwrap();

            assert_eq!(config.port(), 8080);
            assert_eq!(config.max_upload_size(), 2 * 1024 * 1024 * 1024);
            assert_eq!(config.storage.temp_dir, PathBuf::from("temp"));
            assert_eq!(config.concurrency.max_concurrent_downloads, 100);
            assert_eq!(config.security.rate_limit.burst_size, 10);
            assert_eq!(config.logging.format, LogFormat::Compact);
            assert!(config.uses_default_api_key());
            config.validate().unwrap();
            Ok(())
        });
    }

    #[test]
    fn loads_toml_and_prefixed_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                allowed_extensions = [".zip", ".img"]
                [storage]
                upload_dir = "/srv/shelf"
                [categories.vanilla]
                max_files = 5
                "#,
            )?;
            jail.set_env("SHELF_SERVER__PORT", 9000);
            jail.set_env("SHELF_SECURITY__RATE_LIMIT__ENABLED", false);
            let config = Config::from_figment(Config::figment(Some(Path::new("config.toml"))).unwrap()).unwrap();

            assert_eq!(config.port(), 9000);
            assert!(config.rate_limit().is_none());
            assert_eq!(config.categories["vanilla"].max_files, 5);
            assert!(config.categories["vanilla"].enabled);
            config.validate().unwrap();
            Ok(())
        });
    }

    #[test]
    fn older_server_sections_still_load() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                "server:\n  port: 8081\n  write_timeout_minutes: 5\n  idle_timeout_seconds: 120\nstorage:\n  upload_dir: ./uploads\n",
            )?;
            let config = Config::from_figment(Config::figment(Some(Path::new("config.yaml"))).unwrap()).unwrap();

            assert_eq!(config.port(), 8081);
            assert_eq!(config.write_timeout(), Duration::from_secs(300));
            assert_eq!(config.read_timeout(), Duration::from_secs(30 * 60));
            Ok(())
        });
    }

    #[test]
    fn unsupported_extension() {
        let err = Config::figment(Some(Path::new("config.ini"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[test]
    fn missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.json"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn legacy_env_overrides() {
        let mut config = Config::default();
        config.security.api_key_env = "DEPLOY_KEY".to_string();
        let env = BTreeMap::from([
            ("PORT", "9090"),
            ("UPLOAD_DIR", "/data/uploads"),
            ("DEPLOY_KEY", "s3cret"),
            ("API_KEY", "ignored"),
        ]);
        config.apply_env_overrides(|name| env.get(name).map(|value| value.to_string()));

        assert_eq!(config.server.port, "9090");
        assert_eq!(config.storage.upload_dir, PathBuf::from("/data/uploads"));
        assert_eq!(config.api_key(), "s3cret");
        assert!(!config.uses_default_api_key());
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|_| Some(String::new()));
        assert_eq!(config.server.port, "8080");
        assert_eq!(config.api_key(), DEFAULT_API_KEY);
    }

    #[test]
    fn store_settings_skip_disabled_categories() {
        Jail::expect_with(|jail| {
            jail.create_file("config.json", JSON)?;
            let config = Config::from_figment(Config::figment(Some(Path::new("config.json"))).unwrap()).unwrap();
            let settings = config.store_settings();

            let names: Vec<_> = settings.categories.iter().map(|category| category.name.as_str()).collect();
            assert_eq!(names, vec!["gapps", "vanilla"]);
            assert_eq!(settings.category("gapps").unwrap().display_name, "gapps");
            assert_eq!(settings.category("vanilla").unwrap().description, "No GApps");
            assert_eq!(settings.temp_dir, PathBuf::from("./uploads/temp"));
            assert_eq!(config.stats_path(), PathBuf::from("./uploads/stats.json"));
            Ok(())
        });
    }
}
