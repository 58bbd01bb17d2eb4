use crate::Config;
use crate::error::{ErrorKind, Result};
use shelf_storage::{Format, is_safe_component};
use std::path::Path;

fn invalid(reason: impl Into<String>) -> ErrorKind {
    ErrorKind::Invalid(reason.into())
}

impl Config {
    /// Check everything the server relies on at startup.
    pub fn validate(&self) -> Result<()> {
        let port = self.server.port.trim();
        if port.is_empty() {
            exn::bail!(invalid("server port is required"));
        }
        if port.parse::<u16>().is_err() {
            exn::bail!(invalid(format!("server port must be a number between 0 and 65535, got {port:?}")));
        }

        if self.storage.upload_dir.as_os_str().is_empty() {
            exn::bail!(invalid("upload directory is required"));
        }
        if self.storage.temp_dir.as_os_str().is_empty() {
            exn::bail!(invalid("temp directory must not be empty"));
        }

        if self.categories.is_empty() {
            exn::bail!(invalid("at least one category must be defined"));
        }
        for (name, category) in &self.categories {
            if !is_safe_component(name) {
                exn::bail!(invalid(format!("category name {name:?} must be a plain directory name")));
            }
            if Path::new(name) == self.storage.temp_dir || Path::new(name) == self.storage.stats_file {
                exn::bail!(invalid(format!("category {name} collides with the temp directory or stats file")));
            }
            if category.max_files < 1 {
                exn::bail!(invalid(format!("category {name} must allow at least 1 file")));
            }
        }

        if self.allowed_extensions.is_empty() {
            exn::bail!(invalid("at least one file extension must be allowed"));
        }
        for extension in &self.allowed_extensions {
            if Format::from_extension(extension).is_none() {
                exn::bail!(invalid(format!("extension {extension} has no known file signature")));
            }
        }

        if self.concurrency.max_concurrent_downloads < 1 {
            exn::bail!(invalid("max_concurrent_downloads must be at least 1"));
        }
        if self.concurrency.max_concurrent_uploads < 1 {
            exn::bail!(invalid("max_concurrent_uploads must be at least 1"));
        }

        let rate_limit = &self.security.rate_limit;
        if rate_limit.enabled && (rate_limit.requests_per_minute < 1 || rate_limit.burst_size < 1) {
            exn::bail!(invalid("rate limit requires requests_per_minute and burst_size of at least 1"));
        }
        Ok(())
    }
}
