use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cirrus_types::{CirrusError, Result};

const SUPPORTED_VERSION: u32 = 1;

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

fn default_cache_size_gb() -> u64 {
    10
}

fn default_chunk_mb() -> u64 {
    8
}

fn default_clean_interval_min() -> u64 {
    30
}

fn default_connect_timeout_sec() -> u64 {
    10
}

fn default_retry_interval_sec() -> u64 {
    15
}

fn default_max_retry_sec() -> u64 {
    300
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_failsafe_enable() -> bool {
    true
}

fn default_disk_min_free_percent() -> u32 {
    10
}

/// On-disk cache behaviour, loaded from `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Root directory; empty means `~/.cirrusfs/cache/<disk_id>`.
    #[serde(default)]
    pub cache_dir: String,
    #[serde(default = "default_cache_size_gb")]
    pub cache_size_gb: u64,
    /// Preferred chunk granularity for range caching.
    #[serde(default = "default_chunk_mb")]
    pub chunk_mb: u64,
    #[serde(default = "default_clean_interval_min")]
    pub clean_interval_min: u64,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub fail_safe: FailSafeConfig,
}

/// Write-back uploader tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_connect_timeout_sec")]
    pub connect_timeout_sec: u64,
    /// Base backoff delay between retries.
    #[serde(default = "default_retry_interval_sec")]
    pub retry_interval_sec: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_retry_sec")]
    pub max_retry_sec: u64,
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: default_connect_timeout_sec(),
            retry_interval_sec: default_retry_interval_sec(),
            max_retry_sec: default_max_retry_sec(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

/// ENOSPC protection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailSafeConfig {
    #[serde(default = "default_failsafe_enable")]
    pub enable: bool,
    /// Free-space floor as a percentage of the cache filesystem.
    #[serde(default = "default_disk_min_free_percent")]
    pub disk_min_free_percent: u32,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            enable: default_failsafe_enable(),
            disk_min_free_percent: default_disk_min_free_percent(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            cache_dir: String::new(),
            cache_size_gb: default_cache_size_gb(),
            chunk_mb: default_chunk_mb(),
            clean_interval_min: default_clean_interval_min(),
            upload: UploadConfig::default(),
            fail_safe: FailSafeConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load the config from `path`.
    ///
    /// When the file does not exist, a commented template is written in its
    /// place and `ConfigMissing` is returned so the host can point the
    /// operator at the file it now has to edit.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_template(path)?;
                return Err(CirrusError::ConfigMissing);
            }
            Err(e) => return Err(e.into()),
        };

        let mut cfg: CacheConfig = serde_yaml::from_str(&raw).map_err(|e| {
            CirrusError::Validation(vec![format!(
                "invalid config '{}': {e}",
                path.display()
            )])
        })?;

        cfg.apply_defaults();
        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(CirrusError::Validation(issues));
        }

        Ok(cfg)
    }

    /// Fill zero-valued numeric fields with their defaults, the same way an
    /// absent key would. Runs before validation on load, so an empty file
    /// (or an explicit zero) validates.
    pub fn apply_defaults(&mut self) {
        if self.version == 0 {
            self.version = default_version();
        }
        if self.cache_size_gb == 0 {
            self.cache_size_gb = default_cache_size_gb();
        }
        if self.chunk_mb == 0 {
            self.chunk_mb = default_chunk_mb();
        }
        if self.clean_interval_min == 0 {
            self.clean_interval_min = default_clean_interval_min();
        }
        if self.upload.connect_timeout_sec == 0 {
            self.upload.connect_timeout_sec = default_connect_timeout_sec();
        }
        if self.upload.retry_interval_sec == 0 {
            self.upload.retry_interval_sec = default_retry_interval_sec();
        }
        if self.upload.max_retry_sec == 0 {
            self.upload.max_retry_sec = default_max_retry_sec();
        }
        if self.upload.max_concurrent_uploads == 0 {
            self.upload.max_concurrent_uploads = default_max_concurrent_uploads();
        }
        if self.fail_safe.disk_min_free_percent == 0 {
            self.fail_safe.disk_min_free_percent = default_disk_min_free_percent();
        }
    }

    /// Collect every validation issue rather than stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.version != SUPPORTED_VERSION {
            issues.push(format!("version must be {SUPPORTED_VERSION}"));
        }
        if self.cache_size_gb == 0 {
            issues.push("cache_size_gb must be > 0".into());
        }
        if self.chunk_mb == 0 {
            issues.push("chunk_mb must be > 0".into());
        }
        if self.clean_interval_min == 0 {
            issues.push("clean_interval_min must be > 0".into());
        }
        if self.upload.connect_timeout_sec == 0 {
            issues.push("upload.connect_timeout_sec must be > 0".into());
        }
        if self.upload.retry_interval_sec == 0 {
            issues.push("upload.retry_interval_sec must be > 0".into());
        }
        if self.upload.max_retry_sec < self.upload.retry_interval_sec {
            issues.push("upload.max_retry_sec must be >= upload.retry_interval_sec".into());
        }
        if self.upload.max_concurrent_uploads == 0 {
            issues.push("upload.max_concurrent_uploads must be > 0".into());
        }
        if self.fail_safe.disk_min_free_percent == 0 || self.fail_safe.disk_min_free_percent > 100
        {
            issues.push("fail_safe.disk_min_free_percent must be in (0,100]".into());
        }

        issues
    }

    /// Resolve the cache root against the current user's home directory.
    pub fn resolve_cache_dir(&self, disk_id: &str) -> Result<PathBuf> {
        if !self.cache_dir.is_empty() {
            return Ok(PathBuf::from(&self.cache_dir));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| CirrusError::Other("cannot resolve home directory".into()))?;
        Ok(self.effective_cache_dir(&home, disk_id))
    }

    /// Resolve the cache root: explicit `cache_dir` wins, otherwise
    /// `<home>/.cirrusfs/cache/<disk_id>`.
    pub fn effective_cache_dir(&self, home: &Path, disk_id: &str) -> PathBuf {
        if !self.cache_dir.is_empty() {
            return PathBuf::from(&self.cache_dir);
        }
        let base = home.join(".cirrusfs").join("cache");
        if disk_id.is_empty() {
            base
        } else {
            base.join(disk_id)
        }
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.cache_size_gb * 1024 * 1024 * 1024
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_mb * 1024 * 1024
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_min * 60)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.upload.retry_interval_sec)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.upload.max_retry_sec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.connect_timeout_sec)
    }
}

/// Commented YAML template written on first run.
pub fn config_template() -> &'static str {
    r#"# cirrus persistent cache configuration
version: 1
# cache_dir:
cache_size_gb: 10
chunk_mb: 8
clean_interval_min: 30
upload:
  connect_timeout_sec: 10
  retry_interval_sec: 15
  max_retry_sec: 300
  max_concurrent_uploads: 4
fail_safe:
  enable: true
  disk_min_free_percent: 10
"#
}

fn write_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, config_template())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
