//! Configuration types for toolgate
//!
//! Every field is optional in the on-disk form; missing fields take the
//! defaults documented on each section.

use crate::clock::{duration_secs, saturating_add};
use crate::error::{GatewayError, Result};
use base64::Engine;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Quota accounting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Hour,
    #[default]
    Day,
    Month,
}

impl QuotaPeriod {
    /// Next reset instant for a quota (re)started at `now`.
    ///
    /// Hours are rolling; days and months snap to the next calendar boundary (UTC).
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            QuotaPeriod::Hour => saturating_add(now, Duration::hours(1)),
            QuotaPeriod::Day => now
                .date_naive()
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| Utc.from_utc_datetime(&d))
                .unwrap_or_else(|| saturating_add(now, Duration::days(1))),
            QuotaPeriod::Month => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| Utc.from_utc_datetime(&d))
                    .unwrap_or_else(|| saturating_add(now, Duration::days(31)))
            }
        }
    }
}

/// What the rate limiter keys buckets on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientKeyMode {
    #[default]
    UserId,
    Credential,
    RemoteAddr,
}

/// Token-bucket rate limiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_requests: u32,
    /// Bucket capacity; defaults to `max_requests`
    pub max_burst: Option<u32>,
    /// Tokens per second; defaults to `max_requests / window_secs`
    pub refill_per_second: Option<f64>,
    /// Refund the token of calls that fail inside the tool
    pub skip_failed_requests: bool,
    /// Attach limit/remaining/resetAt/retryAfter to every response
    pub include_headers: bool,
    pub client_key: ClientKeyMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            max_requests: 60,
            max_burst: None,
            refill_per_second: None,
            skip_failed_requests: false,
            include_headers: true,
            client_key: ClientKeyMode::UserId,
        }
    }
}

impl RateLimitConfig {
    pub fn capacity(&self) -> f64 {
        f64::from(self.max_burst.unwrap_or(self.max_requests))
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_per_second
            .unwrap_or_else(|| f64::from(self.max_requests) / self.window_secs.max(1) as f64)
    }

    pub fn window(&self) -> Duration {
        duration_secs(self.window_secs)
    }
}

/// Default quota applied to callers without an explicit quota
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    pub default_limit: Option<u64>,
    pub default_period: QuotaPeriod,
}

/// Reconnection policy for encrypted channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Encrypted channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionConfig {
    pub algorithm: String,
    /// Automatic key rotation period; 0 disables the timer
    pub rotation_interval_secs: u64,
    /// How long the previous key still decrypts after a rotation
    pub grace_period_secs: u64,
    pub handshake_timeout_ms: u64,
    pub perfect_forward_secrecy: bool,
    /// Base64 32-byte key, required when forward secrecy is off
    pub pre_shared_key: Option<String>,
    /// Send ciphertext as binary frames instead of JSON `data` envelopes
    pub binary_frames: bool,
    pub reconnect: ReconnectConfig,
}

pub const SUPPORTED_ALGORITHM: &str = "AES-256-GCM";

/// Longest accepted rate-limit window (one week)
pub const MAX_WINDOW_SECS: u64 = 7 * 86_400;
/// Slowest accepted bucket refill, explicit or derived from the window
pub const MIN_REFILL_PER_SECOND: f64 = 1e-6;
/// Longest accepted key grace period (one day)
pub const MAX_GRACE_PERIOD_SECS: u64 = 86_400;
/// Longest accepted audit retention (ten years)
pub const MAX_RETENTION_DAYS: u32 = 3_650;

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: SUPPORTED_ALGORITHM.to_string(),
            rotation_interval_secs: 3600,
            grace_period_secs: 30,
            handshake_timeout_ms: 10_000,
            perfect_forward_secrecy: true,
            pre_shared_key: None,
            binary_frames: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl EncryptionConfig {
    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        duration_secs(self.grace_period_secs)
    }

    /// Decode the configured pre-shared key
    pub fn decode_pre_shared_key(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = &self.pre_shared_key else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| GatewayError::Config(format!("preSharedKey is not valid base64: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            GatewayError::Config("preSharedKey must decode to exactly 32 bytes".to_string())
        })?;
        Ok(Some(key))
    }
}

/// Tool registry limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub max_tools: usize,
    pub allow_versioning: bool,
    pub allowed_categories: Option<Vec<String>>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tools: 1000,
            allow_versioning: false,
            allowed_categories: None,
        }
    }
}

/// Audit log retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    pub retention_days: u32,
    pub max_entries: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_entries: 10_000,
            cleanup_interval_secs: 300,
        }
    }
}

/// Top-level gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub encryption: EncryptionConfig,
    pub registry: RegistryConfig,
    pub audit: AuditConfig,
    pub admin_roles: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            quota: QuotaConfig::default(),
            encryption: EncryptionConfig::default(),
            registry: RegistryConfig::default(),
            audit: AuditConfig::default(),
            admin_roles: vec!["admin".to_string()],
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML (`.yaml`/`.yml`) or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let config: Self = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.rate_limit.window_secs == 0 {
            problems.push("rateLimit.windowSecs must be greater than 0".to_string());
        } else if self.rate_limit.window_secs > MAX_WINDOW_SECS {
            problems.push(format!("rateLimit.windowSecs must not exceed {MAX_WINDOW_SECS}"));
        }
        if self.rate_limit.max_requests == 0 {
            problems.push("rateLimit.maxRequests must be greater than 0".to_string());
        }
        if self.rate_limit.max_burst == Some(0) {
            problems.push("rateLimit.maxBurst must be greater than 0".to_string());
        }
        if let Some(rate) = self.rate_limit.refill_per_second {
            if !rate.is_finite() || rate <= 0.0 {
                problems.push("rateLimit.refillPerSecond must be a positive number".to_string());
            } else if rate < MIN_REFILL_PER_SECOND {
                problems.push(format!(
                    "rateLimit.refillPerSecond must be at least {MIN_REFILL_PER_SECOND}"
                ));
            }
        }
        if self.quota.default_limit == Some(0) {
            problems.push("quota.defaultLimit must be greater than 0".to_string());
        }
        if self.encryption.algorithm != SUPPORTED_ALGORITHM {
            problems.push(format!(
                "encryption.algorithm '{}' is not supported (expected {})",
                self.encryption.algorithm, SUPPORTED_ALGORITHM
            ));
        }
        if self.encryption.grace_period_secs > MAX_GRACE_PERIOD_SECS {
            problems.push(format!(
                "encryption.gracePeriodSecs must not exceed {MAX_GRACE_PERIOD_SECS}"
            ));
        } else if self.encryption.rotation_interval_secs > 0
            && self.encryption.grace_period_secs > self.encryption.rotation_interval_secs
        {
            problems.push("encryption.gracePeriodSecs must not exceed rotationIntervalSecs".to_string());
        }
        if self.encryption.handshake_timeout_ms == 0 {
            problems.push("encryption.handshakeTimeoutMs must be greater than 0".to_string());
        }
        match self.encryption.decode_pre_shared_key() {
            Ok(None) if !self.encryption.perfect_forward_secrecy => problems.push(
                "encryption.preSharedKey is required when perfectForwardSecrecy is off".to_string(),
            ),
            Err(e) => problems.push(e.to_string()),
            _ => {}
        }
        if self.registry.max_tools == 0 {
            problems.push("registry.maxTools must be greater than 0".to_string());
        }
        if self.audit.max_entries == 0 {
            problems.push("audit.maxEntries must be greater than 0".to_string());
        }
        if self.audit.retention_days > MAX_RETENTION_DAYS {
            problems.push(format!("audit.retentionDays must not exceed {MAX_RETENTION_DAYS}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(problems.join("; ")))
        }
    }

    /// Render as YAML (used by `toolgate init`)
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
