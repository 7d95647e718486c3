//! Reconciler configuration.
//!
//! Built once at startup from environment variables and passed by value into
//! the components; nothing reads the environment after that.

use crate::capacity::CapacityPolicy;
use crate::error::{ReconcilerError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub reconciler_interval_secs: u64,

    /// Idle minutes before an Active workspace is asked to suspend; zero or
    /// negative disables auto-suspend.
    pub auto_suspend_minutes: i64,

    pub domain_suffix: Option<String>,
    pub auth_base_url: Option<String>,
    pub identity_base_url: Option<String>,
    pub search_base_url: Option<String>,
    pub redis_address: Option<String>,

    pub kube_namespace: String,
    pub routing_configmap: String,

    pub class_quotas: BTreeMap<String, u32>,
    pub class_units: BTreeMap<String, u32>,
    pub tenant_quota: Option<u32>,

    pub step_retries: u32,
    pub step_retry_backoff_ms: u64,
    pub conflict_retries: u32,
    pub workspace_concurrency: usize,
    pub shutdown_timeout_secs: u64,
    pub authz_cache_ttl_secs: u64,
    pub local_cache_size: usize,
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".ws-reconciler")
        .join("workspaces.db")
}

fn default_class_quotas() -> BTreeMap<String, u32> {
    BTreeMap::from([("small".to_string(), 10), ("medium".to_string(), 5)])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            reconciler_interval_secs: 30,
            auto_suspend_minutes: 0,
            domain_suffix: None,
            auth_base_url: None,
            identity_base_url: None,
            search_base_url: None,
            redis_address: None,
            kube_namespace: "workspaces".to_string(),
            routing_configmap: "workspace-routes".to_string(),
            class_quotas: default_class_quotas(),
            class_units: BTreeMap::new(),
            tenant_quota: None,
            step_retries: 2,
            step_retry_backoff_ms: 250,
            conflict_retries: 3,
            workspace_concurrency: 1,
            shutdown_timeout_secs: 30,
            authz_cache_ttl_secs: 60,
            local_cache_size: 2000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = var("WS_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("WS_RECONCILER_INTERVAL_SECS") {
            config.reconciler_interval_secs = parse("WS_RECONCILER_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("AUTO_SUSPEND_DURATION_MINUTES") {
            config.auto_suspend_minutes = parse("AUTO_SUSPEND_DURATION_MINUTES", &v)?;
        }

        config.domain_suffix = var("DOMAIN_SUFFIX");
        config.auth_base_url = var("AUTH_BASE_URL");
        config.identity_base_url = var("IDENTITY_BASE_URL");
        config.search_base_url = var("SEARCH_BASE_URL");
        config.redis_address = var("REDIS_ADDRESS");

        if let Some(v) = var("WS_KUBE_NAMESPACE") {
            config.kube_namespace = v;
        }
        if let Some(v) = var("WS_ROUTING_CONFIGMAP") {
            config.routing_configmap = v;
        }
        if let Some(v) = var("WS_CLASS_QUOTAS") {
            config.class_quotas = parse_class_map("WS_CLASS_QUOTAS", &v)?;
        }
        if let Some(v) = var("WS_CLASS_UNITS") {
            config.class_units = parse_class_map("WS_CLASS_UNITS", &v)?;
        }
        if let Some(v) = var("WS_TENANT_QUOTA") {
            config.tenant_quota = Some(parse("WS_TENANT_QUOTA", &v)?);
        }
        if let Some(v) = var("WS_STEP_RETRIES") {
            config.step_retries = parse("WS_STEP_RETRIES", &v)?;
        }
        if let Some(v) = var("WS_STEP_RETRY_BACKOFF_MS") {
            config.step_retry_backoff_ms = parse("WS_STEP_RETRY_BACKOFF_MS", &v)?;
        }
        if let Some(v) = var("WS_CONFLICT_RETRIES") {
            config.conflict_retries = parse("WS_CONFLICT_RETRIES", &v)?;
        }
        if let Some(v) = var("WS_WORKSPACE_CONCURRENCY") {
            config.workspace_concurrency = parse("WS_WORKSPACE_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("WS_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout_secs = parse("WS_SHUTDOWN_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("WS_AUTHZ_CACHE_TTL_SECS") {
            config.authz_cache_ttl_secs = parse("WS_AUTHZ_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = var("WS_LOCAL_CACHE_SIZE") {
            config.local_cache_size = parse("WS_LOCAL_CACHE_SIZE", &v)?;
        }

        config.check_bounds()?;
        Ok(config)
    }

    fn check_bounds(&self) -> Result<()> {
        if self.reconciler_interval_secs == 0 {
            return Err(ReconcilerError::Config(
                "WS_RECONCILER_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.workspace_concurrency == 0 {
            return Err(ReconcilerError::Config(
                "WS_WORKSPACE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if chrono::Duration::try_minutes(self.auto_suspend_minutes).is_none() {
            return Err(ReconcilerError::Config(
                "AUTO_SUSPEND_DURATION_MINUTES is out of range".to_string(),
            ));
        }
        if let Some((class, _)) = self.class_units.iter().find(|(_, units)| **units == 0) {
            return Err(ReconcilerError::Config(format!(
                "WS_CLASS_UNITS: class {} must use at least one unit",
                class
            )));
        }
        Ok(())
    }

    /// Checks everything the `run` command needs.
    pub fn validate(&self) -> Result<()> {
        self.check_bounds()?;
        self.domain_suffix()?;
        self.auth_base_url()?;
        self.identity_base_url()?;
        self.search_base_url()?;
        Ok(())
    }

    pub fn domain_suffix(&self) -> Result<&str> {
        required(&self.domain_suffix, "DOMAIN_SUFFIX")
    }

    pub fn auth_base_url(&self) -> Result<&str> {
        required(&self.auth_base_url, "AUTH_BASE_URL")
    }

    pub fn identity_base_url(&self) -> Result<&str> {
        required(&self.identity_base_url, "IDENTITY_BASE_URL")
    }

    pub fn search_base_url(&self) -> Result<&str> {
        required(&self.search_base_url, "SEARCH_BASE_URL")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.reconciler_interval_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.auto_suspend_minutes).unwrap_or(chrono::Duration::zero())
    }

    pub fn step_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.step_retry_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn authz_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.authz_cache_ttl_secs)
    }

    pub fn capacity_policy(&self) -> CapacityPolicy {
        CapacityPolicy {
            class_limits: self.class_quotas.clone(),
            tenant_limit: self.tenant_quota,
            class_units: self.class_units.clone(),
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| ReconcilerError::Config(format!("{} is required", name)))
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ReconcilerError::Config(format!("{}={:?}: {}", name, raw, e)))
}

/// Parses `class=n,class=n`.
fn parse_class_map(name: &str, raw: &str) -> Result<BTreeMap<String, u32>> {
    let mut map = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (class, value) = pair.split_once('=').ok_or_else(|| {
            ReconcilerError::Config(format!("{}: expected class=value, got {:?}", name, pair))
        })?;
        let class = class.trim();
        if class.is_empty() {
            return Err(ReconcilerError::Config(format!(
                "{}: empty class name in {:?}",
                name, pair
            )));
        }
        map.insert(class.to_string(), parse(name, value)?);
    }
    Ok(map)
}
