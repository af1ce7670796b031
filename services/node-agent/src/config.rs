//! Configuration for the node agent.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use layercast_id::NodeId;

use crate::cache::{CacheConfig, EvictionMode};
use crate::coordinator::CoordinatorConfig;
use crate::fetcher::{BackoffPolicy, FetcherConfig};
use crate::image::ImageReference;
use crate::registry::{Credentials, HttpRegistryConfig};
use crate::resolver::ResolverConfig;

const PREFIX: &str = "LAYERCAST_";

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Data directory for local state. The cache lives under `cache/`.
    pub data_dir: PathBuf,

    pub cache: CacheConfig,
    pub fetcher: FetcherConfig,
    pub resolver: ResolverConfig,
    pub coordinator: CoordinatorConfig,

    /// Settings for the primary registry backend.
    pub registry: HttpRegistryConfig,

    /// Mirror endpoints tried before the upstream registry, in order.
    pub mirrors: Vec<String>,

    /// Images the reconcile loop keeps resident.
    pub desired_images: Vec<ImageReference>,

    /// Period of the reconcile loop.
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("/var/lib/layercast");
        Self {
            node_id: NodeId::new(),
            cache: CacheConfig {
                root: data_dir.join("cache"),
                ..Default::default()
            },
            data_dir,
            fetcher: FetcherConfig::default(),
            resolver: ResolverConfig::default(),
            coordinator: CoordinatorConfig::default(),
            registry: HttpRegistryConfig::default(),
            mirrors: Vec::new(),
            desired_images: Vec::new(),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its
    /// value. Unset variables keep their defaults; malformed ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(node_id) = env.parse::<NodeId>("NODE_ID")? {
            config.node_id = node_id;
        }
        if let Some(dir) = env.get("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.cache.root = config.data_dir.join("cache");
        }

        if let Some(budget) = env.parse::<u64>("CACHE_SIZE_BUDGET")? {
            config.cache.budget_bytes = budget;
        }
        if let Some(eviction) = env.parse::<EvictionMode>("EVICTION")? {
            config.cache.eviction = eviction;
        }
        if let Some(verify) = env.parse::<bool>("VERIFY_ON_OPEN")? {
            config.cache.verify_on_open = verify;
        }
        if let Some(ttl) = env.secs("FAILED_TTL_SECS")? {
            config.cache.failed_ttl = ttl;
        }

        if let Some(limit) = env.parse::<usize>("CONCURRENCY_LIMIT")? {
            if limit == 0 {
                return Err(anyhow!("{PREFIX}CONCURRENCY_LIMIT must be at least 1"));
            }
            config.fetcher.concurrency = limit;
        }
        if let Some(attempts) = env.parse::<u32>("MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(anyhow!("{PREFIX}MAX_ATTEMPTS must be at least 1"));
            }
            config.fetcher.max_attempts = attempts;
        }
        let base = env.millis("BACKOFF_BASE_MS")?;
        let cap = env.millis("BACKOFF_CAP_MS")?;
        if base.is_some() || cap.is_some() {
            let defaults = BackoffPolicy::default();
            config.fetcher.backoff = BackoffPolicy::new(
                base.unwrap_or(defaults.base),
                cap.unwrap_or(defaults.max),
            );
        }
        if let Some(timeout) = env.secs("ATTEMPT_TIMEOUT_SECS")? {
            config.fetcher.attempt_timeout = timeout;
        }
        if let Some(timeout) = env.secs("TASK_TIMEOUT_SECS")? {
            config.fetcher.task_timeout = timeout;
        }
        if let Some(wait) = env.secs("ADMISSION_WAIT_SECS")? {
            config.fetcher.admission_wait = wait;
        }

        if let Some(ttl) = env.secs("MANIFEST_TTL_SECS")? {
            config.resolver.ttl = ttl;
        }
        if let Some(raw) = env.get("MANIFEST_TTL_OVERRIDES") {
            config.resolver.ttl_overrides = parse_ttl_overrides(&raw)
                .with_context(|| format!("invalid {PREFIX}MANIFEST_TTL_OVERRIDES"))?;
        }

        config.registry.credentials = match (
            env.get("REGISTRY_TOKEN"),
            env.get("REGISTRY_USERNAME"),
            env.get("REGISTRY_PASSWORD"),
        ) {
            (Some(token), _, _) => Credentials::Bearer(token),
            (None, Some(username), Some(password)) => Credentials::Basic { username, password },
            (None, Some(_), None) | (None, None, Some(_)) => {
                return Err(anyhow!(
                    "{PREFIX}REGISTRY_USERNAME and {PREFIX}REGISTRY_PASSWORD must be set together"
                ));
            }
            (None, None, None) => Credentials::Anonymous,
        };
        if let Some(mirrors) = env.get("MIRRORS") {
            config.mirrors = split_list(&mirrors).map(str::to_string).collect();
        }

        if let Some(images) = env.get("DESIRED_IMAGES") {
            config.desired_images = split_list(&images)
                .map(|s| {
                    ImageReference::parse(s)
                        .with_context(|| format!("invalid {PREFIX}DESIRED_IMAGES entry {s:?}"))
                })
                .collect::<Result<_>>()?;
        }
        if let Some(interval) = env.secs("RECONCILE_INTERVAL_SECS")? {
            if interval.is_zero() {
                return Err(anyhow!("{PREFIX}RECONCILE_INTERVAL_SECS must be positive"));
            }
            config.reconcile_interval = interval;
        }

        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| anyhow!("invalid {PREFIX}{name} {raw:?}: {e}"))
            })
            .transpose()
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn millis(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parses `host=secs,host=secs`.
fn parse_ttl_overrides(raw: &str) -> Result<HashMap<String, Duration>> {
    split_list(raw)
        .map(|pair| -> Result<(String, Duration)> {
            let (host, secs) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected host=secs, got {pair:?}"))?;
            let secs: u64 = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid seconds for {host}"))?;
            Ok((host.trim().to_string(), Duration::from_secs(secs)))
        })
        .collect()
}
