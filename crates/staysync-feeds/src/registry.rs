//! Property/feed registry and per-feed health bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use staysync_core::{Feed, Property};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

pub const HEALTH_FILE_NAME: &str = "feed_health.json";

/// One active feed, paired with the property it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTarget {
    pub property_id: String,
    pub feed: Feed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedHealth {
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl FeedHealth {
    pub fn apply(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Success { at } => {
                self.last_synced_at = Some(*at);
                self.last_attempt_at = Some(*at);
                self.consecutive_errors = 0;
                self.last_error = None;
            }
            FetchOutcome::Failure { at, error } => {
                self.last_attempt_at = Some(*at);
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                self.last_error = Some(error.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { at: DateTime<Utc> },
    Failure { at: DateTime<Utc>, error: String },
}

/// Active feeds in registry order, each paired with its property.
pub fn active_targets(properties: &[Property]) -> Vec<FeedTarget> {
    properties
        .iter()
        .flat_map(|p| {
            p.feeds.iter().filter(|f| f.active).map(|feed| FeedTarget {
                property_id: p.property_id.clone(),
                feed: feed.clone(),
            })
        })
        .collect()
}

#[async_trait]
pub trait FeedRegistry: Send + Sync {
    /// Every registered property, with feed health folded into each `Feed`.
    async fn properties(&self) -> Result<Vec<Property>>;

    async fn record_fetch(&self, property_id: &str, url: &str, outcome: FetchOutcome)
        -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    properties: Vec<Property>,
}

type HealthMap = BTreeMap<String, BTreeMap<String, FeedHealth>>;

fn validate(properties: &[Property]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for property in properties {
        if property.property_id.trim().is_empty() {
            bail!("property with empty property_id");
        }
        if !seen.insert(property.property_id.as_str()) {
            bail!("duplicate property_id {}", property.property_id);
        }
        let mut urls = BTreeSet::new();
        for feed in &property.feeds {
            if feed.url.trim().is_empty() {
                bail!("property {} has a feed with an empty url", property.property_id);
            }
            if !urls.insert(feed.url.as_str()) {
                bail!(
                    "property {} lists feed {} twice",
                    property.property_id,
                    feed.url
                );
            }
        }
    }
    Ok(())
}

fn merge_health(mut properties: Vec<Property>, health: &HealthMap) -> Vec<Property> {
    for property in &mut properties {
        let Some(by_url) = health.get(&property.property_id) else {
            continue;
        };
        for feed in &mut property.feeds {
            if let Some(h) = by_url.get(&feed.url) {
                feed.last_synced_at = h.last_synced_at;
                feed.consecutive_errors = h.consecutive_errors;
            }
        }
    }
    properties
}

/// YAML property configuration plus a sibling `feed_health.json`.
///
/// The YAML document is read once and never rewritten; health is persisted separately after every
/// recorded fetch.
#[derive(Debug)]
pub struct YamlFeedRegistry {
    path: PathBuf,
    health_path: PathBuf,
    properties: Vec<Property>,
    health: Mutex<HealthMap>,
}

impl YamlFeedRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RegistryFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        validate(&file.properties).with_context(|| format!("validating {}", path.display()))?;

        let health_path = path
            .parent()
            .map(|dir| dir.join(HEALTH_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(HEALTH_FILE_NAME));
        let health = match fs::read(&health_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", health_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HealthMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", health_path.display()))
            }
        };

        Ok(Self {
            path,
            health_path,
            properties: file.properties,
            health: Mutex::new(health),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn health_path(&self) -> &Path {
        &self.health_path
    }

    pub async fn health(&self, property_id: &str, url: &str) -> Option<FeedHealth> {
        self.health
            .lock()
            .await
            .get(property_id)
            .and_then(|by_url| by_url.get(url))
            .cloned()
    }

    async fn persist(&self, health: &HealthMap) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(health).context("serializing feed health")?;
        let tmp = self.health_path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.health_path)
            .await
            .with_context(|| format!("renaming into {}", self.health_path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl FeedRegistry for YamlFeedRegistry {
    async fn properties(&self) -> Result<Vec<Property>> {
        let health = self.health.lock().await;
        Ok(merge_health(self.properties.clone(), &health))
    }

    async fn record_fetch(
        &self,
        property_id: &str,
        url: &str,
        outcome: FetchOutcome,
    ) -> Result<()> {
        let mut health = self.health.lock().await;
        let entry = health
            .entry(property_id.to_string())
            .or_default()
            .entry(url.to_string())
            .or_default();
        entry.apply(&outcome);
        debug!(
            property_id,
            url,
            consecutive_errors = entry.consecutive_errors,
            "feed health updated"
        );
        self.persist(&health).await
    }
}

/// In-memory registry; records every fetch outcome for inspection.
#[derive(Debug, Default)]
pub struct StaticFeedRegistry {
    properties: Vec<Property>,
    health: Mutex<HealthMap>,
    outcomes: Mutex<Vec<(String, String, FetchOutcome)>>,
}

impl StaticFeedRegistry {
    pub fn new(properties: Vec<Property>) -> Result<Self> {
        validate(&properties)?;
        Ok(Self {
            properties,
            ..Default::default()
        })
    }

    pub async fn outcomes(&self) -> Vec<(String, String, FetchOutcome)> {
        self.outcomes.lock().await.clone()
    }
}

#[async_trait]
impl FeedRegistry for StaticFeedRegistry {
    async fn properties(&self) -> Result<Vec<Property>> {
        let health = self.health.lock().await;
        Ok(merge_health(self.properties.clone(), &health))
    }

    async fn record_fetch(
        &self,
        property_id: &str,
        url: &str,
        outcome: FetchOutcome,
    ) -> Result<()> {
        self.health
            .lock()
            .await
            .entry(property_id.to_string())
            .or_default()
            .entry(url.to_string())
            .or_default()
            .apply(&outcome);
        self.outcomes
            .lock()
            .await
            .push((property_id.to_string(), url.to_string(), outcome));
        Ok(())
    }
}
