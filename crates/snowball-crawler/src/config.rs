use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::backend::{EdgeKind, TimelineRange};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    #[serde(default)]
    pub limits: CollectionLimits,

    #[serde(default)]
    pub strategy: Strategy,

    /// Oldest post collected from timelines, `None` takes whatever the API serves
    #[serde(default)]
    pub timeline_since: Option<NaiveDate>,

    /// Newest post collected from timelines
    #[serde(default)]
    pub timeline_until: Option<NaiveDate>,

    #[serde(default)]
    pub throttle: ThrottleConfig,

    #[serde(default = "default_on_fetch_error")]
    pub on_fetch_error: OnError,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            limits: CollectionLimits::default(),
            strategy: Strategy::default(),
            timeline_since: None,
            timeline_until: None,
            throttle: ThrottleConfig::default(),
            on_fetch_error: default_on_fetch_error(),
            max_retries: default_max_retries(),
            handle_sigint: default_handle_sigint(),
            api: ApiConfig::default(),
        }
    }
}

impl CrawlerConfig {
    pub fn timeline_range(&self) -> TimelineRange {
        TimelineRange {
            since: self.timeline_since,
            until: self.timeline_until,
        }
    }
}

fn default_on_fetch_error() -> OnError {
    OnError::SkipAndLog
}

fn default_max_retries() -> u32 {
    3
}

fn default_handle_sigint() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OnError {
    Fail,
    SkipAndLog,
}

/// Immutable bounds of one crawl.
///
/// For every relation, `expand` caps how many discovered accounts per member
/// feed the next hop and `store` caps how many are kept on the member's
/// record. `None` means unbounded, `Some(0)` disables the relation. A caps
/// table given in a config file leaves unlisted relations unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionLimits {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    #[serde(default = "default_max_data_gb")]
    pub max_data_gb: Option<f64>,

    #[serde(default = "EdgeCaps::disabled")]
    pub expand: EdgeCaps,

    #[serde(default)]
    pub store: EdgeCaps,
}

impl Default for CollectionLimits {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            max_data_gb: default_max_data_gb(),
            expand: EdgeCaps::disabled(),
            store: EdgeCaps::default(),
        }
    }
}

impl CollectionLimits {
    /// No volume ceiling and every relation fully expanded.
    pub fn unbounded(max_hops: u32) -> Self {
        Self {
            max_hops,
            max_data_gb: None,
            expand: EdgeCaps::default(),
            store: EdgeCaps::default(),
        }
    }

    pub fn expands(&self, kind: EdgeKind) -> bool {
        self.expand.edges(kind) != Some(0)
    }

    pub fn expands_text(&self) -> bool {
        self.expand.mentions != Some(0) || self.expand.replies != Some(0)
    }

    /// How many edges to ask the API for, enough for both caps.
    pub fn fetch_cap(&self, kind: EdgeKind) -> Option<usize> {
        match (self.store.edges(kind), self.expand.edges(kind)) {
            (Some(store), Some(expand)) => Some(store.max(expand)),
            _ => None,
        }
    }
}

fn default_max_hops() -> u32 {
    6
}

fn default_max_data_gb() -> Option<f64> {
    Some(2.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCaps {
    #[serde(default)]
    pub friends: Option<usize>,
    #[serde(default)]
    pub followers: Option<usize>,
    #[serde(default)]
    pub mentions: Option<usize>,
    #[serde(default)]
    pub replies: Option<usize>,
}

impl EdgeCaps {
    pub fn disabled() -> Self {
        Self {
            friends: Some(0),
            followers: Some(0),
            mentions: Some(0),
            replies: Some(0),
        }
    }

    pub fn edges(&self, kind: EdgeKind) -> Option<usize> {
        match kind {
            EdgeKind::Friends => self.friends,
            EdgeKind::Followers => self.followers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Expand every member through every enabled relation
    BreadthFirst,
    /// Skip members above `max_degree` and pass candidates through the
    /// crawler's relevance filter
    #[serde(rename_all = "camelCase")]
    RelevanceFiltered {
        #[serde(default = "default_max_degree")]
        max_degree: Option<u64>,
    },
}

impl Default for Strategy {
    fn default() -> Self {
        Self::BreadthFirst
    }
}

fn default_max_degree() -> Option<u64> {
    Some(1000)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfig {
    /// Calls that must remain in a window before a call is let through
    #[serde(default = "default_headroom")]
    pub headroom: u32,

    /// Longest wait, in seconds, taken without first trying another credential
    #[serde(default = "default_short_pause")]
    pub short_pause_secs: u64,

    /// Added to every computed wait, in seconds
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Length of a remote rate limit window, in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Local calls after which the counter is checked against the API
    #[serde(default = "default_sync_every")]
    pub sync_every: u32,

    /// Authoritative status checks allowed per credential and window
    #[serde(default = "default_status_calls")]
    pub status_calls_per_window: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            headroom: default_headroom(),
            short_pause_secs: default_short_pause(),
            grace_secs: default_grace(),
            window_secs: default_window(),
            sync_every: default_sync_every(),
            status_calls_per_window: default_status_calls(),
        }
    }
}

impl ThrottleConfig {
    pub fn short_pause(&self) -> Duration {
        Duration::from_secs(self.short_pause_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_headroom() -> u32 {
    1
}

fn default_short_pause() -> u64 {
    300
}

fn default_grace() -> u64 {
    5
}

fn default_window() -> u64 {
    900
}

fn default_sync_every() -> u32 {
    50
}

fn default_status_calls() -> u32 {
    180
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Every request goes through this proxy, e.g. `http://host:port`
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout(),
            proxy: None,
        }
    }
}

fn default_base_url() -> String {
    String::from("http://localhost:8080/api")
}

fn default_user_agent() -> String {
    String::from("SnowballBot")
}

fn default_timeout() -> u64 {
    30
}
