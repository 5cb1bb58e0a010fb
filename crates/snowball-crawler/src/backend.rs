use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::Credential;

/// An account key: a handle as typed by the user, or a resolved numeric id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Id(u64),
    Handle(String),
}

impl Identifier {
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Handle(_) => None,
        }
    }
}

impl From<u64> for Identifier {
    fn from(id: u64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for Identifier {
    fn from(handle: &str) -> Self {
        Self::Handle(handle.trim_start_matches('@').to_string())
    }
}

impl FromStr for Identifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "@" {
            anyhow::bail!("Empty identifier");
        }
        match s.parse::<u64>() {
            Ok(id) => Ok(Self::Id(id)),
            Err(_) => Ok(Self::from(s)),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Handle(handle) => write!(f, "@{handle}"),
        }
    }
}

/// Rate-limited families of remote calls, each with its own quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Users,
    Friends,
    Followers,
    Timeline,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Friends => "friends",
            Self::Followers => "followers",
            Self::Timeline => "timeline",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Friends,
    Followers,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 2] = [EdgeKind::Friends, EdgeKind::Followers];

    pub fn category(&self) -> Category {
        match self {
            Self::Friends => Category::Friends,
            Self::Followers => Category::Followers,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Friends => "friends",
            Self::Followers => "followers",
        }
    }
}

/// Profile data as returned by the API. Only the fields the crawler needs are
/// typed, everything else is carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: u64,
    pub handle: String,
    #[serde(default)]
    pub friends_count: u64,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProfileRecord {
    pub fn new(id: u64, handle: impl Into<String>) -> Self {
        Self {
            id,
            handle: handle.into(),
            friends_count: 0,
            followers_count: 0,
            extra: serde_json::Map::new(),
        }
    }

    pub fn edge_count(&self, kind: EdgeKind) -> u64 {
        match kind {
            EdgeKind::Friends => self.friends_count,
            EdgeKind::Followers => self.followers_count,
        }
    }

    pub fn degree(&self) -> u64 {
        self.friends_count.saturating_add(self.followers_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_reply_to: Option<u64>,
    #[serde(default)]
    pub mentions: Vec<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Post {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            created_at: None,
            in_reply_to: None,
            mentions: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Dates bounding the posts collected from a timeline, both inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineRange {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl TimelineRange {
    /// Posts without a date are kept.
    pub fn contains(&self, post: &Post) -> bool {
        let Some(date) = post.created_at.map(|at| at.date_naive()) else {
            return true;
        };
        self.since.map_or(true, |since| date >= since)
            && self.until.map_or(true, |until| date <= until)
    }
}

/// An authoritative rate limit reading for one credential and category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub remaining: u32,
    pub limit: u32,
    pub reset: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("account not found, suspended or protected")]
    NotFound,
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("credential rejected: {0}")]
    Unauthorized(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

/// The remote API as seen by the crawler. Every call names the credential it
/// must be made with, so rotation stays under the crawler's control.
#[allow(async_fn_in_trait)]
pub trait Backend {
    async fn fetch_profile(
        &mut self,
        credential: &Credential,
        id: &Identifier,
    ) -> Result<ProfileRecord, FetchError>;

    /// `limit` is a hint, implementations may return more.
    async fn fetch_edges(
        &mut self,
        credential: &Credential,
        id: u64,
        kind: EdgeKind,
        limit: Option<usize>,
    ) -> Result<Vec<u64>, FetchError>;

    /// `range` is a hint, the crawler drops posts outside of it.
    async fn fetch_timeline(
        &mut self,
        credential: &Credential,
        id: u64,
        range: TimelineRange,
    ) -> Result<Vec<Post>, FetchError>;

    async fn authoritative_quota(
        &mut self,
        credential: &Credential,
        category: Category,
    ) -> Result<Quota, FetchError>;
}
