#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use snowball_crawler::{
    Backend, Category, Clock, CollectionLimits, Crawler, CrawlerConfig, Credential,
    CredentialPool, EdgeKind, FetchError, FrontierState, FrontierStore, Identifier, ManualClock,
    Post, ProfileRecord, Quota, TimelineRange,
};

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn creds(names: &[&str]) -> Vec<Credential> {
    names
        .iter()
        .map(|name| {
            Credential::new(
                *name,
                format!("{name}-key"),
                "secret",
                format!("{name}-token"),
                "token-secret",
            )
        })
        .collect()
}

pub fn config(limits: CollectionLimits) -> CrawlerConfig {
    CrawlerConfig {
        limits,
        handle_sigint: false,
        ..Default::default()
    }
}

/// Friends-only expansion without any volume ceiling.
pub fn friends_only(max_hops: u32) -> CollectionLimits {
    let mut limits = CollectionLimits::unbounded(max_hops);
    limits.expand.followers = Some(0);
    limits.expand.mentions = Some(0);
    limits.expand.replies = Some(0);
    limits
}

pub fn crawler(
    dir: &Path,
    config: CrawlerConfig,
    network: FakeNetwork,
    credentials: Vec<Credential>,
) -> Crawler<FakeNetwork, ManualClock> {
    let clock = ManualClock::new(start());
    let network = network.with_clock(clock.clone());
    let store = FrontierStore::open(dir).unwrap();
    let pool = CredentialPool::new(credentials).unwrap();
    Crawler::new(config, network, store, pool, clock)
}

pub fn load(dir: &Path) -> FrontierState {
    FrontierStore::open(dir).unwrap().load().unwrap().state
}

pub fn ids(ids: impl IntoIterator<Item = u64>) -> std::collections::BTreeSet<Identifier> {
    ids.into_iter().map(Identifier::Id).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallLog {
    pub at: DateTime<Utc>,
    pub credential: String,
    pub category: Category,
    pub target: String,
}

#[derive(Debug, Clone)]
struct Interrupt {
    category: Option<Category>,
    after: usize,
    seen: usize,
    flag: Arc<AtomicBool>,
}

/// Deterministic in-memory social graph.
///
/// Accounts that were not added explicitly exist as leaves without any
/// relation. Quotas are only enforced for the (credential, category) pairs
/// given to `quota`.
#[derive(Debug, Clone, Default)]
pub struct FakeNetwork {
    handles: HashMap<String, u64>,
    friends: HashMap<u64, Vec<u64>>,
    followers: HashMap<u64, Vec<u64>>,
    timelines: HashMap<u64, Vec<Post>>,
    missing: HashSet<u64>,
    padding: usize,
    flaky: HashMap<(Category, u64), u32>,
    rejected: HashSet<String>,
    quotas: HashMap<(String, Category), Quota>,
    interrupt: Option<Interrupt>,
    clock: Option<ManualClock>,
    pub calls: Vec<CallLog>,
    pub status_calls: Vec<(String, Category)>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, id: u64, handle: &str, friends: &[u64], followers: &[u64]) -> Self {
        self.handles.insert(handle.to_string(), id);
        self.friends.insert(id, friends.to_vec());
        self.followers.insert(id, followers.to_vec());
        self
    }

    pub fn timeline(mut self, id: u64, posts: Vec<Post>) -> Self {
        self.timelines.insert(id, posts);
        self
    }

    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map_or_else(start, |clock| clock.now())
    }

    pub fn missing(mut self, id: u64) -> Self {
        self.missing.insert(id);
        self
    }

    /// Extra bytes carried by every profile, to make records heavier.
    pub fn padding(mut self, bytes: usize) -> Self {
        self.padding = bytes;
        self
    }

    /// The profile of `id` fails transiently `times` times before succeeding.
    pub fn flaky(self, id: u64, times: u32) -> Self {
        self.flaky_in(Category::Users, id, times)
    }

    pub fn flaky_in(mut self, category: Category, id: u64, times: u32) -> Self {
        self.flaky.insert((category, id), times);
        self
    }

    pub fn reject(mut self, credential: &str) -> Self {
        self.rejected.insert(credential.to_string());
        self
    }

    pub fn quota(
        mut self,
        credential: &str,
        category: Category,
        remaining: u32,
        limit: u32,
        reset: DateTime<Utc>,
    ) -> Self {
        self.quotas.insert(
            (credential.to_string(), category),
            Quota {
                remaining,
                limit,
                reset,
            },
        );
        self
    }

    /// Raises `flag` once `after` calls of `category` (any if `None`) went through.
    pub fn interrupt_after(
        &mut self,
        category: Option<Category>,
        after: usize,
        flag: Arc<AtomicBool>,
    ) {
        self.interrupt = Some(Interrupt {
            category,
            after,
            seen: 0,
            flag,
        });
    }

    pub fn calls_of(&self, category: Category) -> Vec<&CallLog> {
        self.calls.iter().filter(|c| c.category == category).collect()
    }

    /// Windows whose reset time has passed start over, as the API does.
    fn roll_windows(&mut self) {
        let now = self.now();
        for quota in self.quotas.values_mut() {
            if quota.reset <= now {
                quota.remaining = quota.limit;
                quota.reset = now + Duration::minutes(15);
            }
        }
    }

    fn enter(
        &mut self,
        credential: &Credential,
        category: Category,
        target: String,
    ) -> Result<(), FetchError> {
        if self.rejected.contains(&credential.name) {
            return Err(FetchError::Unauthorized(format!("{} is revoked", credential.name)));
        }
        self.roll_windows();
        if let Some(quota) = self.quotas.get_mut(&(credential.name.clone(), category)) {
            if quota.remaining == 0 {
                return Err(FetchError::RateLimited { retry_after: None });
            }
            quota.remaining -= 1;
        }
        self.calls.push(CallLog {
            at: self.now(),
            credential: credential.name.clone(),
            category,
            target,
        });
        Ok(())
    }

    fn fail_transiently(&mut self, category: Category, id: u64) -> Result<(), FetchError> {
        match self.flaky.get_mut(&(category, id)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(FetchError::Transient("connection reset".into()))
            }
            _ => Ok(()),
        }
    }

    fn leave(&mut self, category: Category) {
        if let Some(interrupt) = self.interrupt.as_mut() {
            if interrupt.category.map_or(true, |c| c == category) {
                interrupt.seen += 1;
                if interrupt.seen == interrupt.after {
                    interrupt.flag.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn profile(&self, id: u64) -> ProfileRecord {
        let handle = self
            .handles
            .iter()
            .find(|(_, &v)| v == id)
            .map(|(h, _)| h.clone())
            .unwrap_or_else(|| format!("user{id}"));
        let mut profile = ProfileRecord::new(id, handle);
        profile.friends_count = self.friends.get(&id).map_or(0, |f| f.len() as u64);
        profile.followers_count = self.followers.get(&id).map_or(0, |f| f.len() as u64);
        if self.padding > 0 {
            profile
                .extra
                .insert("description".into(), serde_json::json!("x".repeat(self.padding)));
        }
        profile
    }
}

impl Backend for FakeNetwork {
    async fn fetch_profile(
        &mut self,
        credential: &Credential,
        id: &Identifier,
    ) -> Result<ProfileRecord, FetchError> {
        self.enter(credential, Category::Users, id.to_string())?;
        let resolved = match id {
            Identifier::Id(id) => Some(*id),
            Identifier::Handle(handle) => self.handles.get(handle).copied(),
        };
        let result = match resolved {
            Some(id) if self.missing.contains(&id) => Err(FetchError::NotFound),
            None => Err(FetchError::NotFound),
            Some(id) => self
                .fail_transiently(Category::Users, id)
                .map(|()| self.profile(id)),
        };
        self.leave(Category::Users);
        result
    }

    async fn fetch_edges(
        &mut self,
        credential: &Credential,
        id: u64,
        kind: EdgeKind,
        _limit: Option<usize>,
    ) -> Result<Vec<u64>, FetchError> {
        self.enter(credential, kind.category(), id.to_string())?;
        let result = self.fail_transiently(kind.category(), id).map(|()| {
            let edges = match kind {
                EdgeKind::Friends => self.friends.get(&id),
                EdgeKind::Followers => self.followers.get(&id),
            };
            edges.cloned().unwrap_or_default()
        });
        self.leave(kind.category());
        result
    }

    async fn fetch_timeline(
        &mut self,
        credential: &Credential,
        id: u64,
        _range: TimelineRange,
    ) -> Result<Vec<Post>, FetchError> {
        self.enter(credential, Category::Timeline, id.to_string())?;
        let result = self
            .fail_transiently(Category::Timeline, id)
            .map(|()| self.timelines.get(&id).cloned().unwrap_or_default());
        self.leave(Category::Timeline);
        result
    }

    async fn authoritative_quota(
        &mut self,
        credential: &Credential,
        category: Category,
    ) -> Result<Quota, FetchError> {
        if self.rejected.contains(&credential.name) {
            return Err(FetchError::Unauthorized(format!("{} is revoked", credential.name)));
        }
        self.roll_windows();
        self.status_calls.push((credential.name.clone(), category));
        let now = self.now();
        Ok(self
            .quotas
            .get(&(credential.name.clone(), category))
            .copied()
            .unwrap_or(Quota {
                remaining: 900,
                limit: 900,
                reset: now + Duration::minutes(15),
            }))
    }
}

/// A post dated `days` after the start of the crawl.
pub fn dated_post(id: u64, days: i64, mentions: &[u64]) -> Post {
    let mut post = post(id, None, mentions);
    post.created_at = Some(start() + Duration::days(days));
    post
}

pub fn post(id: u64, reply_to: Option<u64>, mentions: &[u64]) -> Post {
    let mut post = Post::new(id);
    post.in_reply_to = reply_to;
    post.mentions = mentions.to_vec();
    post
}
