use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::backend::{
    Backend, Category, EdgeKind, FetchError, Identifier, Post, ProfileRecord, TimelineRange,
};
use crate::config::{CrawlerConfig, OnError, Strategy};
use crate::credentials::{Credential, CredentialPool};
use crate::error::CrawlError;
use crate::limiter::{Clock, Pacer, SystemClock};
use crate::quota;
use crate::store::{FrontierState, FrontierStore, GrowthKind, HopGrowth, Loaded, StoredProfile};

/// Decides which discovered accounts are worth expanding, used by the
/// relevance filtered strategy.
///
/// Must be deterministic for a given input, resumed crawls re-derive the
/// next frontier from stored records.
pub trait RelevanceFilter {
    fn retain(&mut self, member: &ProfileRecord, candidates: Vec<u64>) -> Vec<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl RelevanceFilter for KeepAll {
    fn retain(&mut self, _member: &ProfileRecord, candidates: Vec<u64>) -> Vec<u64> {
        candidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Hop ceiling reached or nothing left to expand
    Completed,
    /// Stored data went over `maxDataGb`
    VolumeLimit,
    /// Stopped through the stop handle
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlReport {
    pub outcome: Outcome,
    pub hop: u32,
    pub visited: usize,
    pub unreachable: usize,
    /// Accounts queued for the current hop
    pub frontier: usize,
    pub stored_bytes: u64,
}

enum Fetched<T> {
    Done(T),
    Unreachable,
    Skipped,
}

trait Call: fmt::Display {
    type Output;

    fn category(&self) -> Category;

    async fn send<B: Backend>(
        &self,
        backend: &mut B,
        credential: &Credential,
    ) -> Result<Self::Output, FetchError>;
}

struct ProfileCall<'a>(&'a Identifier);

impl Call for ProfileCall<'_> {
    type Output = ProfileRecord;

    fn category(&self) -> Category {
        Category::Users
    }

    async fn send<B: Backend>(
        &self,
        backend: &mut B,
        credential: &Credential,
    ) -> Result<ProfileRecord, FetchError> {
        backend.fetch_profile(credential, self.0).await
    }
}

impl fmt::Display for ProfileCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile of {}", self.0)
    }
}

struct EdgesCall {
    id: u64,
    kind: EdgeKind,
    limit: Option<usize>,
}

impl Call for EdgesCall {
    type Output = Vec<u64>;

    fn category(&self) -> Category {
        self.kind.category()
    }

    async fn send<B: Backend>(
        &self,
        backend: &mut B,
        credential: &Credential,
    ) -> Result<Vec<u64>, FetchError> {
        backend
            .fetch_edges(credential, self.id, self.kind, self.limit)
            .await
    }
}

impl fmt::Display for EdgesCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.kind.as_str(), self.id)
    }
}

struct TimelineCall {
    id: u64,
    range: TimelineRange,
}

impl Call for TimelineCall {
    type Output = Vec<Post>;

    fn category(&self) -> Category {
        Category::Timeline
    }

    async fn send<B: Backend>(
        &self,
        backend: &mut B,
        credential: &Credential,
    ) -> Result<Vec<Post>, FetchError> {
        backend.fetch_timeline(credential, self.id, self.range).await
    }
}

impl fmt::Display for TimelineCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timeline of {}", self.id)
    }
}

/// Hop by hop expansion of a seed set.
///
/// Every account goes through profile, edge and text expansion one at a
/// time, with the frontier saved after each of them, so a crawl can be
/// stopped at any point and resumed from the same data directory.
pub struct Crawler<B, C> {
    config: CrawlerConfig,
    backend: B,
    store: FrontierStore,
    pacer: Pacer<C>,
    relevance: Box<dyn RelevanceFilter + Send>,
    stop: Arc<AtomicBool>,
}

impl<B: Backend, C: Clock> Crawler<B, C> {
    pub fn new(
        config: CrawlerConfig,
        backend: B,
        store: FrontierStore,
        pool: CredentialPool,
        clock: C,
    ) -> Self {
        let pacer = Pacer::new(config.throttle, pool, clock);
        Self {
            config,
            backend,
            store,
            pacer,
            relevance: Box::new(KeepAll),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_relevance(mut self, filter: impl RelevanceFilter + Send + 'static) -> Self {
        self.relevance = Box::new(filter);
        self
    }

    /// Setting the flag stops the crawl before the next account.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn store(&self) -> &FrontierStore {
        &self.store
    }

    /// Runs or resumes the crawl. `seeds` are only used while the crawl is
    /// still at hop 0.
    pub async fn run(&mut self, seeds: &[Identifier]) -> Result<CrawlReport> {
        let Loaded { mut state, origin } = self.store.load()?;
        log::debug!("Frontier loaded from {origin:?}");

        if state.hop == 0 {
            for seed in seeds {
                if !state.is_visited(seed) && !state.is_unreachable(seed) {
                    state.current.insert(seed.clone());
                }
            }
        } else if !seeds.is_empty() {
            log::info!("Resuming at hop {}, seeds are ignored", state.hop);
        }

        let outcome = loop {
            if !quota::should_continue_hops(state.hop, self.config.limits.max_hops) {
                log::info!("Reached hop {}, done", state.hop);
                break Outcome::Completed;
            }
            if state.current.is_empty() && state.retry.is_empty() {
                log::info!("Nothing left to expand at hop {}", state.hop);
                break Outcome::Completed;
            }
            if let ControlFlow::Break(outcome) = self.expand_hop(&mut state).await? {
                break outcome;
            }
            if let ControlFlow::Break(outcome) = self.advance_hop(&mut state)? {
                break outcome;
            }
        };
        self.store.save(&mut state)?;

        Ok(CrawlReport {
            outcome,
            hop: state.hop,
            visited: state.visited.len(),
            unreachable: state.unreachable.len(),
            frontier: state.current.len(),
            stored_bytes: self.store.stored_bytes(),
        })
    }

    async fn expand_hop(&mut self, state: &mut FrontierState) -> Result<ControlFlow<Outcome>> {
        log::info!(
            "Hop {}: {} accounts to expand, {} visited so far",
            state.hop,
            state.current.len(),
            state.visited.len()
        );

        if let ControlFlow::Break(outcome) = self.expand_profiles(state).await? {
            return Ok(ControlFlow::Break(outcome));
        }
        if let ControlFlow::Break(outcome) = self.expand_edges(state).await? {
            return Ok(ControlFlow::Break(outcome));
        }
        if self.config.limits.expands_text() {
            if let ControlFlow::Break(outcome) = self.expand_text(state).await? {
                return Ok(ControlFlow::Break(outcome));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn expand_profiles(&mut self, state: &mut FrontierState) -> Result<ControlFlow<Outcome>> {
        let members: Vec<Identifier> = state.current.iter().cloned().collect();
        for member in members {
            if state.is_unreachable(&member) {
                continue;
            }
            if let Some(id) = state.resolve(&member) {
                if matches!(member, Identifier::Handle(_)) {
                    state.current.remove(&member);
                    state.current.insert(Identifier::Id(id));
                }
                if state.visited.contains_key(&id) {
                    continue;
                }
            }

            if let ControlFlow::Break(outcome) = self.gate(state)? {
                return Ok(ControlFlow::Break(outcome));
            }

            match self.call(ProfileCall(&member)).await? {
                Fetched::Done(profile) => {
                    let record = StoredProfile::new(profile, state.hop, self.pacer.now());
                    self.store.write_profile(&record)?;
                    state.visit(&record.profile, record.key, state.hop);
                    state.growth.members.insert(record.profile.id);
                    state.current.remove(&member);
                    state.current.insert(Identifier::Id(record.profile.id));
                    log::debug!("Collected {member} as {}", record.profile.id);
                }
                Fetched::Unreachable => {
                    log::warn!("{member} is not accessible, it won't be tried again");
                    state.unreachable.insert(member);
                }
                Fetched::Skipped => (),
            }
            self.store.save(state)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn expand_edges(&mut self, state: &mut FrontierState) -> Result<ControlFlow<Outcome>> {
        let limits = self.config.limits.clone();
        if !EdgeKind::ALL.iter().any(|kind| limits.expands(*kind)) {
            return Ok(ControlFlow::Continue(()));
        }

        for id in visited_members(state) {
            if let ControlFlow::Break(outcome) = self.gate(state)? {
                return Ok(ControlFlow::Break(outcome));
            }
            let Some(mut record) = self.record_of(state, id) else {
                continue;
            };
            if !self.should_expand(&record.profile) {
                log::debug!("Not expanding {id}, degree {}", record.profile.degree());
                state.growth.rejected.insert(id);
                self.store.save(state)?;
                continue;
            }

            let mut changed = false;
            let mut batches = vec![];
            for kind in EdgeKind::ALL {
                if !limits.expands(kind) {
                    continue;
                }
                let expand_cap = limits.expand.edges(kind);
                if record.queued(kind).is_none() {
                    let fetched = if record.profile.edge_count(kind) == 0 {
                        Some(vec![])
                    } else {
                        let call = EdgesCall {
                            id,
                            kind,
                            limit: limits.fetch_cap(kind),
                        };
                        match self.call(call).await? {
                            Fetched::Done(ids) => Some(ids),
                            Fetched::Unreachable => {
                                log::warn!("The {} of {id} are not accessible", kind.as_str());
                                Some(vec![])
                            }
                            Fetched::Skipped => None,
                        }
                    };
                    if let Some(ids) = fetched {
                        let kept = quota::cap_edges(&ids, limits.store.edges(kind));
                        record.set_edges(kind, kept, quota::cap_edges(&ids, expand_cap));
                        changed = true;
                    }
                }
                if let Some(queued) = record.queued(kind) {
                    batches.push((GrowthKind::from(kind), quota::cap_edges(queued, expand_cap)));
                }
            }

            if changed {
                self.store.write_profile(&record)?;
            }
            self.merge(state, &record.profile, batches);
            self.store.save(state)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn expand_text(&mut self, state: &mut FrontierState) -> Result<ControlFlow<Outcome>> {
        let mention_cap = self.config.limits.expand.mentions;
        let reply_cap = self.config.limits.expand.replies;
        let range = self.config.timeline_range();

        for id in visited_members(state) {
            if let ControlFlow::Break(outcome) = self.gate(state)? {
                return Ok(ControlFlow::Break(outcome));
            }
            let Some(mut record) = self.record_of(state, id) else {
                continue;
            };
            if !self.should_expand(&record.profile) {
                continue;
            }

            let stored = if record.has_timeline {
                match self.store.read_timeline(record.key) {
                    Ok(posts) => Some(posts),
                    Err(e) => {
                        log::warn!("Fetching timeline of {id} again: {e:#}");
                        None
                    }
                }
            } else {
                None
            };

            let posts = match stored {
                Some(posts) => posts,
                None => {
                    let call = TimelineCall { id, range };
                    let mut posts = match self.call(call).await? {
                        Fetched::Done(posts) => posts,
                        Fetched::Unreachable => {
                            log::warn!("The timeline of {id} is not accessible");
                            vec![]
                        }
                        Fetched::Skipped => {
                            self.store.save(state)?;
                            continue;
                        }
                    };
                    posts.retain(|post| range.contains(post));
                    self.store.write_timeline(record.key, &posts)?;
                    record.has_timeline = true;
                    self.store.write_profile(&record)?;
                    posts
                }
            };

            let mut batches = vec![];
            if mention_cap != Some(0) {
                batches.push((GrowthKind::Mentions, quota::mentions(&posts, mention_cap)));
            }
            if reply_cap != Some(0) {
                batches.push((GrowthKind::Replies, quota::replies(&posts, reply_cap)));
            }
            self.merge(state, &record.profile, batches);
            self.store.save(state)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    fn advance_hop(&mut self, state: &mut FrontierState) -> Result<ControlFlow<Outcome>> {
        if self.volume_reached() {
            return Ok(ControlFlow::Break(Outcome::VolumeLimit));
        }

        self.store.write_growth(state.hop, &state.growth)?;

        // accounts skipped after failing too many times stay in the crawl
        let mut carried = BTreeSet::new();
        let mut retry = BTreeSet::new();
        for member in &state.current {
            if state.is_unreachable(member) {
                continue;
            }
            match state.resolve(member).filter(|id| state.visited.contains_key(id)) {
                Some(id) if self.unsettled(state, id) => {
                    retry.insert(id);
                }
                Some(_) => (),
                None => {
                    carried.insert(member.clone());
                }
            }
        }
        for &id in &state.retry {
            if self.unsettled(state, id) {
                retry.insert(id);
            }
        }
        if !carried.is_empty() || !retry.is_empty() {
            log::warn!(
                "Hop {}: {} accounts and the relations of {} more are tried again next hop",
                state.hop,
                carried.len(),
                retry.len()
            );
        }

        let next = std::mem::take(&mut state.next);
        let mut current: BTreeSet<Identifier> = next
            .into_iter()
            .filter(|id| !state.is_visited(id) && !state.is_unreachable(id))
            .collect();
        current.extend(carried);
        state.current = current;
        state.retry = retry;
        state.growth = HopGrowth::default();
        state.hop += 1;
        self.store.save(state)?;

        log::info!(
            "Hop {} done, {} accounts queued, {:.3} GB collected",
            state.hop - 1,
            state.current.len(),
            quota::to_gb(self.store.stored_bytes())
        );
        Ok(ControlFlow::Continue(()))
    }

    /// Checked before every account: stop request first, then volume.
    fn gate(&mut self, state: &mut FrontierState) -> Result<ControlFlow<Outcome>> {
        if self.stop.load(Ordering::SeqCst) {
            log::info!("Crawl interrupted at hop {}", state.hop);
            self.store.save(state)?;
            return Ok(ControlFlow::Break(Outcome::Interrupted));
        }
        if self.volume_reached() {
            self.store.save(state)?;
            return Ok(ControlFlow::Break(Outcome::VolumeLimit));
        }
        Ok(ControlFlow::Continue(()))
    }

    fn volume_reached(&self) -> bool {
        let bytes = self.store.stored_bytes();
        let reached = quota::should_stop(bytes, self.config.limits.max_data_gb);
        if reached {
            log::info!("Collected {:.3} GB, stopping", quota::to_gb(bytes));
        }
        reached
    }

    fn should_expand(&self, profile: &ProfileRecord) -> bool {
        match self.config.strategy {
            Strategy::BreadthFirst => true,
            Strategy::RelevanceFiltered { max_degree } => quota::within_degree(profile, max_degree),
        }
    }

    /// Whether some enabled relation of a visited account is still missing.
    fn unsettled(&self, state: &FrontierState, id: u64) -> bool {
        let Some(record) = self.record_of(state, id) else {
            return false;
        };
        if !self.should_expand(&record.profile) {
            return false;
        }
        let limits = &self.config.limits;
        let edges_missing = EdgeKind::ALL
            .iter()
            .any(|kind| limits.expands(*kind) && record.queued(*kind).is_none());
        edges_missing || (limits.expands_text() && !record.has_timeline)
    }

    fn record_of(&self, state: &FrontierState, id: u64) -> Option<StoredProfile> {
        let entry = state.visited.get(&id)?;
        match self.store.read_profile(entry.key) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping {id}, its record is unreadable: {e:#}");
                None
            }
        }
    }

    fn merge(
        &mut self,
        state: &mut FrontierState,
        member: &ProfileRecord,
        batches: Vec<(GrowthKind, Vec<u64>)>,
    ) {
        let filtered = matches!(self.config.strategy, Strategy::RelevanceFiltered { .. });
        for (kind, ids) in batches {
            let ids = if filtered {
                self.relevance.retain(member, ids)
            } else {
                ids
            };
            for id in ids {
                if state.discover(id) {
                    state.growth.get_mut(kind).insert(id);
                }
            }
        }
    }

    /// Sends one request, absorbing rate limits and retrying transient
    /// failures with exponential backoff.
    async fn call<R: Call>(&mut self, request: R) -> Result<Fetched<R::Output>> {
        let category = request.category();
        let mut attempts = 0;
        loop {
            let credential = self.pacer.before_call(&mut self.backend, category).await?;
            let result = request.send(&mut self.backend, &credential).await;
            self.pacer.after_call(category);

            match result {
                Ok(output) => return Ok(Fetched::Done(output)),
                Err(FetchError::NotFound) => return Ok(Fetched::Unreachable),
                Err(FetchError::RateLimited { retry_after }) => {
                    self.pacer.rate_limited(category, retry_after)
                }
                Err(FetchError::Unauthorized(message)) => {
                    return Err(CrawlError::Unauthorized {
                        credential: credential.name,
                        message,
                    }
                    .into())
                }
                Err(FetchError::Transient(message)) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        let err = CrawlError::FetchFailed {
                            what: request.to_string(),
                            attempts,
                            message,
                        };
                        return match self.config.on_fetch_error {
                            OnError::Fail => Err(err.into()),
                            OnError::SkipAndLog => {
                                log::error!("Skipping: {err}");
                                Ok(Fetched::Skipped)
                            }
                        };
                    }
                    let backoff = Duration::from_secs(1 << (attempts - 1).min(6));
                    log::warn!("Retrying {request} in {}s: {message}", backoff.as_secs());
                    self.pacer.sleep(backoff).await;
                }
            }
        }
    }
}

/// Numeric ids of the current members that have a profile record, followed
/// by the accounts left to retry from earlier hops.
fn visited_members(state: &FrontierState) -> Vec<u64> {
    let mut ids: Vec<u64> = state
        .current
        .iter()
        .filter_map(|member| state.resolve(member))
        .filter(|id| state.visited.contains_key(id))
        .collect();
    for &id in &state.retry {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Opens `data_dir` and runs the crawl with the system clock, stopping
/// cleanly on Ctrl-C when `handle_sigint` is set.
pub async fn crawl_network<B: Backend>(
    config: &CrawlerConfig,
    data_dir: impl AsRef<Path>,
    seeds: &[Identifier],
    backend: B,
    credentials: Vec<Credential>,
) -> Result<CrawlReport> {
    let store = FrontierStore::open(data_dir)?;
    let pool = CredentialPool::new(credentials)?;
    let mut crawler = Crawler::new(config.clone(), backend, store, pool, SystemClock);

    if config.handle_sigint {
        let stop = crawler.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping after the current account");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    crawler.run(seeds).await
}
