//! Durable crawl state.
//!
//! Layout of a data directory:
//!
//! ```text
//! frontier.a.json, frontier.b.json   alternating snapshot slots
//! profiles/profile_<uuid>.json       one record per visited account
//! timelines/timeline_<uuid>.json     timeline of the record with the same uuid
//! growth/h<hop>_<kind>.json          accounts added per hop and relation
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{EdgeKind, Identifier, Post, ProfileRecord};

const SLOTS: [&str; 2] = ["frontier.a.json", "frontier.b.json"];
const PROFILES: &str = "profiles";
const TIMELINES: &str = "timelines";
const GROWTH: &str = "growth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthKind {
    Members,
    Friends,
    Followers,
    Mentions,
    Replies,
    /// Members that were collected but not expanded
    Rejected,
}

impl GrowthKind {
    pub const ALL: [GrowthKind; 6] = [
        GrowthKind::Members,
        GrowthKind::Friends,
        GrowthKind::Followers,
        GrowthKind::Mentions,
        GrowthKind::Replies,
        GrowthKind::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Members => "members",
            Self::Friends => "friends",
            Self::Followers => "followers",
            Self::Mentions => "mentions",
            Self::Replies => "replies",
            Self::Rejected => "rejected",
        }
    }
}

impl From<EdgeKind> for GrowthKind {
    fn from(kind: EdgeKind) -> Self {
        match kind {
            EdgeKind::Friends => Self::Friends,
            EdgeKind::Followers => Self::Followers,
        }
    }
}

/// Accounts gathered during one hop, by the relation that brought them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopGrowth {
    #[serde(default)]
    pub members: BTreeSet<u64>,
    #[serde(default)]
    pub friends: BTreeSet<u64>,
    #[serde(default)]
    pub followers: BTreeSet<u64>,
    #[serde(default)]
    pub mentions: BTreeSet<u64>,
    #[serde(default)]
    pub replies: BTreeSet<u64>,
    #[serde(default)]
    pub rejected: BTreeSet<u64>,
}

impl HopGrowth {
    pub fn get(&self, kind: GrowthKind) -> &BTreeSet<u64> {
        match kind {
            GrowthKind::Members => &self.members,
            GrowthKind::Friends => &self.friends,
            GrowthKind::Followers => &self.followers,
            GrowthKind::Mentions => &self.mentions,
            GrowthKind::Replies => &self.replies,
            GrowthKind::Rejected => &self.rejected,
        }
    }

    pub fn get_mut(&mut self, kind: GrowthKind) -> &mut BTreeSet<u64> {
        match kind {
            GrowthKind::Members => &mut self.members,
            GrowthKind::Friends => &mut self.friends,
            GrowthKind::Followers => &mut self.followers,
            GrowthKind::Mentions => &mut self.mentions,
            GrowthKind::Replies => &mut self.replies,
            GrowthKind::Rejected => &mut self.rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitedEntry {
    pub key: Uuid,
    pub hop: u32,
}

/// Everything needed to resume a crawl.
///
/// Identifiers in `visited` are never put back in `current` or `next`.
/// Handles are replaced by their numeric id once resolved, `handles` keeps
/// the resolution so a seed given again as a handle is recognised. `retry`
/// holds visited accounts whose relations could not all be collected, they
/// are expanded again along with the next hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierState {
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub hop: u32,
    #[serde(default)]
    pub current: BTreeSet<Identifier>,
    #[serde(default)]
    pub next: BTreeSet<Identifier>,
    #[serde(default)]
    pub visited: BTreeMap<u64, VisitedEntry>,
    #[serde(default)]
    pub handles: BTreeMap<String, u64>,
    #[serde(default)]
    pub unreachable: BTreeSet<Identifier>,
    #[serde(default)]
    pub retry: BTreeSet<u64>,
    #[serde(default)]
    pub growth: HopGrowth,
}

impl FrontierState {
    /// Numeric id behind an identifier, if it has been resolved.
    pub fn resolve(&self, id: &Identifier) -> Option<u64> {
        match id {
            Identifier::Id(id) => Some(*id),
            Identifier::Handle(handle) => self.handles.get(&handle.to_lowercase()).copied(),
        }
    }

    pub fn is_visited(&self, id: &Identifier) -> bool {
        self.resolve(id).map_or(false, |id| self.visited.contains_key(&id))
    }

    pub fn is_unreachable(&self, id: &Identifier) -> bool {
        self.unreachable.contains(id)
            || self
                .resolve(id)
                .map_or(false, |id| self.unreachable.contains(&Identifier::Id(id)))
    }

    /// Marks `id` visited, keeping the first entry if it already was.
    pub fn visit(&mut self, profile: &ProfileRecord, key: Uuid, hop: u32) {
        self.handles
            .insert(profile.handle.to_lowercase(), profile.id);
        self.visited
            .entry(profile.id)
            .or_insert(VisitedEntry { key, hop });
    }

    /// Queues `id` for the next hop unless it was already visited or found
    /// unreachable. Returns whether `id` is queued.
    pub fn discover(&mut self, id: u64) -> bool {
        let id = Identifier::Id(id);
        if self.is_visited(&id) || self.is_unreachable(&id) {
            return false;
        }
        self.next.insert(id);
        true
    }
}

/// Everything known about one visited account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredProfile {
    pub key: Uuid,
    pub hop: u32,
    pub collected_at: DateTime<Utc>,
    pub profile: ProfileRecord,
    /// Kept relations, `None` until collected
    #[serde(default)]
    pub friends: Option<Vec<u64>>,
    #[serde(default)]
    pub followers: Option<Vec<u64>>,
    /// Relations handed to the next hop
    #[serde(default)]
    pub queued_friends: Option<Vec<u64>>,
    #[serde(default)]
    pub queued_followers: Option<Vec<u64>>,
    #[serde(default)]
    pub has_timeline: bool,
}

impl StoredProfile {
    pub fn new(profile: ProfileRecord, hop: u32, collected_at: DateTime<Utc>) -> Self {
        Self {
            key: Uuid::new_v4(),
            hop,
            collected_at,
            profile,
            friends: None,
            followers: None,
            queued_friends: None,
            queued_followers: None,
            has_timeline: false,
        }
    }

    pub fn edges(&self, kind: EdgeKind) -> Option<&[u64]> {
        match kind {
            EdgeKind::Friends => self.friends.as_deref(),
            EdgeKind::Followers => self.followers.as_deref(),
        }
    }

    pub fn queued(&self, kind: EdgeKind) -> Option<&[u64]> {
        match kind {
            EdgeKind::Friends => self.queued_friends.as_deref(),
            EdgeKind::Followers => self.queued_followers.as_deref(),
        }
    }

    pub fn set_edges(&mut self, kind: EdgeKind, kept: Vec<u64>, queued: Vec<u64>) {
        match kind {
            EdgeKind::Friends => {
                self.friends = Some(kept);
                self.queued_friends = Some(queued);
            }
            EdgeKind::Followers => {
                self.followers = Some(kept);
                self.queued_followers = Some(queued);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    /// Nothing on disk yet
    Fresh,
    /// Newest snapshot slot
    Snapshot(usize),
    /// A more recent slot was unreadable, this one was used instead
    Fallback(usize),
    /// No usable snapshot, state derived from the stored records
    Rebuilt,
}

#[derive(Debug)]
pub struct Loaded {
    pub state: FrontierState,
    pub origin: LoadOrigin,
}

/// Sole writer of a data directory.
#[derive(Debug)]
pub struct FrontierStore {
    dir: PathBuf,
    stored_bytes: u64,
}

impl FrontierStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        for sub in [PROFILES, TIMELINES, GROWTH] {
            fs_err::create_dir_all(dir.join(sub))?;
        }

        let mut stored_bytes = 0;
        for sub in [PROFILES, TIMELINES] {
            for entry in fs_err::read_dir(dir.join(sub))? {
                let entry = entry?;
                if is_record(&entry.path()) {
                    stored_bytes += entry.metadata()?.len();
                }
            }
        }
        log::debug!("Opened {} holding {stored_bytes} bytes", dir.display());

        Ok(Self { dir, stored_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Size of profile and timeline records, excluding snapshots.
    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes
    }

    pub fn load(&self) -> anyhow::Result<Loaded> {
        let mut present = 0;
        let mut newest: Option<(usize, FrontierState, Option<SystemTime>)> = None;
        let mut failed: Option<Option<SystemTime>> = None;
        for (slot, name) in SLOTS.iter().enumerate() {
            let path = self.dir.join(name);
            if !path.exists() {
                continue;
            }
            present += 1;
            let modified = fs_err::metadata(&path).ok().and_then(|m| m.modified().ok());
            match read_json::<FrontierState>(&path) {
                Ok(state) => {
                    if newest
                        .as_ref()
                        .map_or(true, |(_, best, _)| state.generation > best.generation)
                    {
                        newest = Some((slot, state, modified));
                    }
                }
                Err(e) => {
                    failed = Some(modified);
                    log::warn!("Ignoring unreadable snapshot: {e:#}");
                }
            }
        }

        let records = self.records()?;
        let (mut state, origin) = match newest {
            Some((slot, state, modified)) if !is_newer(failed, modified) => {
                (state, LoadOrigin::Snapshot(slot))
            }
            Some((slot, state, _)) => {
                log::warn!("Resuming from older snapshot {}", SLOTS[slot]);
                (state, LoadOrigin::Fallback(slot))
            }
            None if present > 0 => {
                log::error!(
                    "Every snapshot in {} is unreadable, rebuilding from {} records",
                    self.dir.display(),
                    records.len()
                );
                (rebuild(&records), LoadOrigin::Rebuilt)
            }
            None if !records.is_empty() => {
                log::warn!(
                    "No snapshot in {}, rebuilding from {} records",
                    self.dir.display(),
                    records.len()
                );
                (rebuild(&records), LoadOrigin::Rebuilt)
            }
            None => {
                log::info!("Starting a new crawl in {}", self.dir.display());
                (FrontierState::default(), LoadOrigin::Fresh)
            }
        };

        let mut reconciled = 0;
        for record in &records {
            if !state.visited.contains_key(&record.profile.id) {
                reconciled += 1;
                if record.hop == state.hop {
                    state.growth.members.insert(record.profile.id);
                }
            }
            state.visit(&record.profile, record.key, record.hop);
        }
        if reconciled > 0 {
            log::info!("Recovered {reconciled} visited accounts from stored records");
        }

        Ok(Loaded { state, origin })
    }

    /// Persists `state` in the slot not holding the previous snapshot.
    pub fn save(&self, state: &mut FrontierState) -> anyhow::Result<()> {
        state.generation += 1;
        let path = self.dir.join(SLOTS[(state.generation % 2) as usize]);
        let bytes = serde_json::to_vec(state)?;
        write_atomic(&path, &bytes).context("Couldn't save frontier snapshot")
    }

    /// Drops both snapshots. Records are kept, a later `load` rebuilds the
    /// visited accounts from them.
    pub fn clear(&self) -> anyhow::Result<()> {
        for name in SLOTS {
            let path = self.dir.join(name);
            if path.exists() {
                fs_err::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn write_profile(&mut self, record: &StoredProfile) -> anyhow::Result<()> {
        let path = self.profile_path(record.key);
        let bytes = serde_json::to_vec(record)?;
        self.write_record(&path, &bytes)
    }

    pub fn read_profile(&self, key: Uuid) -> anyhow::Result<StoredProfile> {
        read_json(&self.profile_path(key))
    }

    pub fn write_timeline(&mut self, key: Uuid, posts: &[Post]) -> anyhow::Result<()> {
        let path = self.timeline_path(key);
        let bytes = serde_json::to_vec(posts)?;
        self.write_record(&path, &bytes)
    }

    pub fn read_timeline(&self, key: Uuid) -> anyhow::Result<Vec<Post>> {
        read_json(&self.timeline_path(key))
    }

    /// Writes one file per relation for `hop`. Existing files are left as is.
    pub fn write_growth(&self, hop: u32, growth: &HopGrowth) -> anyhow::Result<()> {
        for kind in GrowthKind::ALL {
            let path = self.growth_path(hop, kind);
            if path.exists() {
                log::debug!("Keeping existing {}", path.display());
                continue;
            }
            let bytes = serde_json::to_vec(growth.get(kind))?;
            write_atomic(&path, &bytes)?;
        }
        Ok(())
    }

    pub fn read_growth(&self, hop: u32, kind: GrowthKind) -> anyhow::Result<Option<BTreeSet<u64>>> {
        let path = self.growth_path(hop, kind);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn write_record(&mut self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let previous = fs_err::metadata(path).map(|m| m.len()).unwrap_or(0);
        write_atomic(path, bytes)?;
        self.stored_bytes =
            self.stored_bytes - previous.min(self.stored_bytes) + bytes.len() as u64;
        Ok(())
    }

    /// Every readable profile record. Unreadable ones are skipped so the
    /// account is fetched again.
    fn records(&self) -> anyhow::Result<Vec<StoredProfile>> {
        let mut records = vec![];
        for entry in fs_err::read_dir(self.dir.join(PROFILES))? {
            let path = entry?.path();
            if !is_record(&path) {
                continue;
            }
            match read_json::<StoredProfile>(&path) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Ignoring unreadable record: {e:#}"),
            }
        }
        records.sort_by_key(|r| r.collected_at);
        Ok(records)
    }

    fn profile_path(&self, key: Uuid) -> PathBuf {
        self.dir.join(PROFILES).join(format!("profile_{key}.json"))
    }

    fn timeline_path(&self, key: Uuid) -> PathBuf {
        self.dir.join(TIMELINES).join(format!("timeline_{key}.json"))
    }

    fn growth_path(&self, hop: u32, kind: GrowthKind) -> PathBuf {
        self.dir
            .join(GROWTH)
            .join(format!("h{hop}_{}.json", kind.as_str()))
    }
}

/// Best effort state when no snapshot survived: the latest hop found in the
/// records becomes the current hop, with its members as the frontier.
fn rebuild(records: &[StoredProfile]) -> FrontierState {
    let mut state = FrontierState {
        hop: records.iter().map(|r| r.hop).max().unwrap_or(0),
        ..Default::default()
    };
    state.current = records
        .iter()
        .filter(|r| r.hop == state.hop)
        .map(|r| Identifier::Id(r.profile.id))
        .collect();
    state
}

/// Whether the unreadable slot, if any, was written after the chosen one.
/// Unknown times count as newer.
fn is_newer(failed: Option<Option<SystemTime>>, chosen: Option<SystemTime>) -> bool {
    match (failed, chosen) {
        (None, _) => false,
        (Some(Some(failed)), Some(chosen)) => failed >= chosen,
        (Some(_), _) => true,
    }
}

fn is_record(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "json")
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = fs_err::read(path)?;
    serde_json::from_slice(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = fs_err::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs_err::rename(&tmp, path)?;
    Ok(())
}
