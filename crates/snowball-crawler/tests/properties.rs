mod common;

use std::collections::{BTreeSet, HashMap};

use chrono::Duration;
use snowball_crawler::{
    quota, Category, CollectionLimits, CrawlError, FrontierState, FrontierStore, GrowthKind,
    Identifier, OnError, Outcome, ProfileRecord, RelevanceFilter, StoredProfile, Strategy,
};

use common::*;

/// Small graph with cycles, shared neighbours and timelines.
fn tangled() -> FakeNetwork {
    FakeNetwork::new()
        .user(1, "one", &[2, 3, 4], &[5])
        .user(2, "two", &[1, 6], &[3])
        .user(3, "three", &[7, 1], &[])
        .user(4, "four", &[], &[8, 2])
        .user(6, "six", &[9, 1, 2], &[10])
        .timeline(1, vec![post(1, Some(11), &[12, 2])])
        .timeline(3, vec![post(2, None, &[13]), post(3, Some(1), &[])])
}

fn tangled_limits() -> CollectionLimits {
    let mut limits = CollectionLimits::unbounded(3);
    limits.expand.friends = Some(2);
    limits.store.friends = Some(3);
    limits
}

fn growth_of(dir: &std::path::Path, hops: u32) -> Vec<Option<BTreeSet<u64>>> {
    let store = FrontierStore::open(dir).unwrap();
    (0..hops)
        .flat_map(|hop| GrowthKind::ALL.map(|kind| (hop, kind)))
        .map(|(hop, kind)| store.read_growth(hop, kind).unwrap())
        .collect()
}

#[tokio::test]
async fn resume_after_any_interruption_matches_uninterrupted_run() {
    let seeds = [Identifier::from("one")];

    let reference = tempfile::tempdir().unwrap();
    let mut full = crawler(reference.path(), config(tangled_limits()), tangled(), creds(&["k"]));
    full.run(&seeds).await.unwrap();
    let total_calls = full.backend().calls.len();
    let expected = load(reference.path());
    let expected_growth = growth_of(reference.path(), 3);
    assert!(total_calls > 10);

    for stop_after in 1..total_calls {
        let dir = tempfile::tempdir().unwrap();
        let mut first = crawler(dir.path(), config(tangled_limits()), tangled(), creds(&["k"]));
        let stop = first.stop_handle();
        first.backend_mut().interrupt_after(None, stop_after, stop);
        first.run(&seeds).await.unwrap();

        let mut resumed = crawler(dir.path(), config(tangled_limits()), tangled(), creds(&["k"]));
        let report = resumed.run(&seeds).await.unwrap();
        assert_eq!(Outcome::Completed, report.outcome);

        let actual = load(dir.path());
        assert_eq!(
            expected.visited.keys().collect::<Vec<_>>(),
            actual.visited.keys().collect::<Vec<_>>(),
            "visited differ when stopped after {stop_after} calls"
        );
        assert_eq!(expected.current, actual.current, "stopped after {stop_after} calls");
        assert_eq!(expected.unreachable, actual.unreachable);
        assert_eq!(expected.hop, actual.hop);
        assert_eq!(expected_growth, growth_of(dir.path(), 3), "stopped after {stop_after} calls");

        // nothing collected before the interruption is fetched again
        let before = &first.backend().calls;
        let after = &resumed.backend().calls;
        for call in after {
            assert!(
                !before
                    .iter()
                    .any(|c| c.category == call.category && c.target == call.target),
                "{call:?} repeated when stopped after {stop_after} calls"
            );
        }
        assert_eq!(total_calls, before.len() + after.len());
    }
}

#[tokio::test]
async fn visited_accounts_never_return_to_the_frontier() {
    let dir = tempfile::tempdir().unwrap();
    let mut crawler = crawler(
        dir.path(),
        config(CollectionLimits::unbounded(5)),
        tangled(),
        creds(&["k"]),
    );
    crawler.run(&[Identifier::Id(1)]).await.unwrap();

    let mut lookups: HashMap<&str, usize> = HashMap::new();
    for call in crawler.backend().calls_of(Category::Users) {
        *lookups.entry(call.target.as_str()).or_default() += 1;
    }
    assert!(lookups.values().all(|&n| n == 1), "{lookups:?}");

    let store = FrontierStore::open(dir.path()).unwrap();
    let mut seen = BTreeSet::new();
    for hop in 0..5 {
        let members = store.read_growth(hop, GrowthKind::Members).unwrap().unwrap_or_default();
        assert!(seen.is_disjoint(&members), "hop {hop} revisits {members:?}");
        seen.extend(members);
    }

    let state = load(dir.path());
    assert!(state.current.iter().all(|id| !state.is_visited(id)));
    for (id, entry) in &state.visited {
        let members = store.read_growth(entry.hop, GrowthKind::Members).unwrap().unwrap();
        assert!(members.contains(id));
    }
}

#[tokio::test]
async fn zero_hops_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut crawler = crawler(
        dir.path(),
        config(CollectionLimits::unbounded(0)),
        tangled(),
        creds(&["k"]),
    );
    let report = crawler.run(&[Identifier::Id(1)]).await.unwrap();

    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(0, report.hop);
    assert_eq!(0, report.visited);
    assert!(crawler.backend().calls.is_empty());
    assert!(crawler.backend().status_calls.is_empty());
}

#[tokio::test]
async fn hops_only_move_forward_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let seeds = [Identifier::Id(1)];

    let mut hops = vec![];
    for max_hops in [1, 1, 2, 4] {
        let mut crawler = crawler(
            dir.path(),
            config(CollectionLimits::unbounded(max_hops)),
            tangled(),
            creds(&["k"]),
        );
        hops.push(crawler.run(&seeds).await.unwrap().hop);
    }
    assert_eq!(vec![1, 1, 2, 4], hops);

    let state = load(dir.path());
    let visited_hops: BTreeSet<u32> = state.visited.values().map(|entry| entry.hop).collect();
    assert_eq!(BTreeSet::from([0, 1, 2, 3]), visited_hops);
}

#[tokio::test]
async fn volume_ceiling_stops_before_next_account() {
    let dir = tempfile::tempdir().unwrap();
    let network = FakeNetwork::new()
        .user(1, "a", &[4], &[])
        .user(2, "b", &[5], &[])
        .user(3, "c", &[6], &[])
        .padding(3000);
    let mut limits = friends_only(3);
    limits.max_data_gb = Some(4000.0 / quota::BYTES_PER_GB);

    let seeds: Vec<_> = (1..=3).map(Identifier::Id).collect();
    let mut crawler = crawler(dir.path(), config(limits.clone()), network.clone(), creds(&["k"]));
    let report = crawler.run(&seeds).await.unwrap();

    assert_eq!(Outcome::VolumeLimit, report.outcome);
    assert_eq!(0, report.hop);
    assert!(quota::should_stop(report.stored_bytes, limits.max_data_gb));
    assert_eq!(2, crawler.backend().calls_of(Category::Users).len());
    assert!(crawler.backend().calls_of(Category::Friends).is_empty());

    // stopping is not an error and stays stopped
    let mut again = common::crawler(dir.path(), config(limits), network, creds(&["k"]));
    let report = again.run(&seeds).await.unwrap();
    assert_eq!(Outcome::VolumeLimit, report.outcome);
    assert!(again.backend().calls.is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let network = FakeNetwork::new().flaky(1, 2);
    let mut crawler = crawler(dir.path(), config(friends_only(1)), network, creds(&["k"]));
    let report = crawler.run(&[Identifier::Id(1)]).await.unwrap();

    assert_eq!(1, report.visited);
    // 1s then 2s
    assert_eq!(start() + Duration::seconds(3), crawler.backend().now());
}

#[tokio::test]
async fn exhausted_retries_follow_on_error_policy() {
    let seeds = [Identifier::Id(1), Identifier::Id(2)];

    let dir = tempfile::tempdir().unwrap();
    let mut skip = crawler(
        dir.path(),
        config(friends_only(1)),
        FakeNetwork::new().flaky(1, 10),
        creds(&["k"]),
    );
    let report = skip.run(&seeds).await.unwrap();
    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(1, report.visited);
    assert_eq!(0, report.unreachable);
    assert!(load(dir.path()).current.contains(&Identifier::Id(1)));

    let dir = tempfile::tempdir().unwrap();
    let mut conf = config(friends_only(1));
    conf.on_fetch_error = OnError::Fail;
    conf.max_retries = 1;
    let mut fail = crawler(dir.path(), conf, FakeNetwork::new().flaky(1, 10), creds(&["k"]));
    let err = fail.run(&seeds).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CrawlError>(),
        Some(CrawlError::FetchFailed { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn rejected_credential_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut crawler = crawler(
        dir.path(),
        config(friends_only(1)),
        FakeNetwork::new().reject("revoked"),
        creds(&["revoked", "spare"]),
    );
    let err = crawler.run(&[Identifier::Id(1)]).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CrawlError>(),
        Some(CrawlError::Unauthorized { credential, .. }) if credential == "revoked"
    ));
}

#[tokio::test]
async fn single_credential_waits_for_reset() {
    let dir = tempfile::tempdir().unwrap();
    let reset = start() + Duration::minutes(3);
    let network = FakeNetwork::new().quota("solo", Category::Users, 1, 1, reset);
    let mut crawler = crawler(dir.path(), config(friends_only(1)), network, creds(&["solo"]));
    let report = crawler
        .run(&[Identifier::Id(1), Identifier::Id(2)])
        .await
        .unwrap();
    assert_eq!(2, report.visited);

    let users = crawler.backend().calls_of(Category::Users);
    assert_eq!(start(), users[0].at);
    // short wait: reset plus grace, no rotation attempted
    assert_eq!(reset + Duration::seconds(5), users[1].at);
}

struct EvenOnly;

impl RelevanceFilter for EvenOnly {
    fn retain(&mut self, _member: &ProfileRecord, candidates: Vec<u64>) -> Vec<u64> {
        candidates.into_iter().filter(|id| id % 2 == 0).collect()
    }
}

#[tokio::test]
async fn relevance_strategy_filters_and_rejects_hubs() {
    let dir = tempfile::tempdir().unwrap();
    let network = FakeNetwork::new()
        .user(1, "hub", &[20, 21, 22, 23], &[24])
        .user(2, "small", &[30, 31, 32], &[]);
    let mut conf = config(friends_only(1));
    conf.strategy = Strategy::RelevanceFiltered {
        max_degree: Some(4),
    };

    let mut crawler = crawler(dir.path(), conf, network, creds(&["k"])).with_relevance(EvenOnly);
    crawler
        .run(&[Identifier::Id(1), Identifier::Id(2)])
        .await
        .unwrap();

    let friends = crawler.backend().calls_of(Category::Friends);
    assert_eq!(1, friends.len());
    assert_eq!("2", friends[0].target);

    let state = load(dir.path());
    assert_eq!(ids([30, 32]), state.current);
    let store = FrontierStore::open(dir.path()).unwrap();
    assert_eq!(
        Some(BTreeSet::from([1])),
        store.read_growth(0, GrowthKind::Rejected).unwrap()
    );
}

#[tokio::test]
async fn skipped_account_is_collected_next_hop() {
    let dir = tempfile::tempdir().unwrap();
    let network = FakeNetwork::new()
        .user(1, "a", &[], &[])
        .user(2, "b", &[3], &[])
        .flaky(1, 4);
    let mut crawler = crawler(dir.path(), config(friends_only(3)), network, creds(&["k"]));
    let report = crawler
        .run(&[Identifier::Id(1), Identifier::Id(2)])
        .await
        .unwrap();
    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(3, report.visited);

    let state = load(dir.path());
    assert_eq!(Some(1), state.visited.get(&1).map(|entry| entry.hop));
    let lookups = crawler.backend().calls_of(Category::Users);
    assert_eq!(5, lookups.iter().filter(|call| call.target == "1").count());

    let store = FrontierStore::open(dir.path()).unwrap();
    let members = |hop| store.read_growth(hop, GrowthKind::Members).unwrap();
    assert_eq!(Some(BTreeSet::from([2])), members(0));
    assert_eq!(Some(BTreeSet::from([1, 3])), members(1));
}

#[tokio::test]
async fn skipped_relations_are_collected_next_hop() {
    let dir = tempfile::tempdir().unwrap();
    let network = FakeNetwork::new()
        .user(1, "a", &[5], &[])
        .user(5, "e", &[6], &[])
        .flaky_in(Category::Friends, 1, 4);
    let mut crawler = crawler(dir.path(), config(friends_only(3)), network, creds(&["k"]));
    let report = crawler.run(&[Identifier::Id(1)]).await.unwrap();
    assert_eq!(Outcome::Completed, report.outcome);
    assert_eq!(3, report.hop);

    let state = load(dir.path());
    assert!(state.retry.is_empty());
    assert_eq!(ids([6]), state.current);
    assert_eq!(Some(0), state.visited.get(&1).map(|entry| entry.hop));
    assert_eq!(Some(2), state.visited.get(&5).map(|entry| entry.hop));

    let friends = crawler.backend().calls_of(Category::Friends);
    assert_eq!(5, friends.iter().filter(|call| call.target == "1").count());

    let store = FrontierStore::open(dir.path()).unwrap();
    let friends = |hop| store.read_growth(hop, GrowthKind::Friends).unwrap();
    assert_eq!(Some(BTreeSet::new()), friends(0));
    assert_eq!(Some(BTreeSet::from([5])), friends(1));
}

#[tokio::test]
async fn record_written_before_crash_keeps_its_provenance() {
    let network = FakeNetwork::new().user(1, "alice", &[2], &[]);
    let seeds = [Identifier::from("alice")];

    let reference = tempfile::tempdir().unwrap();
    let mut full = crawler(
        reference.path(),
        config(friends_only(1)),
        network.clone(),
        creds(&["k"]),
    );
    full.run(&seeds).await.unwrap();

    // the record reached the disk, the snapshot after it did not
    let dir = tempfile::tempdir().unwrap();
    let mut store = FrontierStore::open(dir.path()).unwrap();
    let mut state = FrontierState::default();
    state.current.insert(Identifier::from("alice"));
    store.save(&mut state).unwrap();
    let mut profile = ProfileRecord::new(1, "alice");
    profile.friends_count = 1;
    store
        .write_profile(&StoredProfile::new(profile, 0, start()))
        .unwrap();

    let mut resumed = crawler(dir.path(), config(friends_only(1)), network, creds(&["k"]));
    resumed.run(&seeds).await.unwrap();

    assert!(resumed.backend().calls_of(Category::Users).is_empty());
    assert_eq!(growth_of(reference.path(), 1), growth_of(dir.path(), 1));
    assert_eq!(load(reference.path()).current, load(dir.path()).current);
}
