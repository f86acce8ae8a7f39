//! Circuit allocation tests
//!
//! Allocations run against the in-memory network in `common`, which reports
//! build outcomes before `launch` returns.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use futures::executor::block_on;
use futures::future::join_all;
use proptest::prelude::*;

use std::sync::Arc;

use common::{allocator, directory, network, FakeNetwork, RecordingSleeper};
use tor_exit_probe::{
    AllocatedCircuit, CircuitAllocator, CircuitId, ProbeError, Relay, RelayDirectory, RelayFlags, Result,
    RetryPolicy,
};

fn allocate_all(
    alloc: &tor_exit_probe::CircuitAllocator<common::FakeNetwork, tor_exit_probe::ImmediateSleeper>,
    n: usize,
) -> Vec<Result<AllocatedCircuit>> {
    block_on(join_all((0..n).map(|_| alloc.allocate())))
}

#[test]
fn test_five_concurrent_allocations_get_five_countries() {
    let net = network();
    let alloc = allocator(
        &net,
        directory(&["de", "fr", "se", "nl", "ch"]),
        RetryPolicy::bounded(1, Duration::ZERO),
    );

    let allocated: Vec<AllocatedCircuit> = allocate_all(&alloc, 5)
        .into_iter()
        .collect::<Result<_>>()
        .unwrap();

    let countries: HashSet<&str> = allocated
        .iter()
        .map(|a| a.exit().country_code.as_str())
        .collect();
    let exits: HashSet<&str> = allocated
        .iter()
        .map(|a| a.exit().fingerprint.as_str())
        .collect();
    assert_eq!(countries.len(), 5);
    assert_eq!(exits.len(), 5);
    assert_eq!(alloc.pending_count(), 5);

    let stats = alloc.stats();
    assert_eq!(stats.attempts, 5);
    assert_eq!(stats.no_candidates, 0);
    assert_eq!(stats.build_failures, 0);
    assert_eq!(stats.circuits_built, 5);

    drop(allocated);
    assert_eq!(alloc.pending_count(), 0);
}

#[test]
fn test_allocation_waits_while_every_country_is_pending() {
    let net = network();
    let alloc = allocator(
        &net,
        directory(&["de", "fr"]),
        RetryPolicy::bounded(3, Duration::ZERO),
    );

    let results = allocate_all(&alloc, 3);
    let failed: Vec<&ProbeError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed[0],
        ProbeError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(alloc.stats().no_candidates, 3);
    assert_eq!(alloc.pending_count(), 2);
}

#[test]
fn test_build_failure_retries_with_a_new_circuit() {
    let net = network();
    net.fail_next_builds(1);
    let alloc = allocator(
        &net,
        directory(&["de", "fr", "se"]),
        RetryPolicy::bounded(5, Duration::ZERO),
    );

    let allocated = block_on(alloc.allocate()).unwrap();
    let launched = net.launched();

    assert_eq!(launched.len(), 2);
    assert_eq!(allocated.circuit().id, CircuitId(2));
    assert_eq!(allocated.circuit().path, launched[1].path);
    assert!(allocated.circuit().is_built());

    let stats = alloc.stats();
    assert_eq!(stats.build_failures, 1);
    assert_eq!(stats.circuits_built, 1);

    // Only the successful attempt's exit is still claimed
    assert_eq!(
        alloc.pending_exits(),
        vec![allocated.exit().fingerprint.clone()]
    );
}

#[test]
fn test_rejected_launches_retry_without_losing_the_claim() {
    let net = network();
    net.reject_next_launches(2);
    let alloc = allocator(
        &net,
        directory(&["de", "fr"]),
        RetryPolicy::bounded(3, Duration::ZERO),
    );

    let allocated = block_on(alloc.allocate()).unwrap();
    let stats = alloc.stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.launch_rejections, 2);
    assert_eq!(net.launched().len(), 1);
    assert_eq!(alloc.pending_count(), 1);

    let (_, claim) = allocated.into_parts();
    claim.release();
    assert_eq!(alloc.pending_count(), 0);
}

fn timed_allocator(
    net: &Arc<FakeNetwork>,
    policy: RetryPolicy,
) -> (CircuitAllocator<FakeNetwork, RecordingSleeper>, RecordingSleeper) {
    let sleeper = RecordingSleeper::default();
    let alloc = CircuitAllocator::new(
        Arc::new(directory(&["de", "fr", "se"])),
        Arc::clone(net),
        Arc::clone(net.controller().tracker()),
    )
    .with_policy(policy)
    .with_sleeper(sleeper.clone());
    (alloc, sleeper)
}

#[test]
fn test_rejected_launch_retries_without_waiting() {
    let net = network();
    net.reject_next_launches(3);
    let (alloc, sleeper) = timed_allocator(&net, RetryPolicy::bounded(4, Duration::from_millis(250)));

    block_on(alloc.allocate()).unwrap();

    assert_eq!(alloc.stats().launch_rejections, 3);
    assert!(sleeper.calls().is_empty());
}

#[test]
fn test_failed_build_waits_one_interval_before_retrying() {
    let net = network();
    net.fail_next_builds(2);
    let delay = Duration::from_millis(250);
    let (alloc, sleeper) = timed_allocator(&net, RetryPolicy::bounded(4, delay));

    block_on(alloc.allocate()).unwrap();

    assert_eq!(alloc.stats().build_failures, 2);
    assert_eq!(sleeper.calls(), vec![delay, delay]);
}

#[test]
fn test_exhausted_allocation_leaves_nothing_pending() {
    let net = network();
    net.fail_next_builds(10);
    let alloc = allocator(
        &net,
        directory(&["de", "fr"]),
        RetryPolicy::bounded(4, Duration::ZERO),
    );

    let err = block_on(alloc.allocate()).unwrap_err();
    assert!(matches!(err, ProbeError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(alloc.stats().build_failures, 4);
    assert_eq!(alloc.pending_count(), 0);
}

const COUNTRIES: &[&str] = &["de", "fr", "se", "nl", "ch", "us", "is"];

fn crowded_directory(countries: usize, per_country: usize) -> RelayDirectory {
    let mut relays = Vec::new();
    for (c, cc) in COUNTRIES.iter().take(countries).enumerate() {
        for k in 0..per_country {
            relays.push(Relay::new(
                format!("{}{}", cc, k),
                format!("{:040X}", c * 16 + k + 1),
                *cc,
                RelayFlags::from_string("Exit Guard Running Valid"),
            ));
        }
    }
    // Non-exit relays give the path builder somewhere else to go
    relays.push(Relay::new(
        "middle",
        "F".repeat(40),
        "at",
        RelayFlags::from_string("Guard Running Valid"),
    ));
    RelayDirectory::new(relays)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn concurrent_claims_never_share_a_country(
        countries in 1usize..=7,
        per_country in 1usize..4,
        failures in 0usize..4,
    ) {
        let net = network();
        net.fail_next_builds(failures);
        let alloc = allocator(
            &net,
            crowded_directory(countries, per_country),
            RetryPolicy::bounded(20, Duration::ZERO),
        );

        let allocated: Vec<AllocatedCircuit> = allocate_all(&alloc, countries)
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();

        let claimed: HashSet<String> = allocated
            .iter()
            .map(|a| a.exit().country_code.clone())
            .collect();
        prop_assert_eq!(claimed.len(), countries);
        prop_assert_eq!(alloc.pending_countries(), claimed);

        drop(allocated);
        prop_assert_eq!(alloc.pending_count(), 0);
    }
}
