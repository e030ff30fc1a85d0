use proptest::prelude::*;

use geoscan_core::{JobId, TargetId};
use geoscan_infra::jobs::{InMemoryJobQueue, JobQueue, SqliteJobQueue};

/// Claim everything and check highest priority first, FIFO within a priority.
fn check_claim_order(queue: &dyn JobQueue, priorities: &[i32]) {
    let enqueued: Vec<(JobId, i32)> = priorities
        .iter()
        .map(|&p| (queue.enqueue(TargetId::new(), p).unwrap(), p))
        .collect();

    let mut expected = enqueued.clone();
    expected.sort_by(|a, b| b.1.cmp(&a.1));

    let mut claimed = Vec::new();
    while let Some(job) = queue.claim_next("prop").unwrap() {
        claimed.push((job.id, job.priority));
    }
    assert_eq!(claimed, expected);
    assert_eq!(queue.stats().unwrap().running, priorities.len() as u64);
}

proptest! {
    #[test]
    fn in_memory_claims_in_priority_order(priorities in prop::collection::vec(-3i32..3, 0..40)) {
        check_claim_order(&InMemoryJobQueue::new(), &priorities);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn sqlite_claims_in_priority_order(priorities in prop::collection::vec(-3i32..3, 0..20)) {
        let dir = tempfile::tempdir().unwrap();
        let queue = SqliteJobQueue::open(dir.path().join("state.db")).unwrap();
        check_claim_order(&queue, &priorities);
    }
}
