mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use assert_matches::assert_matches;
use chrono::TimeDelta;

use seqgate::domain::{ArtifactKey, FileRole};
use seqgate::error::GateError;
use seqgate::registry::SpecRegistry;
use seqgate::tracker::{
    Admission, ArtifactTracker, CompleteArtifact, DuplicatePolicy, Replay, TrackerSettings,
};
use seqgate::verdict::{Resolution, RuleCode};

use common::{
    FORWARD_KEY, ILLUMINA_BUCKET, METADATA_KEY, ONT_BUCKET, REVERSE_KEY, admission_inputs, at,
    registry,
};

const ILLUMINA_KEYS: [&str; 3] = [FORWARD_KEY, REVERSE_KEY, METADATA_KEY];

fn tracker(policy: DuplicatePolicy) -> (Arc<SpecRegistry>, ArtifactTracker) {
    let registry = registry();
    let settings = TrackerSettings {
        staleness: TimeDelta::hours(1),
        resolved_retention: TimeDelta::days(1),
        duplicate_policy: policy,
    };
    (registry.clone(), ArtifactTracker::new(registry, settings))
}

fn admit(
    registry: &SpecRegistry,
    tracker: &ArtifactTracker,
    bucket: &str,
    key: &str,
    etag: &str,
    secs: i64,
) -> Admission {
    let (context, parsed, file) = admission_inputs(registry, bucket, key, etag, at(secs));
    tracker.admit(&context, &parsed, file).unwrap()
}

fn resolve_all(registry: &SpecRegistry, tracker: &ArtifactTracker) -> CompleteArtifact {
    let mut completed = None;
    for (secs, key) in ILLUMINA_KEYS.iter().enumerate() {
        if let Admission::Complete(complete) =
            admit(registry, tracker, ILLUMINA_BUCKET, key, "e1", secs as i64)
        {
            completed = Some(complete);
        }
    }
    completed.expect("artifact should complete")
}

fn artifact() -> ArtifactKey {
    ArtifactKey::new("proj1", "0001", "run1")
}

fn permutations(items: &[&'static str]) -> Vec<Vec<&'static str>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for index in 0..items.len() {
        let mut rest = items.to_vec();
        let first = rest.remove(index);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

#[test]
fn completes_in_any_order() {
    for order in permutations(&ILLUMINA_KEYS) {
        let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
        let mut completions = Vec::new();
        for (secs, key) in order.iter().enumerate() {
            match admit(&registry, &tracker, ILLUMINA_BUCKET, key, "e1", secs as i64) {
                Admission::Pending { required, .. } => assert_eq!(required, 3),
                Admission::Complete(complete) => completions.push((secs, complete)),
                other => panic!("unexpected admission {other:?}"),
            }
        }
        assert_eq!(completions.len(), 1, "order {order:?}");
        let (secs, complete) = &completions[0];
        assert_eq!(*secs, 2);
        assert_eq!(complete.key, artifact());
        assert_eq!(complete.files.len(), 3);
        assert_eq!(complete.resolution, Resolution::Complete);
        assert_eq!(complete.first_seen, at(0));
        assert_eq!(tracker.pending_count(), 0);
        assert!(tracker.is_resolved(&artifact()));
    }
}

#[test]
fn identical_duplicate_leaves_state_unchanged() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "e1", 0);
    let before = tracker.partial(&artifact()).unwrap();

    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "e1", 30);
    assert_matches!(
        admission,
        Admission::Pending { received: 1, warning: Some(ref warning), .. }
            if warning.rule == RuleCode::DuplicateRole
    );
    assert_eq!(tracker.partial(&artifact()).unwrap(), before);
}

#[test]
fn overwrite_policy_keeps_latest_arrival() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "first", 10);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "second", 20);
    // Arrives late but was received earlier; must not replace "second".
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "stale", 5);

    let partial = tracker.partial(&artifact()).unwrap();
    let forward = &partial.files[&FileRole::new("forward_reads")];
    assert_eq!(forward.file.etag, "second");
    assert_eq!(partial.warnings.len(), 2);
    assert!(
        partial
            .warnings
            .iter()
            .all(|warning| warning.rule == RuleCode::DuplicateRole)
    );

    admit(&registry, &tracker, ILLUMINA_BUCKET, REVERSE_KEY, "r", 30);
    let complete = match admit(&registry, &tracker, ILLUMINA_BUCKET, METADATA_KEY, "m", 40) {
        Admission::Complete(complete) => complete,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(complete.warnings.len(), 2);
}

#[test]
fn reject_policy_keeps_first_arrival() {
    let (registry, tracker) = tracker(DuplicatePolicy::Reject);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "first", 10);
    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "second", 20);
    assert_matches!(admission, Admission::Pending { warning: Some(_), .. });

    let partial = tracker.partial(&artifact()).unwrap();
    assert_eq!(partial.files[&FileRole::new("forward_reads")].file.etag, "first");
    assert_eq!(partial.warnings.len(), 1);
}

#[test]
fn platform_conflict_is_rejected() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, METADATA_KEY, "e1", 0);
    let admission = admit(&registry, &tracker, ONT_BUCKET, "proj1.0001.run1.fasta", "e2", 1);
    assert_matches!(admission, Admission::Rejected { .. });
    assert_eq!(tracker.partial(&artifact()).unwrap().files.len(), 1);
}

#[test]
fn files_from_different_runs_never_share_an_artifact() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "e1", 0);
    admit(&registry, &tracker, ILLUMINA_BUCKET, "proj1.0001.run2.2.fastq.gz", "e1", 1);
    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, "proj1.0002.run1.csv", "e1", 2);

    assert_matches!(admission, Admission::Pending { received: 1, .. });
    assert_eq!(tracker.pending_count(), 3);
    assert_eq!(tracker.partial(&artifact()).unwrap().files.len(), 1);
    let other_run = ArtifactKey::new("proj1", "0001", "run2");
    assert_eq!(tracker.partial(&other_run).unwrap().files.len(), 1);
}

#[test]
fn expires_exactly_once() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "e1", 0);

    // Exactly at the deadline is not yet stale.
    assert!(tracker.sweep(at(3600)).is_empty());

    let expired = tracker.sweep(at(3601));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].key, artifact());
    assert_eq!(
        expired[0].missing.iter().map(FileRole::as_str).collect::<Vec<_>>(),
        vec!["metadata", "reverse_reads"]
    );
    assert_eq!(expired[0].expired_at, at(3601));

    assert!(tracker.sweep(at(3700)).is_empty());
    assert_eq!(tracker.pending_count(), 0);
    assert_matches!(tracker.replay(&artifact()), Err(GateError::NotResolved(_)));
}

#[test]
fn resolved_records_are_pruned_after_retention() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    let complete = resolve_all(&registry, &tracker);
    tracker.sweep(at(86_403));
    assert!(tracker.is_resolved(&artifact()), "undelivered records are kept");

    tracker.record_emission(&complete.key, &complete.files, true);
    tracker.sweep(at(86_400));
    assert!(tracker.is_resolved(&artifact()));
    tracker.sweep(at(86_403));
    assert!(!tracker.is_resolved(&artifact()));
}

#[test]
fn redelivery_after_resolution_is_ignored() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    for (secs, key) in ILLUMINA_KEYS.iter().enumerate() {
        admit(&registry, &tracker, ILLUMINA_BUCKET, key, "e1", secs as i64);
    }
    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, REVERSE_KEY, "e1", 100);
    assert_eq!(admission, Admission::AlreadyResolved);
}

#[test]
fn changed_content_after_resolution_resubmits() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    for (secs, key) in ILLUMINA_KEYS.iter().enumerate() {
        admit(&registry, &tracker, ILLUMINA_BUCKET, key, "e1", secs as i64);
    }
    let complete = match admit(&registry, &tracker, ILLUMINA_BUCKET, METADATA_KEY, "e2", 100) {
        Admission::Complete(complete) => complete,
        other => panic!("expected resubmission, got {other:?}"),
    };
    assert_eq!(complete.resolution, Resolution::Resubmitted);
    assert_eq!(complete.files.len(), 3);
    assert_eq!(complete.files[&FileRole::new("metadata")].file.etag, "e2");
    assert_eq!(complete.files[&FileRole::new("forward_reads")].file.etag, "e1");
    assert_eq!(complete.first_seen, at(0));
}

#[test]
fn replay_requires_resolution() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    assert_matches!(tracker.replay(&artifact()), Err(GateError::NotResolved(_)));
    for (secs, key) in ILLUMINA_KEYS.iter().enumerate() {
        admit(&registry, &tracker, ILLUMINA_BUCKET, key, "e1", secs as i64);
    }
    let replayed = match tracker.replay(&artifact()).unwrap() {
        Replay::Complete(replayed) => replayed,
        other => panic!("expected a completed artifact, got {other:?}"),
    };
    assert_eq!(replayed.resolution, Resolution::Replayed);
    assert_eq!(replayed.files.len(), 3);
}

#[test]
fn arrival_after_expiry_starts_a_fresh_deadline() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "e1", 0);
    assert_eq!(tracker.sweep(at(3601)).len(), 1);

    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, REVERSE_KEY, "e1", 3660);
    assert_matches!(admission, Admission::Pending { received: 2, .. });
    let partial = tracker.partial(&artifact()).unwrap();
    assert_eq!(partial.first_seen, at(3660));

    assert!(tracker.sweep(at(3661)).is_empty());
    assert!(tracker.sweep(at(3660 + 3600)).is_empty());
    assert_eq!(tracker.sweep(at(3660 + 3601)).len(), 1);
}

#[test]
fn failed_emission_hands_off_again() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    let complete = resolve_all(&registry, &tracker);

    // Still in flight: a redelivery must not start a second resolution.
    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, METADATA_KEY, "e1", 10);
    assert_eq!(admission, Admission::AlreadyResolved);
    assert!(tracker.take_undelivered().is_empty());

    tracker.record_emission(&complete.key, &complete.files, false);
    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, METADATA_KEY, "e1", 20);
    assert_eq!(admission, Admission::Complete(complete.clone()));
    assert!(tracker.take_undelivered().is_empty());

    tracker.record_emission(&complete.key, &complete.files, false);
    assert_eq!(tracker.take_undelivered(), vec![complete.clone()]);
    assert!(tracker.take_undelivered().is_empty());

    tracker.record_emission(&complete.key, &complete.files, true);
    let admission = admit(&registry, &tracker, ILLUMINA_BUCKET, METADATA_KEY, "e1", 30);
    assert_eq!(admission, Admission::AlreadyResolved);
}

#[test]
fn undelivered_expiry_is_offered_until_delivered() {
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    admit(&registry, &tracker, ILLUMINA_BUCKET, FORWARD_KEY, "e1", 0);
    let expired = tracker.sweep(at(3601));
    assert_eq!(expired.len(), 1);

    tracker.record_emission(&expired[0].key, &expired[0].files, false);
    let retried = tracker.sweep(at(3700));
    assert_eq!(retried, expired);

    tracker.record_emission(&expired[0].key, &expired[0].files, false);
    // Past retention, but the verdict is still owed.
    assert_eq!(tracker.sweep(at(3601 + 86_401)).len(), 1);
    tracker.record_emission(&expired[0].key, &expired[0].files, false);
    assert_eq!(
        tracker.replay(&artifact()).unwrap(),
        Replay::Expired(expired[0].clone())
    );
    assert!(tracker.sweep(at(3601 + 86_402)).is_empty());

    tracker.record_emission(&expired[0].key, &expired[0].files, true);
    assert_matches!(tracker.replay(&artifact()), Err(GateError::NotResolved(_)));
}

#[test]
fn concurrent_admissions_hand_off_once_per_artifact() {
    const ARTIFACTS: usize = 64;
    let (registry, tracker) = tracker(DuplicatePolicy::Overwrite);
    let completions = AtomicUsize::new(0);

    thread::scope(|scope| {
        // Two threads per role, so every role is also delivered twice.
        for suffix in [".1.fastq.gz", ".2.fastq.gz", ".csv"].repeat(2) {
            let registry = &registry;
            let tracker = &tracker;
            let completions = &completions;
            scope.spawn(move || {
                for index in 0..ARTIFACTS {
                    let key = format!("proj1.{index:04}.run1{suffix}");
                    let admission = admit(registry, tracker, ILLUMINA_BUCKET, &key, "e1", 0);
                    if matches!(admission, Admission::Complete(_)) {
                        completions.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });

    assert_eq!(completions.load(Ordering::SeqCst), ARTIFACTS);
    assert_eq!(tracker.pending_count(), 0);
}
