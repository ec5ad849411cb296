use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checks::{FetchedFile, ValidatorChain};
use crate::domain::{ArtifactKey, Capability, FileFormat, FileRef, FileRole};
use crate::error::GateError;
use crate::key_parser::KeyParser;
use crate::notification::Notification;
use crate::registry::{PathogenSpec, SpecRegistry};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::tracker::{
    Admission, ArtifactTracker, CompleteArtifact, ExpiredArtifact, Replay, TrackedFile,
    TrackerSettings,
};
use crate::verdict::{AggregateOutcome, Catalogue, Publisher, Verdict, VerdictEmitter};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandleOutcome {
    Pending {
        artifact: ArtifactKey,
        received: usize,
        required: usize,
    },
    Resolved(Box<Verdict>),
    /// Same content as an artifact that was already resolved.
    Duplicate { artifact: ArtifactKey },
    Rejected { artifact: ArtifactKey, reason: String },
}

/// Counts from one startup pass over existing bucket contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub listed: usize,
    pub admitted: usize,
    pub resolved: usize,
    /// Objects that are not part of any artifact, or were rejected.
    pub skipped: usize,
    /// Objects whose admission hit a transient failure.
    pub failed: usize,
}

/// Drives one notification from bucket context to an emitted verdict.
pub struct Engine<S: ObjectStore, P: Publisher, C: Catalogue> {
    registry: Arc<SpecRegistry>,
    tracker: ArtifactTracker,
    store: S,
    emitter: VerdictEmitter<P, C>,
    retry: RetryPolicy,
}

impl<S: ObjectStore, P: Publisher, C: Catalogue> Engine<S, P, C> {
    pub fn new(
        registry: Arc<SpecRegistry>,
        settings: TrackerSettings,
        store: S,
        emitter: VerdictEmitter<P, C>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tracker: ArtifactTracker::new(registry.clone(), settings),
            registry,
            store,
            emitter,
            retry,
        }
    }

    pub fn tracker(&self) -> &ArtifactTracker {
        &self.tracker
    }

    pub fn emitter(&self) -> &VerdictEmitter<P, C> {
        &self.emitter
    }

    pub fn handle(&self, notification: &Notification) -> Result<HandleOutcome, GateError> {
        let context = self.registry.resolve_bucket(&notification.bucket)?;
        let parsed = KeyParser::new(&self.registry).parse(
            &notification.key,
            &context.pathogen,
            Some(&context.platform),
        )?;
        let file = FileRef {
            key: notification.key.clone(),
            etag: notification.etag.clone(),
            size: notification.size,
            received_at: notification.event_time,
            submitter: notification.submitter.clone(),
            basename: parsed.basename.clone(),
        };

        match self.tracker.admit(&context, &parsed, file)? {
            Admission::Pending {
                received,
                required,
                warning,
            } => {
                tracing::debug!(
                    artifact = %parsed.artifact,
                    role = %parsed.role,
                    received,
                    required,
                    duplicate = warning.is_some(),
                    "file admitted"
                );
                Ok(HandleOutcome::Pending {
                    artifact: parsed.artifact,
                    received,
                    required,
                })
            }
            Admission::Complete(artifact) => {
                let verdict = self.resolve(&artifact)?;
                Ok(HandleOutcome::Resolved(Box::new(verdict)))
            }
            Admission::AlreadyResolved => {
                tracing::debug!(artifact = %parsed.artifact, key = %notification.key, "already resolved");
                Ok(HandleOutcome::Duplicate {
                    artifact: parsed.artifact,
                })
            }
            Admission::Rejected { reason } => {
                tracing::warn!(artifact = %parsed.artifact, reason = %reason, "file rejected");
                Ok(HandleOutcome::Rejected {
                    artifact: parsed.artifact,
                    reason,
                })
            }
        }
    }

    /// Rebuilds tracker state from the objects already sitting in `buckets`,
    /// oldest first, as if their notifications had just arrived. Artifacts
    /// that turn out complete are validated and emitted.
    ///
    /// Buckets that do not route to a pathogen, or whose policy does not
    /// grant `list`, are skipped.
    pub fn reconcile(&self, buckets: &[String]) -> Result<ReconcileReport, GateError> {
        let mut report = ReconcileReport::default();
        for bucket in buckets {
            let context = match self.registry.resolve_bucket(bucket) {
                Ok(context) => context,
                Err(err) => {
                    tracing::debug!(bucket = %bucket, error = %err, "not a submission bucket");
                    continue;
                }
            };
            if !context.allows(Capability::List) {
                tracing::warn!(bucket = %bucket, "bucket policy does not grant list");
                continue;
            }

            let mut objects = self.retry.run("list bucket", || self.store.list(bucket))?;
            objects.sort_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.key.cmp(&b.key))
            });
            report.listed += objects.len();

            for object in objects {
                let notification = Notification {
                    bucket: bucket.clone(),
                    key: object.key,
                    etag: object.etag,
                    size: object.size,
                    event_time: object.last_modified,
                    submitter: None,
                };
                match self.handle(&notification) {
                    Ok(HandleOutcome::Resolved(_)) => {
                        report.admitted += 1;
                        report.resolved += 1;
                    }
                    Ok(HandleOutcome::Pending { .. } | HandleOutcome::Duplicate { .. }) => {
                        report.admitted += 1
                    }
                    Ok(HandleOutcome::Rejected { .. }) => report.skipped += 1,
                    Err(err) if err.is_transient() => {
                        tracing::warn!(key = %notification.key, error = %err, "reconcile failed for object");
                        report.failed += 1;
                    }
                    Err(err) => {
                        tracing::debug!(key = %notification.key, error = %err, "object skipped");
                        report.skipped += 1;
                    }
                }
            }
        }
        tracing::info!(
            listed = report.listed,
            admitted = report.admitted,
            resolved = report.resolved,
            pending = self.tracker.pending_count(),
            "reconciled existing objects"
        );
        Ok(report)
    }

    /// Expires stale partial artifacts and emits an incomplete verdict for
    /// each one, then retries every verdict an earlier emit failed to deliver.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Verdict> {
        let mut verdicts = Vec::new();
        for expired in self.tracker.sweep(now) {
            match self.emit_expiry(&expired) {
                Ok(verdict) => verdicts.push(verdict),
                Err(err) => tracing::error!(
                    artifact = %expired.key,
                    error = %err,
                    "expiry verdict not delivered; retrying on the next sweep"
                ),
            }
        }
        for artifact in self.tracker.take_undelivered() {
            tracing::info!(artifact = %artifact.key, "retrying undelivered verdict");
            match self.resolve(&artifact) {
                Ok(verdict) => verdicts.push(verdict),
                Err(err) => tracing::error!(
                    artifact = %artifact.key,
                    error = %err,
                    "verdict still not delivered"
                ),
            }
        }
        verdicts
    }

    /// Validates a resolved artifact again and emits a fresh verdict. An
    /// expired artifact whose verdict was never delivered gets its expiry
    /// verdict re-emitted instead.
    pub fn replay(&self, key: &ArtifactKey) -> Result<Verdict, GateError> {
        tracing::info!(artifact = %key, "replaying artifact");
        match self.tracker.replay(key)? {
            Replay::Complete(artifact) => self.resolve(&artifact),
            Replay::Expired(expired) => self.emit_expiry(&expired),
        }
    }

    fn resolve(&self, artifact: &CompleteArtifact) -> Result<Verdict, GateError> {
        let spec = self.registry.lookup(&artifact.context.pathogen)?;
        let fetched = self.fetch_all(spec, artifact);
        let result = ValidatorChain::new(spec).validate(artifact, &fetched);
        let verdict = Verdict::from_validation(artifact, result);
        if verdict.outcome == AggregateOutcome::Degraded {
            tracing::error!(
                artifact = %verdict.artifact,
                "validation degraded by storage failures; replay once storage recovers"
            );
        }
        let emitted = self.emit(&verdict);
        self.tracker
            .record_emission(&artifact.key, &artifact.files, emitted.is_ok());
        emitted.map(|()| verdict)
    }

    fn emit_expiry(&self, expired: &ExpiredArtifact) -> Result<Verdict, GateError> {
        let verdict = Verdict::from_expiry(expired);
        let emitted = self.emit(&verdict);
        self.tracker
            .record_emission(&expired.key, &expired.files, emitted.is_ok());
        emitted.map(|()| verdict)
    }

    fn emit(&self, verdict: &Verdict) -> Result<(), GateError> {
        self.retry
            .run("emit verdict", || self.emitter.emit(verdict))
    }

    fn fetch_all(
        &self,
        spec: &PathogenSpec,
        artifact: &CompleteArtifact,
    ) -> BTreeMap<FileRole, FetchedFile> {
        let readable = artifact.context.allows(Capability::Get);
        if !readable {
            tracing::warn!(
                bucket = %artifact.context.bucket,
                "bucket policy does not grant get"
            );
        }
        artifact
            .files
            .iter()
            .map(|(role, tracked)| {
                let fetched = if readable {
                    self.fetch(spec, &artifact.context.bucket, tracked)
                } else {
                    FetchedFile::Denied
                };
                (role.clone(), fetched)
            })
            .collect()
    }

    fn fetch(&self, spec: &PathogenSpec, bucket: &str, tracked: &TrackedFile) -> FetchedFile {
        let key = tracked.file.key.as_str();
        let ceiling = match tracked.format {
            FileFormat::Bam => spec.alignment.max_size_bytes,
            _ => None,
        };
        if let Some(limit) = ceiling {
            match self
                .retry
                .run("head object", || self.store.head_size(bucket, key))
            {
                Ok(size) if size > limit => return FetchedFile::Oversized { size, limit },
                Ok(_) => {}
                Err(err) => return fetch_failure(bucket, key, err),
            }
        }
        match self.retry.run("get object", || self.store.get(bucket, key)) {
            Ok(bytes) => FetchedFile::Content(bytes),
            Err(err) => fetch_failure(bucket, key, err),
        }
    }
}

fn fetch_failure(bucket: &str, key: &str, err: GateError) -> FetchedFile {
    match err {
        GateError::ObjectNotFound { .. } => {
            tracing::warn!(bucket, key, "object vanished before validation");
            FetchedFile::Missing
        }
        GateError::AccessDenied { .. } => FetchedFile::Denied,
        other => {
            tracing::error!(bucket, key, error = %other, "object could not be fetched");
            FetchedFile::Unavailable(other.to_string())
        }
    }
}
