use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactKey, FileFormat, FileRef, FileRole, SubmissionContext};
use crate::error::GateError;
use crate::key_parser::ParsedKey;
use crate::registry::SpecRegistry;
use crate::verdict::{Resolution, RuleCode, Violation};

/// What to do when a role arrives again with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep the most recently received file.
    #[default]
    Overwrite,
    /// Keep the first file received.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    pub staleness: TimeDelta,
    pub resolved_retention: TimeDelta,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            staleness: TimeDelta::hours(24),
            resolved_retention: TimeDelta::days(7),
            duplicate_policy: DuplicatePolicy::Overwrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFile {
    pub file: FileRef,
    pub format: FileFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialArtifact {
    pub key: ArtifactKey,
    pub context: SubmissionContext,
    pub files: BTreeMap<FileRole, TrackedFile>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub warnings: Vec<Violation>,
    pub resolution: Resolution,
}

impl PartialArtifact {
    fn new(context: &SubmissionContext, key: ArtifactKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            context: context.clone(),
            files: BTreeMap::new(),
            first_seen: at,
            last_seen: at,
            warnings: Vec::new(),
            resolution: Resolution::Complete,
        }
    }

    fn is_complete(&self, required: &BTreeSet<FileRole>) -> bool {
        required.iter().all(|role| self.files.contains_key(role))
    }

    fn missing(&self, required: &BTreeSet<FileRole>) -> BTreeSet<FileRole> {
        required
            .iter()
            .filter(|role| !self.files.contains_key(*role))
            .cloned()
            .collect()
    }

    fn complete(&self) -> CompleteArtifact {
        let completed_at = self
            .files
            .values()
            .map(|tracked| tracked.file.received_at)
            .max()
            .unwrap_or(self.last_seen);
        CompleteArtifact {
            key: self.key.clone(),
            context: self.context.clone(),
            files: self.files.clone(),
            first_seen: self.first_seen,
            completed_at,
            warnings: self.warnings.clone(),
            resolution: self.resolution,
        }
    }
}

/// An artifact whose required roles are all present, handed off exactly
/// once per completeness event.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteArtifact {
    pub key: ArtifactKey,
    pub context: SubmissionContext,
    pub files: BTreeMap<FileRole, TrackedFile>,
    pub first_seen: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub warnings: Vec<Violation>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredArtifact {
    pub key: ArtifactKey,
    pub context: SubmissionContext,
    pub files: BTreeMap<FileRole, TrackedFile>,
    pub missing: BTreeSet<FileRole>,
    pub first_seen: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub warnings: Vec<Violation>,
}

impl ExpiredArtifact {
    pub fn format_of(&self, role: &FileRole) -> FileFormat {
        self.files
            .get(role)
            .map(|tracked| tracked.format)
            .unwrap_or(FileFormat::Index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Pending {
        received: usize,
        required: usize,
        warning: Option<Violation>,
    },
    Complete(CompleteArtifact),
    /// The same content was already resolved and its verdict delivered or
    /// in flight; nothing to do.
    AlreadyResolved,
    Rejected {
        reason: String,
    },
}

/// What [`ArtifactTracker::replay`] hands back for a resolved record.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    /// Validate the recorded files again.
    Complete(CompleteArtifact),
    /// The expiry verdict was never delivered; emit it again.
    Expired(ExpiredArtifact),
}

/// Delivery state of the verdict owed for a resolved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emission {
    InFlight,
    Failed,
    Delivered,
}

#[derive(Debug, Clone)]
struct ResolvedRecord {
    artifact: CompleteArtifact,
    resolved_at: DateTime<Utc>,
    expiry: Option<ExpiredArtifact>,
    emission: Emission,
}

impl ResolvedRecord {
    fn completed(artifact: CompleteArtifact) -> Self {
        Self {
            resolved_at: artifact.completed_at,
            artifact,
            expiry: None,
            emission: Emission::InFlight,
        }
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Partial(PartialArtifact),
    Resolved(ResolvedRecord),
}

/// Correlates independently arriving files into artifacts.
///
/// Every transition for one artifact happens under that artifact's map entry
/// lock, so concurrent arrivals for the same key serialise while distinct
/// keys proceed in parallel.
#[derive(Debug)]
pub struct ArtifactTracker {
    registry: Arc<SpecRegistry>,
    settings: TrackerSettings,
    slots: DashMap<ArtifactKey, Slot>,
}

impl ArtifactTracker {
    pub fn new(registry: Arc<SpecRegistry>, settings: TrackerSettings) -> Self {
        Self {
            registry,
            settings,
            slots: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn admit(
        &self,
        context: &SubmissionContext,
        parsed: &ParsedKey,
        file: FileRef,
    ) -> Result<Admission, GateError> {
        let required = self
            .registry
            .required_roles(&context.pathogen, &parsed.platform)?;
        let tracked = TrackedFile {
            file,
            format: parsed.format,
        };

        let admission = match self.slots.entry(parsed.artifact.clone()) {
            Entry::Vacant(vacant) => {
                let mut partial = PartialArtifact::new(
                    context,
                    parsed.artifact.clone(),
                    tracked.file.received_at,
                );
                partial.files.insert(parsed.role.clone(), tracked);
                if partial.is_complete(required) {
                    let artifact = partial.complete();
                    vacant.insert(Slot::Resolved(ResolvedRecord::completed(artifact.clone())));
                    Admission::Complete(artifact)
                } else {
                    let received = partial.files.len();
                    vacant.insert(Slot::Partial(partial));
                    Admission::Pending {
                        received,
                        required: required.len(),
                        warning: None,
                    }
                }
            }
            Entry::Occupied(mut occupied) => {
                let next = match occupied.get_mut() {
                    Slot::Partial(partial) => {
                        if partial.context.platform != parsed.platform {
                            return Ok(Admission::Rejected {
                                reason: format!(
                                    "artifact {} is tracked under platform {}, not {}",
                                    parsed.artifact, partial.context.platform, parsed.platform
                                ),
                            });
                        }
                        match self.place(partial, &parsed.role, tracked) {
                            Placement::Identical(warning) => {
                                return Ok(Admission::Pending {
                                    received: partial.files.len(),
                                    required: required.len(),
                                    warning: Some(warning),
                                });
                            }
                            Placement::Stored(warning) => {
                                if !partial.is_complete(required) {
                                    return Ok(Admission::Pending {
                                        received: partial.files.len(),
                                        required: required.len(),
                                        warning,
                                    });
                                }
                                partial.complete()
                            }
                        }
                    }
                    Slot::Resolved(record) => {
                        let same = record
                            .artifact
                            .files
                            .get(&parsed.role)
                            .is_some_and(|existing| existing.file.same_content(&tracked.file));
                        if same {
                            // A redelivery after a failed emit hands the artifact off again.
                            if record.expiry.is_none() && record.emission == Emission::Failed {
                                record.emission = Emission::InFlight;
                                tracing::info!(
                                    artifact = %parsed.artifact,
                                    "redelivery of an artifact whose verdict was not delivered"
                                );
                                return Ok(Admission::Complete(record.artifact.clone()));
                            }
                            return Ok(Admission::AlreadyResolved);
                        }
                        let mut partial = PartialArtifact::new(
                            context,
                            parsed.artifact.clone(),
                            tracked.file.received_at,
                        );
                        // An expired deadline has passed; the new arrival starts a fresh one.
                        if record.expiry.is_none() {
                            partial.first_seen = record.artifact.first_seen;
                        }
                        partial.resolution = Resolution::Resubmitted;
                        if record.artifact.context.platform == parsed.platform {
                            partial.files = record.artifact.files.clone();
                        }
                        partial.files.insert(parsed.role.clone(), tracked);
                        tracing::info!(
                            artifact = %parsed.artifact,
                            role = %parsed.role,
                            "resubmission of a resolved artifact"
                        );
                        if !partial.is_complete(required) {
                            let received = partial.files.len();
                            *occupied.get_mut() = Slot::Partial(partial);
                            return Ok(Admission::Pending {
                                received,
                                required: required.len(),
                                warning: None,
                            });
                        }
                        partial.complete()
                    }
                };
                occupied.insert(Slot::Resolved(ResolvedRecord::completed(next.clone())));
                Admission::Complete(next)
            }
        };
        Ok(admission)
    }

    fn place(&self, partial: &mut PartialArtifact, role: &FileRole, tracked: TrackedFile) -> Placement {
        let Some(existing) = partial.files.get(role) else {
            partial.last_seen = partial.last_seen.max(tracked.file.received_at);
            partial.files.insert(role.clone(), tracked);
            return Placement::Stored(None);
        };

        if existing.file.same_content(&tracked.file) {
            return Placement::Identical(
                Violation::warning(
                    RuleCode::DuplicateRole,
                    format!("{} was delivered again with identical content", tracked.file.key),
                )
                .with_field(role.as_str()),
            );
        }

        let replace = match self.settings.duplicate_policy {
            DuplicatePolicy::Overwrite => tracked.file.received_at >= existing.file.received_at,
            DuplicatePolicy::Reject => false,
        };
        let warning = Violation::warning(
            RuleCode::DuplicateRole,
            if replace {
                format!(
                    "{} replaced earlier content for role {role} (etag {})",
                    tracked.file.key, existing.file.etag
                )
            } else {
                format!(
                    "{} (etag {}) ignored, role {role} already has a file",
                    tracked.file.key, tracked.file.etag
                )
            },
        )
        .with_field(role.as_str());
        tracing::warn!(
            artifact = %partial.key,
            role = %role,
            replaced = replace,
            "duplicate role with different content"
        );
        partial.warnings.push(warning.clone());
        partial.last_seen = partial.last_seen.max(tracked.file.received_at);
        if replace {
            partial.files.insert(role.clone(), tracked);
        }
        Placement::Stored(Some(warning))
    }

    /// Expires partial artifacts older than the staleness deadline and
    /// prunes resolved records past retention.
    ///
    /// Each expired artifact is returned once, plus again on every later
    /// sweep for as long as its verdict is recorded as undelivered.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ExpiredArtifact> {
        let mut stale = Vec::new();
        let mut undelivered = Vec::new();
        for entry in self.slots.iter() {
            match entry.value() {
                Slot::Partial(partial) if self.is_stale(partial, now) => {
                    stale.push(entry.key().clone())
                }
                Slot::Resolved(record)
                    if record.expiry.is_some() && record.emission == Emission::Failed =>
                {
                    undelivered.push(entry.key().clone())
                }
                _ => {}
            }
        }

        let mut expired = Vec::new();
        for key in undelivered {
            let Some(mut slot) = self.slots.get_mut(&key) else {
                continue;
            };
            if let Slot::Resolved(record) = &mut *slot
                && record.emission == Emission::Failed
                && let Some(expiry) = &record.expiry
            {
                record.emission = Emission::InFlight;
                tracing::info!(artifact = %key, "retrying undelivered expiry verdict");
                expired.push(expiry.clone());
            }
        }

        for key in stale {
            let Some(mut slot) = self.slots.get_mut(&key) else {
                continue;
            };
            // Re-check under the entry lock; a file may have completed it since.
            let Slot::Partial(partial) = &*slot else {
                continue;
            };
            if !self.is_stale(partial, now) {
                continue;
            }
            let missing = self
                .registry
                .required_roles(&partial.context.pathogen, &partial.context.platform)
                .map(|required| partial.missing(required))
                .unwrap_or_default();
            let artifact = ExpiredArtifact {
                key: partial.key.clone(),
                context: partial.context.clone(),
                files: partial.files.clone(),
                missing,
                first_seen: partial.first_seen,
                expired_at: now,
                warnings: partial.warnings.clone(),
            };
            let mut record = partial.complete();
            record.resolution = Resolution::Expired;
            *slot = Slot::Resolved(ResolvedRecord {
                artifact: record,
                resolved_at: now,
                expiry: Some(artifact.clone()),
                emission: Emission::InFlight,
            });
            tracing::info!(
                artifact = %artifact.key,
                missing = artifact.missing.len(),
                "partial artifact expired"
            );
            expired.push(artifact);
        }

        let retention = self.settings.resolved_retention;
        self.slots.retain(|_, slot| match slot {
            Slot::Resolved(record) => {
                record.emission != Emission::Delivered || now - record.resolved_at <= retention
            }
            Slot::Partial(_) => true,
        });
        expired
    }

    fn is_stale(&self, partial: &PartialArtifact, now: DateTime<Utc>) -> bool {
        now - partial.first_seen > self.settings.staleness
    }

    /// Completed artifacts that were handed off but whose verdict was not
    /// delivered. Each is handed off again and marked in flight.
    pub fn take_undelivered(&self) -> Vec<CompleteArtifact> {
        let keys = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Resolved(record)
                    if record.expiry.is_none() && record.emission == Emission::Failed =>
                {
                    Some(entry.key().clone())
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        let mut artifacts = Vec::new();
        for key in keys {
            let Some(mut slot) = self.slots.get_mut(&key) else {
                continue;
            };
            if let Slot::Resolved(record) = &mut *slot
                && record.expiry.is_none()
                && record.emission == Emission::Failed
            {
                record.emission = Emission::InFlight;
                artifacts.push(record.artifact.clone());
            }
        }
        artifacts
    }

    /// Records whether the verdict for `files` reached the emitter. Ignored
    /// when the record has since been replaced by a resubmission.
    pub fn record_emission(
        &self,
        key: &ArtifactKey,
        files: &BTreeMap<FileRole, TrackedFile>,
        delivered: bool,
    ) {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return;
        };
        if let Slot::Resolved(record) = &mut *slot
            && record.artifact.files == *files
        {
            record.emission = if delivered {
                Emission::Delivered
            } else {
                Emission::Failed
            };
        }
    }

    /// Re-runs validation for a completed artifact from its recorded files,
    /// or re-issues an expiry whose verdict was never delivered.
    pub fn replay(&self, key: &ArtifactKey) -> Result<Replay, GateError> {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Err(GateError::NotResolved(key.to_string()));
        };
        match &mut *slot {
            Slot::Resolved(record) => match &record.expiry {
                None => {
                    let mut artifact = record.artifact.clone();
                    artifact.resolution = Resolution::Replayed;
                    Ok(Replay::Complete(artifact))
                }
                Some(expiry) if record.emission == Emission::Failed => {
                    let expiry = expiry.clone();
                    record.emission = Emission::InFlight;
                    Ok(Replay::Expired(expiry))
                }
                Some(_) => Err(GateError::NotResolved(key.to_string())),
            },
            Slot::Partial(_) => Err(GateError::NotResolved(key.to_string())),
        }
    }

    pub fn partial(&self, key: &ArtifactKey) -> Option<PartialArtifact> {
        match self.slots.get(key).as_deref() {
            Some(Slot::Partial(partial)) => Some(partial.clone()),
            _ => None,
        }
    }

    pub fn is_resolved(&self, key: &ArtifactKey) -> bool {
        matches!(self.slots.get(key).as_deref(), Some(Slot::Resolved(_)))
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Partial(_)))
            .count()
    }
}

enum Placement {
    Identical(Violation),
    Stored(Option<Violation>),
}
