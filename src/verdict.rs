use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{ArtifactKey, FileFormat, FileRole, Platform, SubmissionContext};
use crate::error::GateError;
use crate::tracker::{CompleteArtifact, ExpiredArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Naming,
    Format,
    Schema,
    CrossFile,
    Incomplete,
    Tracker,
    Operational,
}

/// Stable identifiers for every rule a submission can break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCode {
    DisallowedCharacter,
    SegmentTooLong,
    KeyTooLong,
    BasenameMismatch,

    ContentUnreadable,
    FastaUnparseable,
    FastaMultipleRecords,
    FastaEmptySequence,
    FastaHeaderCharacters,
    FastaNonIupac,
    FastaTooShort,
    FastqMalformed,
    FastqLengthMismatch,
    FastqNonIupac,
    FastqTooFewReads,
    BamTooLarge,
    BamQuickcheckFailed,
    BamUnreadable,
    BamDisallowedReference,
    BamNotSorted,
    BamNoReads,
    BamHumanFraction,
    BamPrimerTrimMissing,
    IndexEmpty,

    CsvUnreadable,
    CsvNoDataRow,
    CsvMultipleRows,
    CsvRowWidth,
    CsvDuplicateField,
    CsvMissingField,
    CsvUnexpectedField,
    CsvInvalidInteger,
    CsvInvalidDate,
    CsvInvalidChoice,
    CsvLengthOutOfRange,
    CsvSampleIdElsewhere,

    ProjectBucketMismatch,
    MetadataIdentityMismatch,
    PairedReadCountMismatch,

    IncompleteArtifact,
    ObjectMissing,
    DuplicateRole,

    StorageUnavailable,
    AccessDenied,
}

impl RuleCode {
    pub fn kind(self) -> ViolationKind {
        use RuleCode::*;
        match self {
            DisallowedCharacter | SegmentTooLong | KeyTooLong | BasenameMismatch => {
                ViolationKind::Naming
            }
            CsvUnreadable | CsvNoDataRow | CsvMultipleRows | CsvRowWidth | CsvDuplicateField
            | CsvMissingField | CsvUnexpectedField | CsvInvalidInteger | CsvInvalidDate
            | CsvInvalidChoice | CsvLengthOutOfRange | CsvSampleIdElsewhere => ViolationKind::Schema,
            ProjectBucketMismatch | MetadataIdentityMismatch | PairedReadCountMismatch => {
                ViolationKind::CrossFile
            }
            IncompleteArtifact | ObjectMissing => ViolationKind::Incomplete,
            DuplicateRole => ViolationKind::Tracker,
            StorageUnavailable | AccessDenied => ViolationKind::Operational,
            _ => ViolationKind::Format,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: RuleCode,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl Violation {
    pub fn error(rule: RuleCode, message: impl Into<String>) -> Self {
        Self {
            rule,
            kind: rule.kind(),
            severity: Severity::Error,
            message: message.into(),
            field: None,
        }
    }

    pub fn warning(rule: RuleCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub format: FileFormat,
    pub outcome: FileOutcome,
    pub violations: Vec<Violation>,
}

impl FileReport {
    pub fn has_rule(&self, rule: RuleCode) -> bool {
        self.violations.iter().any(|violation| violation.rule == rule)
    }
}

/// Output of the validator chain for one artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub files: BTreeMap<FileRole, FileReport>,
    pub artifact_violations: Vec<Violation>,
    pub metadata: BTreeMap<String, String>,
}

impl ValidationResult {
    pub fn outcome(&self) -> AggregateOutcome {
        aggregate(
            self.files
                .values()
                .flat_map(|report| report.violations.iter())
                .chain(self.artifact_violations.iter()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOutcome {
    Valid,
    Invalid,
    /// Validation could not finish because infrastructure failed; the
    /// submission itself may be fine.
    Degraded,
}

fn aggregate<'a>(violations: impl Iterator<Item = &'a Violation>) -> AggregateOutcome {
    let mut outcome = AggregateOutcome::Valid;
    for violation in violations.filter(|violation| violation.is_error()) {
        if violation.kind == ViolationKind::Operational {
            return AggregateOutcome::Degraded;
        }
        outcome = AggregateOutcome::Invalid;
    }
    outcome
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Complete,
    Resubmitted,
    Replayed,
    Expired,
}

/// The published, itemised result for one artifact resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub submission_id: String,
    pub artifact: ArtifactKey,
    pub pathogen: String,
    pub site: String,
    pub platform: Platform,
    pub test_flag: bool,
    pub bucket: String,
    pub resolution: Resolution,
    pub outcome: AggregateOutcome,
    pub files: BTreeMap<FileRole, FileReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_roles: Vec<FileRole>,
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub first_seen: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

impl Verdict {
    pub fn from_validation(artifact: &CompleteArtifact, result: ValidationResult) -> Self {
        let outcome = result.outcome();
        let mut violations = artifact.warnings.clone();
        violations.extend(result.artifact_violations);
        let submission_id = submission_id(
            &artifact.key,
            &artifact.context,
            result
                .files
                .iter()
                .map(|(role, report)| (role, report.key.as_str(), report.etag.as_str())),
        );
        Self {
            submission_id,
            artifact: artifact.key.clone(),
            pathogen: artifact.context.pathogen.clone(),
            site: artifact.context.site.clone(),
            platform: artifact.context.platform.clone(),
            test_flag: artifact.context.test_flag,
            bucket: artifact.context.bucket.clone(),
            resolution: artifact.resolution,
            outcome,
            files: result.files,
            missing_roles: Vec::new(),
            violations,
            metadata: if outcome == AggregateOutcome::Valid {
                result.metadata
            } else {
                BTreeMap::new()
            },
            first_seen: artifact.first_seen,
            resolved_at: artifact.completed_at,
        }
    }

    /// Incomplete artifacts are reported as invalid, never dropped.
    pub fn from_expiry(expired: &ExpiredArtifact) -> Self {
        let missing = expired
            .missing
            .iter()
            .map(FileRole::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let mut violations = expired.warnings.clone();
        violations.push(Violation::error(
            RuleCode::IncompleteArtifact,
            format!(
                "artifact was still missing {missing} when the deadline passed at {}",
                expired.expired_at.to_rfc3339()
            ),
        ));
        let files = expired
            .files
            .iter()
            .map(|(role, file)| {
                (
                    role.clone(),
                    FileReport {
                        key: file.file.key.clone(),
                        etag: file.file.etag.clone(),
                        size: file.file.size,
                        format: expired.format_of(role),
                        outcome: FileOutcome::Invalid,
                        violations: Vec::new(),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        let submission_id = submission_id(
            &expired.key,
            &expired.context,
            files
                .iter()
                .map(|(role, report)| (role, report.key.as_str(), report.etag.as_str())),
        );
        Self {
            submission_id,
            artifact: expired.key.clone(),
            pathogen: expired.context.pathogen.clone(),
            site: expired.context.site.clone(),
            platform: expired.context.platform.clone(),
            test_flag: expired.context.test_flag,
            bucket: expired.context.bucket.clone(),
            resolution: Resolution::Expired,
            outcome: AggregateOutcome::Invalid,
            files,
            missing_roles: expired.missing.iter().cloned().collect(),
            violations,
            metadata: BTreeMap::new(),
            first_seen: expired.first_seen,
            resolved_at: expired.expired_at,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.outcome == AggregateOutcome::Valid
    }

    /// Every rule code in the verdict, file-level and artifact-level.
    pub fn violation_codes(&self) -> BTreeSet<RuleCode> {
        self.files
            .values()
            .flat_map(|report| report.violations.iter())
            .chain(self.violations.iter())
            .map(|violation| violation.rule)
            .collect()
    }
}

/// Deterministic id over the artifact identity and the exact file contents,
/// so downstream consumers can deduplicate retried emits.
pub fn submission_id<'a>(
    key: &ArtifactKey,
    context: &SubmissionContext,
    files: impl Iterator<Item = (&'a FileRole, &'a str, &'a str)>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.pathogen.as_bytes());
    hasher.update([0]);
    hasher.update(context.site.as_bytes());
    hasher.update([0]);
    hasher.update(context.platform.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(key.to_string().as_bytes());
    for (role, object_key, etag) in files {
        hasher.update([0]);
        hasher.update(role.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(object_key.as_bytes());
        hasher.update([0]);
        hasher.update(etag.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Broker side of verdict delivery. Implementations must tolerate the same
/// verdict twice (keyed by `submission_id`).
pub trait Publisher: Send + Sync {
    fn publish(&self, verdict: &Verdict) -> Result<(), GateError>;
}

/// Metadata catalogue registration, idempotent under the artifact identity.
pub trait Catalogue: Send + Sync {
    fn register(&self, verdict: &Verdict) -> Result<(), GateError>;
}

impl<T: Publisher + ?Sized> Publisher for std::sync::Arc<T> {
    fn publish(&self, verdict: &Verdict) -> Result<(), GateError> {
        (**self).publish(verdict)
    }
}

impl<T: Catalogue + ?Sized> Catalogue for std::sync::Arc<T> {
    fn register(&self, verdict: &Verdict) -> Result<(), GateError> {
        (**self).register(verdict)
    }
}

#[derive(Debug, Clone)]
pub struct VerdictEmitter<P: Publisher, C: Catalogue> {
    publisher: P,
    catalogue: C,
}

impl<P: Publisher, C: Catalogue> VerdictEmitter<P, C> {
    pub fn new(publisher: P, catalogue: C) -> Self {
        Self {
            publisher,
            catalogue,
        }
    }

    /// Hands the verdict to the broker, then to the catalogue.
    pub fn emit(&self, verdict: &Verdict) -> Result<(), GateError> {
        self.publisher.publish(verdict)?;
        self.catalogue.register(verdict)?;
        tracing::info!(
            artifact = %verdict.artifact,
            submission_id = %verdict.submission_id,
            outcome = ?verdict.outcome,
            resolution = ?verdict.resolution,
            "verdict emitted"
        );
        Ok(())
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn catalogue(&self) -> &C {
        &self.catalogue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operational_errors_degrade_the_aggregate() {
        let violations = [
            Violation::error(RuleCode::FastaTooShort, "short"),
            Violation::error(RuleCode::StorageUnavailable, "down"),
        ];
        assert_eq!(aggregate(violations.iter()), AggregateOutcome::Degraded);
    }

    #[test]
    fn warnings_do_not_invalidate() {
        let violations = [Violation::warning(RuleCode::CsvUnexpectedField, "extra")];
        assert_eq!(aggregate(violations.iter()), AggregateOutcome::Valid);
    }

    #[test]
    fn rule_codes_serialize_snake_case() {
        let json = serde_json::to_string(&RuleCode::BamHumanFraction).unwrap();
        assert_eq!(json, "\"bam_human_fraction\"");
        assert_eq!(RuleCode::CsvMissingField.kind(), ViolationKind::Schema);
        assert_eq!(RuleCode::BamHumanFraction.kind(), ViolationKind::Format);
    }
}
