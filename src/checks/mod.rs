//! Per-file and cross-file validation driven entirely by a [`PathogenSpec`].
//!
//! Every applicable check runs; violations accumulate so a verdict lists
//! everything a submitter has to fix.

mod alignment;
mod cross;
mod fasta;
mod naming;
mod tabular;

use std::collections::BTreeMap;

use crate::domain::{FileFormat, FileRole};
use crate::registry::PathogenSpec;
use crate::tracker::CompleteArtifact;
use crate::verdict::{FileOutcome, FileReport, RuleCode, ValidationResult, Violation};

/// Content of one role as retrieved from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedFile {
    Content(Vec<u8>),
    /// Larger than the configured ceiling; never loaded.
    Oversized { size: u64, limit: u64 },
    Missing,
    /// The bucket policy does not grant read access.
    Denied,
    /// Storage stayed unavailable after retries.
    Unavailable(String),
}

/// What format checks learned about a file that cross-file checks need.
#[derive(Debug, Clone, Default)]
struct FileFacts {
    read_count: Option<u64>,
    metadata_row: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidatorChain<'a> {
    spec: &'a PathogenSpec,
}

impl<'a> ValidatorChain<'a> {
    pub fn new(spec: &'a PathogenSpec) -> Self {
        Self { spec }
    }

    pub fn validate(
        &self,
        artifact: &CompleteArtifact,
        fetched: &BTreeMap<FileRole, FetchedFile>,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut facts = BTreeMap::new();

        for (role, tracked) in &artifact.files {
            let mut violations =
                naming::check_key(&self.spec.naming, &artifact.key, &tracked.file.key);
            let (content_violations, file_facts) = match fetched.get(role) {
                Some(file) => self.check_fetched(tracked.format, file),
                None => (
                    vec![Violation::error(
                        RuleCode::ObjectMissing,
                        format!("{} was not retrieved", tracked.file.key),
                    )],
                    FileFacts::default(),
                ),
            };
            violations.extend(content_violations);
            facts.insert(role.clone(), file_facts);

            let outcome = if violations.iter().any(Violation::is_error) {
                FileOutcome::Invalid
            } else {
                FileOutcome::Valid
            };
            result.files.insert(
                role.clone(),
                FileReport {
                    key: tracked.file.key.clone(),
                    etag: tracked.file.etag.clone(),
                    size: tracked.file.size,
                    format: tracked.format,
                    outcome,
                    violations,
                },
            );
        }

        result
            .artifact_violations
            .extend(naming::check_basenames(&self.spec.naming, artifact));
        result
            .artifact_violations
            .extend(cross::check(self.spec, artifact, &facts));

        if let Some(row) = facts.into_values().find_map(|facts| facts.metadata_row) {
            result.metadata = row;
        }
        result
    }

    fn check_fetched(&self, format: FileFormat, file: &FetchedFile) -> (Vec<Violation>, FileFacts) {
        match file {
            FetchedFile::Content(bytes) => self.check_content(format, bytes),
            FetchedFile::Oversized { size, limit } => (
                vec![Violation::error(
                    RuleCode::BamTooLarge,
                    format!("file is {size} bytes, the limit is {limit}"),
                )],
                FileFacts::default(),
            ),
            FetchedFile::Missing => (
                vec![Violation::error(
                    RuleCode::ObjectMissing,
                    "object no longer exists in the bucket",
                )],
                FileFacts::default(),
            ),
            FetchedFile::Denied => (
                vec![Violation::error(
                    RuleCode::AccessDenied,
                    "bucket policy does not allow reading submitted files",
                )],
                FileFacts::default(),
            ),
            FetchedFile::Unavailable(reason) => (
                vec![Violation::error(RuleCode::StorageUnavailable, reason.clone())],
                FileFacts::default(),
            ),
        }
    }

    fn check_content(&self, format: FileFormat, bytes: &[u8]) -> (Vec<Violation>, FileFacts) {
        let mut facts = FileFacts::default();
        let violations = match format {
            FileFormat::Bam => {
                let (violations, reads) = alignment::check(&self.spec.alignment, bytes);
                facts.read_count = reads;
                violations
            }
            FileFormat::Index => {
                if bytes.is_empty() {
                    vec![Violation::error(RuleCode::IndexEmpty, "index file is empty")]
                } else {
                    Vec::new()
                }
            }
            FileFormat::Fasta => match fasta::decode_text(bytes) {
                Ok(text) => fasta::check_fasta(&self.spec.fasta, &text),
                Err(violation) => vec![violation],
            },
            FileFormat::Fastq => match fasta::decode_text(bytes) {
                Ok(text) => {
                    let (violations, reads) = fasta::check_fastq(&self.spec.fastq, &text);
                    facts.read_count = reads;
                    violations
                }
                Err(violation) => vec![violation],
            },
            FileFormat::Csv => match std::str::from_utf8(bytes) {
                Ok(text) => {
                    let (violations, row) = tabular::check(&self.spec.tabular, text);
                    facts.metadata_row = row;
                    violations
                }
                Err(_) => vec![Violation::error(
                    RuleCode::CsvUnreadable,
                    "metadata sheet is not valid UTF-8",
                )],
            },
        };
        (violations, facts)
    }
}
