use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Identity under which the files of one submission are grouped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub project: String,
    pub run_index: String,
    pub run_id: String,
}

impl ArtifactKey {
    pub fn new(
        project: impl Into<String>,
        run_index: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            run_index: run_index.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.run_index, self.run_id)
    }
}

impl FromStr for ArtifactKey {
    type Err = GateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.trim().split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [project, run_index, run_id]
                if !project.is_empty() && !run_index.is_empty() && !run_id.is_empty() =>
            {
                Ok(Self::new(*project, *run_index, *run_id))
            }
            _ => Err(GateError::key_format(
                value,
                "artifact key must be project.run_index.run_id",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRole(String);

impl FileRole {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Fastq,
    Fasta,
    Bam,
    Csv,
    Index,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Fastq => write!(f, "fastq"),
            FileFormat::Fasta => write!(f, "fasta"),
            FileFormat::Bam => write!(f, "bam"),
            FileFormat::Csv => write!(f, "csv"),
            FileFormat::Index => write!(f, "index"),
        }
    }
}

/// Bucket operations a named policy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Get,
    Put,
    List,
    Delete,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Get => write!(f, "get"),
            Capability::Put => write!(f, "put"),
            Capability::List => write!(f, "list"),
            Capability::Delete => write!(f, "delete"),
        }
    }
}

/// A received object as the tracker sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub received_at: DateTime<Utc>,
    pub submitter: Option<String>,
    /// The object key with the role suffix stripped.
    pub basename: String,
}

impl FileRef {
    pub fn same_content(&self, other: &FileRef) -> bool {
        self.key == other.key && self.etag == other.etag
    }
}

/// Who submitted what, derived from the bucket the object landed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionContext {
    pub pathogen: String,
    pub site: String,
    pub platform: Platform,
    pub test_flag: bool,
    pub bucket: String,
    pub capabilities: BTreeSet<Capability>,
}

impl SubmissionContext {
    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
