use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::bucket::SiteBucket;
use crate::domain::{FileFormat, FileRole, Platform, SubmissionContext};
use crate::error::GateError;
use crate::rules::{
    AlignmentRules, CrossFileRules, FastaRules, FastqRules, NamingRules, TabularSchema,
};

/// Layout segment names that identify the artifact.
pub const IDENTITY_SEGMENTS: [&str; 3] = ["project", "run_index", "run_id"];

#[derive(Debug, Clone, Serialize)]
pub struct RoleSpec {
    pub role: FileRole,
    /// File-type suffix including the leading delimiter, e.g. `.1.fastq.gz`.
    pub suffix: String,
    pub suffix_segments: usize,
    pub layout: Vec<String>,
    pub format: FileFormat,
}

impl RoleSpec {
    /// Number of segments the key carries before the suffix.
    pub fn stem_segments(&self) -> usize {
        self.layout.len() - self.suffix_segments
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformSpec {
    pub platform: Platform,
    pub roles: Vec<RoleSpec>,
    pub required: BTreeSet<FileRole>,
}

impl PlatformSpec {
    pub fn role(&self, role: &FileRole) -> Option<&RoleSpec> {
        self.roles.iter().find(|spec| &spec.role == role)
    }
}

#[derive(Debug, Clone)]
pub struct PathogenSpec {
    pub id: String,
    pub delimiter: char,
    pub sites: BTreeSet<String>,
    pub platforms: BTreeMap<Platform, PlatformSpec>,
    pub naming: NamingRules,
    pub fasta: FastaRules,
    pub fastq: FastqRules,
    pub alignment: AlignmentRules,
    pub tabular: TabularSchema,
    pub cross_file: CrossFileRules,
    pub buckets: Vec<SiteBucket>,
}

impl PathogenSpec {
    pub fn platform(&self, platform: &Platform) -> Result<&PlatformSpec, GateError> {
        self.platforms
            .get(platform)
            .ok_or_else(|| GateError::UnknownPlatform {
                pathogen: self.id.clone(),
                platform: platform.to_string(),
            })
    }

    pub fn role_spec(&self, platform: &Platform, role: &FileRole) -> Option<&RoleSpec> {
        self.platforms.get(platform)?.role(role)
    }
}

/// Process-wide, read-only index of pathogen specifications.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    pathogens: BTreeMap<String, PathogenSpec>,
}

impl SpecRegistry {
    pub fn new(pathogens: impl IntoIterator<Item = PathogenSpec>) -> Self {
        Self {
            pathogens: pathogens
                .into_iter()
                .map(|spec| (spec.id.clone(), spec))
                .collect(),
        }
    }

    pub fn lookup(&self, pathogen: &str) -> Result<&PathogenSpec, GateError> {
        self.pathogens
            .get(pathogen)
            .ok_or_else(|| GateError::UnknownPathogen(pathogen.to_string()))
    }

    pub fn lookup_for_site(&self, pathogen: &str, site: &str) -> Result<&PathogenSpec, GateError> {
        let spec = self.lookup(pathogen)?;
        if !spec.sites.is_empty() && !spec.sites.contains(site) {
            return Err(GateError::UnknownSite {
                pathogen: pathogen.to_string(),
                site: site.to_string(),
            });
        }
        Ok(spec)
    }

    pub fn required_roles(
        &self,
        pathogen: &str,
        platform: &Platform,
    ) -> Result<&BTreeSet<FileRole>, GateError> {
        Ok(&self.lookup(pathogen)?.platform(platform)?.required)
    }

    pub fn pathogens(&self) -> impl Iterator<Item = &PathogenSpec> {
        self.pathogens.values()
    }

    /// Works out who submitted to `bucket` from the configured bucket layouts.
    pub fn resolve_bucket(&self, bucket: &str) -> Result<SubmissionContext, GateError> {
        let mut unknown_project = None;
        for spec in self.pathogens.values() {
            for site_bucket in &spec.buckets {
                let Some(values) = site_bucket.layout.captures(bucket) else {
                    continue;
                };
                let project = values.get("project").cloned().unwrap_or_default();
                if project != spec.id {
                    unknown_project.get_or_insert(project);
                    continue;
                }
                let site = values.get("site").cloned().unwrap_or_default();
                let platform = Platform::new(values.get("platform").cloned().unwrap_or_default());
                self.lookup_for_site(&spec.id, &site)?;
                spec.platform(&platform)?;
                let test_flag = values
                    .get("test_flag")
                    .map(|flag| flag == "test")
                    .unwrap_or(false);
                return Ok(SubmissionContext {
                    pathogen: spec.id.clone(),
                    site,
                    platform,
                    test_flag,
                    bucket: bucket.to_string(),
                    capabilities: site_bucket.capabilities.clone(),
                });
            }
        }
        match unknown_project {
            Some(project) if !self.pathogens.contains_key(&project) => {
                Err(GateError::UnknownPathogen(project))
            }
            _ => Err(GateError::UnknownBucket(bucket.to_string())),
        }
    }
}
