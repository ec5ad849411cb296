use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::bucket::{BucketLayout, SiteBucket};
use crate::domain::{Capability, FileFormat, FileRole, Platform};
use crate::error::GateError;
use crate::registry::{IDENTITY_SEGMENTS, PathogenSpec, PlatformSpec, RoleSpec, SpecRegistry};
use crate::retry::RetryPolicy;
use crate::rules::{
    AlignmentRules, CrossFileRules, FastaRules, FastqRules, FieldType, NamingRules, TabularSchema,
};
use crate::tracker::{DuplicatePolicy, TrackerSettings};

pub const DEFAULT_CONFIG_FILE: &str = "seqgate.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub pathogens: BTreeMap<String, PathogenConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub staleness_secs: Option<u64>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub resolved_retention_secs: Option<u64>,
    #[serde(default)]
    pub duplicate_policy: Option<DuplicatePolicy>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathogenConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub sites: Vec<String>,
    pub platforms: BTreeMap<String, Vec<RoleEntry>>,
    #[serde(default)]
    pub naming: NamingRules,
    #[serde(default)]
    pub fasta: FastaRules,
    #[serde(default)]
    pub fastq: FastqRules,
    #[serde(default)]
    pub bam: AlignmentRules,
    #[serde(default)]
    pub csv: TabularSchema,
    #[serde(default)]
    pub cross_file: CrossFileRules,
    #[serde(default)]
    pub bucket_policies: BTreeMap<String, Vec<Capability>>,
    #[serde(default)]
    pub site_buckets: BTreeMap<String, BucketEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoleEntry {
    pub role: String,
    pub suffix: String,
    pub layout: String,
    pub format: FileFormat,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BucketEntry {
    pub name_layout: String,
    pub policy: String,
}

fn default_delimiter() -> String {
    ".".to_string()
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub sweep_interval: Duration,
    pub tracker: TrackerSettings,
    pub retry: RetryPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            sweep_interval: Duration::from_secs(60),
            tracker: TrackerSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub registry: SpecRegistry,
    pub runtime: RuntimeSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, GateError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(GateError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| GateError::ConfigRead(config_path.clone()))?;
        Self::resolve_str(&content)
    }

    pub fn resolve_str(content: &str) -> Result<ResolvedConfig, GateError> {
        let config: Config =
            serde_json::from_str(content).map_err(|err| GateError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, GateError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if config.pathogens.is_empty() {
            return Err(GateError::Config("no pathogens configured".to_string()));
        }

        let pathogens = config
            .pathogens
            .into_iter()
            .map(|(id, entry)| resolve_pathogen(id, entry))
            .collect::<Result<Vec<_>, GateError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            registry: SpecRegistry::new(pathogens),
            runtime: resolve_runtime(config.runtime)?,
        })
    }
}

fn resolve_runtime(runtime: RuntimeConfig) -> Result<RuntimeSettings, GateError> {
    let defaults = RuntimeSettings::default();
    let workers = runtime.workers.unwrap_or(defaults.workers);
    if workers == 0 {
        return Err(GateError::Config("runtime.workers must be at least 1".to_string()));
    }

    let tracker = TrackerSettings {
        staleness: runtime
            .staleness_secs
            .map(secs_delta)
            .transpose()?
            .unwrap_or(defaults.tracker.staleness),
        resolved_retention: runtime
            .resolved_retention_secs
            .map(secs_delta)
            .transpose()?
            .unwrap_or(defaults.tracker.resolved_retention),
        duplicate_policy: runtime
            .duplicate_policy
            .unwrap_or(defaults.tracker.duplicate_policy),
    };

    let retry = match runtime.retry {
        Some(retry) => {
            if retry.max_attempts == 0 {
                return Err(GateError::Config(
                    "runtime.retry.max_attempts must be at least 1".to_string(),
                ));
            }
            RetryPolicy {
                max_attempts: retry.max_attempts,
                base_delay: retry
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: retry
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            }
        }
        None => defaults.retry,
    };

    Ok(RuntimeSettings {
        workers,
        sweep_interval: runtime
            .sweep_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval),
        tracker,
        retry,
    })
}

fn secs_delta(secs: u64) -> Result<TimeDelta, GateError> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| GateError::Config(format!("duration of {secs}s is out of range")))
}

fn resolve_pathogen(id: String, entry: PathogenConfig) -> Result<PathogenSpec, GateError> {
    let config_err = |message: String| GateError::Config(format!("pathogen {id}: {message}"));

    let mut delimiter_chars = entry.delimiter.chars();
    let delimiter = match (delimiter_chars.next(), delimiter_chars.next()) {
        (Some(ch), None) => ch,
        _ => {
            return Err(config_err(format!(
                "delimiter must be a single character, got {:?}",
                entry.delimiter
            )));
        }
    };

    if entry.platforms.is_empty() {
        return Err(config_err("no platforms declared".to_string()));
    }

    let mut platforms = BTreeMap::new();
    for (name, roles) in entry.platforms {
        let platform = Platform::new(name);
        let spec = resolve_platform(&platform, roles, delimiter).map_err(|err| match err {
            GateError::Config(message) => config_err(message),
            other => other,
        })?;
        platforms.insert(platform, spec);
    }

    if entry.bam.check_dehumanised && entry.bam.human_references.is_empty() {
        return Err(config_err(
            "bam.check_dehumanised requires bam.human_references".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&entry.bam.max_human_fraction) {
        return Err(config_err(
            "bam.max_human_fraction must be between 0 and 1".to_string(),
        ));
    }
    for (field, datatype) in &entry.csv.field_datatypes {
        if *datatype == FieldType::Choice && !entry.csv.field_choices.contains_key(field) {
            return Err(config_err(format!(
                "csv field {field} is a choice but has no field_choices entry"
            )));
        }
    }
    for pair in &entry.cross_file.paired_roles {
        for role in pair {
            let declared = platforms.values().any(|spec| spec.role(role).is_some());
            if !declared {
                return Err(config_err(format!(
                    "cross_file.paired_roles names undeclared role {role}"
                )));
            }
        }
    }

    if entry.site_buckets.is_empty() {
        return Err(config_err("no site_buckets declared".to_string()));
    }
    let mut buckets = Vec::new();
    for (name, bucket) in entry.site_buckets {
        let layout = BucketLayout::parse(&bucket.name_layout)?;
        for label in ["project", "site", "platform"] {
            if !layout.has_label(label) {
                return Err(config_err(format!(
                    "bucket layout {} is missing {{{label}}}",
                    bucket.name_layout
                )));
            }
        }
        let capabilities = entry
            .bucket_policies
            .get(&bucket.policy)
            .ok_or_else(|| {
                config_err(format!(
                    "site bucket {name} references unknown policy {}",
                    bucket.policy
                ))
            })?
            .iter()
            .copied()
            .collect::<BTreeSet<_>>();
        buckets.push(SiteBucket {
            name,
            layout,
            policy: bucket.policy,
            capabilities,
        });
    }

    Ok(PathogenSpec {
        id,
        delimiter,
        sites: entry.sites.into_iter().collect(),
        platforms,
        naming: entry.naming,
        fasta: entry.fasta,
        fastq: entry.fastq,
        alignment: entry.bam,
        tabular: entry.csv,
        cross_file: entry.cross_file,
        buckets,
    })
}

fn resolve_platform(
    platform: &Platform,
    entries: Vec<RoleEntry>,
    delimiter: char,
) -> Result<PlatformSpec, GateError> {
    if entries.is_empty() {
        return Err(GateError::Config(format!(
            "platform {platform} declares no file roles"
        )));
    }

    let mut roles: Vec<RoleSpec> = Vec::new();
    for entry in entries {
        let role = resolve_role(platform, entry, delimiter)?;
        if roles.iter().any(|existing| existing.role == role.role) {
            return Err(GateError::Config(format!(
                "platform {platform} declares role {} twice",
                role.role
            )));
        }
        if roles.iter().any(|existing| existing.suffix == role.suffix) {
            return Err(GateError::Config(format!(
                "platform {platform} declares suffix {} twice",
                role.suffix
            )));
        }
        roles.push(role);
    }

    let required = roles.iter().map(|spec| spec.role.clone()).collect();
    Ok(PlatformSpec {
        platform: platform.clone(),
        roles,
        required,
    })
}

fn resolve_role(
    platform: &Platform,
    entry: RoleEntry,
    delimiter: char,
) -> Result<RoleSpec, GateError> {
    let invalid = |message: String| {
        GateError::Config(format!(
            "platform {platform} role {}: {message}",
            entry.role
        ))
    };

    let Some(suffix_body) = entry.suffix.strip_prefix(delimiter) else {
        return Err(invalid(format!(
            "suffix {} must start with the delimiter {delimiter:?}",
            entry.suffix
        )));
    };
    let suffix_segments = suffix_body.split(delimiter).collect::<Vec<_>>();
    if suffix_segments.iter().any(|segment| segment.is_empty()) {
        return Err(invalid(format!("suffix {} has an empty segment", entry.suffix)));
    }

    let layout = entry
        .layout
        .split(delimiter)
        .map(str::to_string)
        .collect::<Vec<_>>();
    if layout.iter().any(String::is_empty) {
        return Err(invalid(format!("layout {} has an empty segment", entry.layout)));
    }
    if suffix_segments.len() >= layout.len() {
        return Err(invalid(format!(
            "layout {} leaves no segments before suffix {}",
            entry.layout, entry.suffix
        )));
    }
    let stem = layout.len() - suffix_segments.len();
    for name in IDENTITY_SEGMENTS {
        match layout.iter().position(|segment| segment == name) {
            Some(index) if index < stem => {}
            Some(_) => {
                return Err(invalid(format!(
                    "identity segment {name} falls inside suffix {}",
                    entry.suffix
                )));
            }
            None => {
                return Err(invalid(format!(
                    "layout {} is missing identity segment {name}",
                    entry.layout
                )));
            }
        }
    }
    let mut seen = BTreeSet::new();
    if let Some(repeated) = layout.iter().find(|segment| !seen.insert(segment.as_str())) {
        return Err(invalid(format!(
            "layout {} repeats segment {repeated}",
            entry.layout
        )));
    }

    Ok(RoleSpec {
        role: FileRole::new(entry.role),
        suffix_segments: suffix_segments.len(),
        suffix: entry.suffix,
        layout,
        format: entry.format,
    })
}
