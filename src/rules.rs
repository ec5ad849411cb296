use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::FileRole;
use crate::error::GateError;

/// Set of permitted characters written as a comma-separated token list,
/// e.g. `alphanumeric,_,-`. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CharacterClass {
    source: String,
    alphanumeric: bool,
    alpha: bool,
    digits: bool,
    extra: BTreeSet<char>,
}

impl CharacterClass {
    pub fn allows(&self, ch: char) -> bool {
        let upper = ch.to_ascii_uppercase();
        (self.alphanumeric && upper.is_ascii_alphanumeric())
            || (self.alpha && upper.is_ascii_alphabetic())
            || (self.digits && upper.is_ascii_digit())
            || self.extra.contains(&upper)
    }

    /// First character of `value` outside the class.
    pub fn first_disallowed(&self, value: &str) -> Option<char> {
        value.chars().find(|ch| !self.allows(*ch))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl FromStr for CharacterClass {
    type Err = GateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut class = CharacterClass {
            source: value.to_string(),
            alphanumeric: false,
            alpha: false,
            digits: false,
            extra: BTreeSet::new(),
        };
        for token in value.split(',') {
            match token {
                "alphanumeric" => class.alphanumeric = true,
                "alpha" => class.alpha = true,
                "digits" => class.digits = true,
                other => {
                    let mut chars = other.chars();
                    match (chars.next(), chars.next()) {
                        (Some(ch), None) => {
                            class.extra.insert(ch.to_ascii_uppercase());
                        }
                        _ => {
                            return Err(GateError::Config(format!(
                                "invalid character class token {other:?} in {value:?}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(class)
    }
}

impl TryFrom<String> for CharacterClass {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CharacterClass> for String {
    fn from(value: CharacterClass) -> Self {
        value.source
    }
}

/// Permitted value lengths, written like `1-64` or `3,5-8`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LengthRanges {
    source: String,
    ranges: Vec<RangeInclusive<usize>>,
}

impl LengthRanges {
    pub fn contains(&self, len: usize) -> bool {
        self.ranges.iter().any(|range| range.contains(&len))
    }
}

impl fmt::Display for LengthRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for LengthRanges {
    type Err = GateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || GateError::Config(format!("invalid length range {value:?}"));
        let mut ranges = Vec::new();
        for part in value.split(',').map(str::trim) {
            let range = match part.split_once('-') {
                Some((low, high)) => {
                    let low = low.trim().parse::<usize>().map_err(|_| invalid())?;
                    let high = high.trim().parse::<usize>().map_err(|_| invalid())?;
                    if low > high {
                        return Err(invalid());
                    }
                    low..=high
                }
                None => {
                    let exact = part.parse::<usize>().map_err(|_| invalid())?;
                    exact..=exact
                }
            };
            ranges.push(range);
        }
        Ok(Self {
            source: value.to_string(),
            ranges,
        })
    }
}

impl TryFrom<String> for LengthRanges {
    type Error = GateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LengthRanges> for String {
    fn from(value: LengthRanges) -> Self {
        value.source
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamingRules {
    /// Applied to the project, run_index and run_id segments of every key.
    #[serde(default)]
    pub allowed_characters: Option<CharacterClass>,
    #[serde(default)]
    pub max_segment_length: Option<usize>,
    #[serde(default)]
    pub max_key_length: Option<usize>,
    #[serde(default)]
    pub identical_basenames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FastaRules {
    #[serde(default = "default_one")]
    pub min_length: usize,
    #[serde(default)]
    pub iupac_only: bool,
    #[serde(default)]
    pub header_allowed_characters: Option<CharacterClass>,
    #[serde(default = "default_true")]
    pub single_record: bool,
}

impl Default for FastaRules {
    fn default() -> Self {
        Self {
            min_length: 1,
            iupac_only: false,
            header_allowed_characters: None,
            single_record: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FastqRules {
    #[serde(default)]
    pub iupac_only: bool,
    #[serde(default = "default_one")]
    pub min_reads: usize,
}

impl Default for FastqRules {
    fn default() -> Self {
        Self {
            iupac_only: false,
            min_reads: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlignmentRules {
    /// Reference sequence names a BAM header may declare. Empty means any.
    #[serde(default)]
    pub allowed_references: BTreeSet<String>,
    /// Reads were aligned against a combined pathogen+human reference, so the
    /// human contigs are acceptable header entries too.
    #[serde(default)]
    pub compound_reference: bool,
    #[serde(default)]
    pub human_references: BTreeSet<String>,
    #[serde(default)]
    pub require_sorted: bool,
    #[serde(default)]
    pub require_quickcheck: bool,
    #[serde(default)]
    pub check_dehumanised: bool,
    #[serde(default)]
    pub max_human_fraction: f64,
    #[serde(default)]
    pub require_primer_trimming: bool,
    #[serde(default = "default_primer_programs")]
    pub primer_trim_programs: Vec<String>,
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
}

fn default_primer_programs() -> Vec<String> {
    vec!["ivar".to_string()]
}

impl Default for AlignmentRules {
    fn default() -> Self {
        Self {
            allowed_references: BTreeSet::new(),
            compound_reference: false,
            human_references: BTreeSet::new(),
            require_sorted: false,
            require_quickcheck: false,
            check_dehumanised: false,
            max_human_fraction: 0.0,
            require_primer_trimming: false,
            primer_trim_programs: default_primer_programs(),
            max_size_bytes: None,
        }
    }
}

impl AlignmentRules {
    pub fn reference_allowed(&self, name: &str) -> bool {
        self.allowed_references.is_empty()
            || self.allowed_references.contains(name)
            || (self.compound_reference && self.human_references.contains(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Date,
    Choice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabularSchema {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optional_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_extra_fields: bool,
    #[serde(default)]
    pub field_datatypes: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub field_choices: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub character_limits: BTreeMap<String, LengthRanges>,
    #[serde(default)]
    pub sample_id_field: Option<String>,
    #[serde(default)]
    pub disallow_sample_id_elsewhere: bool,
    /// Key segments (e.g. `run_index`) whose value must equal the CSV column
    /// of the same name.
    #[serde(default)]
    pub identity_fields: Vec<String>,
}

impl Default for TabularSchema {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            optional_fields: Vec::new(),
            allow_extra_fields: true,
            field_datatypes: BTreeMap::new(),
            field_choices: BTreeMap::new(),
            character_limits: BTreeMap::new(),
            sample_id_field: None,
            disallow_sample_id_elsewhere: false,
            identity_fields: Vec::new(),
        }
    }
}

impl TabularSchema {
    pub fn is_known_field(&self, field: &str) -> bool {
        self.required_fields.iter().any(|name| name == field)
            || self.optional_fields.iter().any(|name| name == field)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrossFileRules {
    /// Read files that must carry the same number of records.
    #[serde(default)]
    pub paired_roles: Vec<[FileRole; 2]>,
    #[serde(default = "default_true")]
    pub project_matches_bucket: bool,
}

impl Default for CrossFileRules {
    fn default() -> Self {
        Self {
            paired_roles: Vec::new(),
            project_matches_bucket: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_class_tokens() {
        let class: CharacterClass = "alphanumeric,_,-".parse().unwrap();
        assert!(class.allows('a'));
        assert!(class.allows('Z'));
        assert!(class.allows('7'));
        assert!(class.allows('_'));
        assert!(!class.allows('.'));
        assert_eq!(class.first_disallowed("run_1.x"), Some('.'));
    }

    #[test]
    fn character_class_rejects_multi_char_token() {
        assert!("alphanumeric,ab".parse::<CharacterClass>().is_err());
    }

    #[test]
    fn length_ranges_parse() {
        let ranges: LengthRanges = "1-3,8".parse().unwrap();
        assert!(ranges.contains(1));
        assert!(ranges.contains(3));
        assert!(!ranges.contains(4));
        assert!(ranges.contains(8));
        assert!("5-2".parse::<LengthRanges>().is_err());
    }

    #[test]
    fn compound_reference_accepts_human_contigs() {
        let rules = AlignmentRules {
            allowed_references: ["MN908947.3".to_string()].into(),
            human_references: ["chr1".to_string()].into(),
            compound_reference: true,
            ..AlignmentRules::default()
        };
        assert!(rules.reference_allowed("chr1"));
        assert!(!rules.reference_allowed("chrUn"));
    }
}
