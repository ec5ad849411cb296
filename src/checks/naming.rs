use std::collections::BTreeSet;

use crate::domain::ArtifactKey;
use crate::rules::NamingRules;
use crate::tracker::CompleteArtifact;
use crate::verdict::{RuleCode, Violation};

pub(super) fn check_key(rules: &NamingRules, key: &ArtifactKey, object_key: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    let segments = [
        ("project", key.project.as_str()),
        ("run_index", key.run_index.as_str()),
        ("run_id", key.run_id.as_str()),
    ];

    for (name, value) in segments {
        if let Some(class) = &rules.allowed_characters
            && let Some(ch) = class.first_disallowed(value)
        {
            violations.push(
                Violation::error(
                    RuleCode::DisallowedCharacter,
                    format!(
                        "{name} {value:?} contains {ch:?}; allowed characters are {}",
                        class.as_str()
                    ),
                )
                .with_field(name),
            );
        }
        if let Some(max) = rules.max_segment_length
            && value.chars().count() > max
        {
            violations.push(
                Violation::error(
                    RuleCode::SegmentTooLong,
                    format!("{name} {value:?} is longer than {max} characters"),
                )
                .with_field(name),
            );
        }
    }

    if let Some(max) = rules.max_key_length
        && object_key.chars().count() > max
    {
        violations.push(Violation::error(
            RuleCode::KeyTooLong,
            format!("object key {object_key} is longer than {max} characters"),
        ));
    }
    violations
}

pub(super) fn check_basenames(rules: &NamingRules, artifact: &CompleteArtifact) -> Option<Violation> {
    if !rules.identical_basenames {
        return None;
    }
    let basenames = artifact
        .files
        .values()
        .map(|tracked| tracked.file.basename.as_str())
        .collect::<BTreeSet<_>>();
    if basenames.len() <= 1 {
        return None;
    }
    Some(Violation::error(
        RuleCode::BasenameMismatch,
        format!(
            "files of one artifact must share a basename, found {}",
            basenames.into_iter().collect::<Vec<_>>().join(", ")
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_every_offending_segment() {
        let rules = NamingRules {
            allowed_characters: Some("alphanumeric,_,-".parse().unwrap()),
            max_segment_length: Some(6),
            ..NamingRules::default()
        };
        let key = ArtifactKey::new("proj1", "00 1", "run#1234");
        let violations = check_key(&rules, &key, "proj1.00 1.run#1234.csv");
        let rules_hit = violations
            .iter()
            .map(|violation| (violation.rule, violation.field.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            rules_hit,
            vec![
                (RuleCode::DisallowedCharacter, Some("run_index")),
                (RuleCode::DisallowedCharacter, Some("run_id")),
                (RuleCode::SegmentTooLong, Some("run_id")),
            ]
        );
    }
}
