use std::collections::BTreeMap;

use crate::domain::{ArtifactKey, FileRole};
use crate::registry::PathogenSpec;
use crate::tracker::CompleteArtifact;
use crate::verdict::{RuleCode, Violation};

use super::FileFacts;

pub(super) fn check(
    spec: &PathogenSpec,
    artifact: &CompleteArtifact,
    facts: &BTreeMap<FileRole, FileFacts>,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    if spec.cross_file.project_matches_bucket && artifact.key.project != artifact.context.pathogen
    {
        violations.push(
            Violation::error(
                RuleCode::ProjectBucketMismatch,
                format!(
                    "project {} does not match bucket {} ({})",
                    artifact.key.project, artifact.context.bucket, artifact.context.pathogen
                ),
            )
            .with_field("project"),
        );
    }

    for (role, row) in facts
        .iter()
        .filter_map(|(role, facts)| Some((role, facts.metadata_row.as_ref()?)))
    {
        for field in &spec.tabular.identity_fields {
            let Some(expected) = identity_value(&artifact.key, field) else {
                continue;
            };
            match row.get(field) {
                Some(value) if !value.is_empty() && value != expected => {
                    violations.push(
                        Violation::error(
                            RuleCode::MetadataIdentityMismatch,
                            format!(
                                "{role} has {field} {value:?} but the file name says {expected:?}"
                            ),
                        )
                        .with_field(field),
                    );
                }
                _ => {}
            }
        }
    }

    for [left, right] in &spec.cross_file.paired_roles {
        let count = |role: &FileRole| facts.get(role).and_then(|facts| facts.read_count);
        if let (Some(left_reads), Some(right_reads)) = (count(left), count(right))
            && left_reads != right_reads
        {
            violations.push(Violation::error(
                RuleCode::PairedReadCountMismatch,
                format!("{left} has {left_reads} reads but {right} has {right_reads}"),
            ));
        }
    }
    violations
}

fn identity_value<'a>(key: &'a ArtifactKey, field: &str) -> Option<&'a str> {
    match field {
        "project" => Some(&key.project),
        "run_index" => Some(&key.run_index),
        "run_id" => Some(&key.run_id),
        _ => None,
    }
}
