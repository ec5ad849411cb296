use crate::bam::{self, BamSummary};
use crate::rules::AlignmentRules;
use crate::verdict::{RuleCode, Violation};

/// Returns the violations and the primary read count when the file decoded.
pub(super) fn check(rules: &AlignmentRules, bytes: &[u8]) -> (Vec<Violation>, Option<u64>) {
    let mut violations = Vec::new();

    if let Some(limit) = rules.max_size_bytes
        && bytes.len() as u64 > limit
    {
        violations.push(Violation::error(
            RuleCode::BamTooLarge,
            format!("file is {} bytes, the limit is {limit}", bytes.len()),
        ));
        return (violations, None);
    }

    if rules.require_quickcheck
        && let Err(err) = bam::quickcheck(bytes)
    {
        violations.push(Violation::error(
            RuleCode::BamQuickcheckFailed,
            format!("integrity check failed: {err}"),
        ));
    }

    let summary = match bam::read_bam(bytes) {
        Ok(summary) => summary,
        Err(err) => {
            violations.push(Violation::error(
                RuleCode::BamUnreadable,
                format!("alignment could not be read: {err}"),
            ));
            return (violations, None);
        }
    };

    violations.extend(check_header(rules, &summary));
    violations.extend(check_reads(rules, &summary));
    (violations, Some(summary.stats.primary))
}

fn check_header(rules: &AlignmentRules, summary: &BamSummary) -> Vec<Violation> {
    let mut violations = Vec::new();
    let disallowed = summary
        .header
        .references
        .iter()
        .filter(|reference| !rules.reference_allowed(&reference.name))
        .map(|reference| reference.name.as_str())
        .collect::<Vec<_>>();
    if !disallowed.is_empty() {
        violations.push(Violation::error(
            RuleCode::BamDisallowedReference,
            format!(
                "header declares references outside the allowed set: {}",
                disallowed.join(", ")
            ),
        ));
    }

    if rules.require_sorted && summary.header.sort_order() != Some("coordinate") {
        violations.push(Violation::error(
            RuleCode::BamNotSorted,
            format!(
                "sort order is {}, expected coordinate",
                summary.header.sort_order().unwrap_or("not declared")
            ),
        ));
    }

    if rules.require_primer_trimming {
        let trimmed = summary.header.programs().iter().any(|program| {
            ["ID", "PN"].iter().any(|tag| {
                program.get(tag).is_some_and(|value| {
                    let value = value.to_ascii_lowercase();
                    rules
                        .primer_trim_programs
                        .iter()
                        .any(|name| value.contains(&name.to_ascii_lowercase()))
                })
            })
        });
        if !trimmed {
            violations.push(Violation::error(
                RuleCode::BamPrimerTrimMissing,
                format!(
                    "no @PG line from a primer trimming program ({})",
                    rules.primer_trim_programs.join(", ")
                ),
            ));
        }
    }
    violations
}

fn check_reads(rules: &AlignmentRules, summary: &BamSummary) -> Vec<Violation> {
    let primary = summary.stats.primary;
    if primary == 0 {
        return vec![Violation::error(
            RuleCode::BamNoReads,
            "alignment contains no primary reads",
        )];
    }

    if !rules.check_dehumanised {
        return Vec::new();
    }
    let human = summary.stats.mapped_to(&rules.human_references);
    let fraction = human as f64 / primary as f64;
    tracing::debug!(human, primary, fraction, "human read fraction");
    // Inclusive bound: exactly the maximum passes.
    if fraction > rules.max_human_fraction {
        return vec![Violation::error(
            RuleCode::BamHumanFraction,
            format!(
                "{human} of {primary} reads ({fraction}) map to human references, the maximum is {}",
                rules.max_human_fraction
            ),
        )];
    }
    Vec::new()
}
