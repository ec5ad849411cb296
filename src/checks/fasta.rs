use std::io::Read;

use flate2::read::MultiGzDecoder;

use crate::rules::{FastaRules, FastqRules};
use crate::verdict::{RuleCode, Violation};

const IUPAC: &str = "ACGTRYKMSWBDHVN";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_iupac(base: char) -> bool {
    IUPAC.contains(base.to_ascii_uppercase())
}

/// Sequence text, transparently gunzipped.
pub(super) fn decode_text(bytes: &[u8]) -> Result<String, Violation> {
    let raw = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        MultiGzDecoder::new(bytes)
            .read_to_end(&mut decoded)
            .map_err(|err| {
                Violation::error(
                    RuleCode::ContentUnreadable,
                    format!("gzip stream is corrupt: {err}"),
                )
            })?;
        decoded
    } else {
        bytes.to_vec()
    };
    String::from_utf8(raw)
        .map_err(|_| Violation::error(RuleCode::ContentUnreadable, "content is not valid text"))
}

struct FastaRecord<'a> {
    header: &'a str,
    sequence: String,
}

fn fasta_records(text: &str) -> Option<Vec<FastaRecord<'_>>> {
    let mut records: Vec<FastaRecord<'_>> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if let Some(header) = line.strip_prefix('>') {
            records.push(FastaRecord {
                header,
                sequence: String::new(),
            });
        } else if !line.is_empty() {
            records.last_mut()?.sequence.push_str(line.trim());
        }
    }
    Some(records)
}

pub(super) fn check_fasta(rules: &FastaRules, text: &str) -> Vec<Violation> {
    let Some(records) = fasta_records(text) else {
        return vec![Violation::error(
            RuleCode::FastaUnparseable,
            "sequence data appears before the first '>' header",
        )];
    };
    if records.is_empty() {
        return vec![Violation::error(
            RuleCode::FastaUnparseable,
            "no FASTA records found",
        )];
    }

    let mut violations = Vec::new();
    if rules.single_record && records.len() > 1 {
        violations.push(Violation::error(
            RuleCode::FastaMultipleRecords,
            format!("expected one record, found {}", records.len()),
        ));
    }

    for (index, record) in records.iter().enumerate() {
        let label = record
            .header
            .split_whitespace()
            .next()
            .map(str::to_string)
            .unwrap_or_else(|| format!("record {}", index + 1));

        if let Some(class) = &rules.header_allowed_characters
            && let Some(ch) = class.first_disallowed(record.header)
        {
            violations.push(Violation::error(
                RuleCode::FastaHeaderCharacters,
                format!(
                    "header of {label} contains {ch:?}; allowed characters are {}",
                    class.as_str()
                ),
            ));
        }

        if record.sequence.is_empty() {
            violations.push(Violation::error(
                RuleCode::FastaEmptySequence,
                format!("{label} has no sequence"),
            ));
            continue;
        }

        if rules.iupac_only {
            let invalid = record
                .sequence
                .chars()
                .filter(|base| !is_iupac(*base))
                .count();
            if invalid > 0 {
                violations.push(Violation::error(
                    RuleCode::FastaNonIupac,
                    format!("{label} has {invalid} characters outside the IUPAC alphabet"),
                ));
            }
        }

        let length = record.sequence.chars().count();
        if length < rules.min_length {
            violations.push(Violation::error(
                RuleCode::FastaTooShort,
                format!("{label} is {length} bases, the minimum is {}", rules.min_length),
            ));
        }
    }
    violations
}

/// Returns the violations and, when every record parsed, the read count.
pub(super) fn check_fastq(rules: &FastqRules, text: &str) -> (Vec<Violation>, Option<u64>) {
    let lines = text.trim_end().lines().collect::<Vec<_>>();
    let mut violations = Vec::new();

    if lines.len() % 4 != 0 {
        violations.push(Violation::error(
            RuleCode::FastqMalformed,
            format!("{} lines is not a whole number of 4-line records", lines.len()),
        ));
    }

    let mut reads = 0u64;
    let mut malformed = 0usize;
    let mut mismatched = 0usize;
    let mut non_iupac = 0usize;
    for chunk in lines.chunks_exact(4) {
        let [name, sequence, separator, quality] = [chunk[0], chunk[1], chunk[2], chunk[3]];
        if !name.starts_with('@') || !separator.starts_with('+') {
            malformed += 1;
            continue;
        }
        reads += 1;
        if sequence.len() != quality.len() {
            mismatched += 1;
        }
        if rules.iupac_only && !sequence.chars().all(is_iupac) {
            non_iupac += 1;
        }
    }

    if malformed > 0 {
        violations.push(Violation::error(
            RuleCode::FastqMalformed,
            format!("{malformed} records lack '@' or '+' markers"),
        ));
    }
    if mismatched > 0 {
        violations.push(Violation::error(
            RuleCode::FastqLengthMismatch,
            format!("{mismatched} records have sequence and quality of different lengths"),
        ));
    }
    if non_iupac > 0 {
        violations.push(Violation::error(
            RuleCode::FastqNonIupac,
            format!("{non_iupac} records contain characters outside the IUPAC alphabet"),
        ));
    }
    if reads < rules.min_reads as u64 {
        violations.push(Violation::error(
            RuleCode::FastqTooFewReads,
            format!("{reads} reads, the minimum is {}", rules.min_reads),
        ));
    }

    let parsed = violations
        .iter()
        .all(|violation| violation.rule != RuleCode::FastqMalformed);
    (violations, parsed.then_some(reads))
}
