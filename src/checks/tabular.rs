use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};

use crate::rules::{FieldType, TabularSchema};
use crate::verdict::{RuleCode, Violation};

/// Validates a one-row metadata sheet. The parsed row is returned whenever
/// the sheet had a header and exactly one data row.
pub(super) fn check(
    schema: &TabularSchema,
    text: &str,
) -> (Vec<Violation>, Option<BTreeMap<String, String>>) {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let records = match reader.records().collect::<Result<Vec<StringRecord>, _>>() {
        Ok(records) => records,
        Err(err) => {
            return (
                vec![Violation::error(
                    RuleCode::CsvUnreadable,
                    format!("metadata sheet could not be parsed: {err}"),
                )],
                None,
            );
        }
    };

    let mut rows = records.iter();
    let Some(header) = rows.next() else {
        return (
            vec![Violation::error(RuleCode::CsvNoDataRow, "metadata sheet is empty")],
            None,
        );
    };
    let data = rows.collect::<Vec<_>>();

    let mut violations = Vec::new();
    let mut seen = BTreeSet::new();
    let duplicates = header
        .iter()
        .filter(|field| !seen.insert(*field))
        .collect::<BTreeSet<_>>();
    for field in duplicates {
        violations.push(
            Violation::error(
                RuleCode::CsvDuplicateField,
                format!("column {field} appears more than once"),
            )
            .with_field(field),
        );
    }

    let known_fields_declared =
        !schema.required_fields.is_empty() || !schema.optional_fields.is_empty();
    for field in header.iter().filter(|field| !field.is_empty()) {
        if known_fields_declared && !schema.is_known_field(field) {
            let message = format!("column {field} is not part of the metadata schema");
            let violation = if schema.allow_extra_fields {
                Violation::warning(RuleCode::CsvUnexpectedField, message)
            } else {
                Violation::error(RuleCode::CsvUnexpectedField, message)
            };
            violations.push(violation.with_field(field));
        }
    }

    let row = match data.as_slice() {
        [] => {
            violations.push(Violation::error(
                RuleCode::CsvNoDataRow,
                "metadata sheet has a header but no data row",
            ));
            None
        }
        [row] => Some(*row),
        rows => {
            violations.push(Violation::error(
                RuleCode::CsvMultipleRows,
                format!("expected one data row, found {}", rows.len()),
            ));
            None
        }
    };

    for field in &schema.required_fields {
        if !header.iter().any(|column| column == field) {
            violations.push(
                Violation::error(
                    RuleCode::CsvMissingField,
                    format!("required column {field} is missing"),
                )
                .with_field(field),
            );
        }
    }

    let Some(row) = row else {
        return (violations, None);
    };
    if row.len() != header.len() {
        violations.push(Violation::error(
            RuleCode::CsvRowWidth,
            format!(
                "data row has {} values for {} columns",
                row.len(),
                header.len()
            ),
        ));
    }

    let mut values = BTreeMap::new();
    for (column, value) in header.iter().zip(row.iter()) {
        values
            .entry(column.to_string())
            .or_insert_with(|| value.to_string());
    }

    for field in &schema.required_fields {
        if values.get(field).is_some_and(String::is_empty) {
            violations.push(
                Violation::error(RuleCode::CsvMissingField, format!("{field} is empty"))
                    .with_field(field),
            );
        }
    }

    for (field, value) in values.iter().filter(|(_, value)| !value.is_empty()) {
        violations.extend(check_value(schema, field, value));
    }

    if schema.disallow_sample_id_elsewhere
        && let Some(id_field) = &schema.sample_id_field
        && let Some(sample_id) = values.get(id_field).filter(|value| !value.is_empty())
    {
        for (field, value) in &values {
            if field != id_field && value == sample_id {
                violations.push(
                    Violation::error(
                        RuleCode::CsvSampleIdElsewhere,
                        format!("sample identifier {sample_id} also appears in {field}"),
                    )
                    .with_field(field),
                );
            }
        }
    }

    (violations, Some(values))
}

fn check_value(schema: &TabularSchema, field: &str, value: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    match schema.field_datatypes.get(field) {
        Some(FieldType::Integer) if value.parse::<i64>().is_err() => {
            violations.push(
                Violation::error(
                    RuleCode::CsvInvalidInteger,
                    format!("{field} value {value:?} is not an integer"),
                )
                .with_field(field),
            );
        }
        Some(FieldType::Date) if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() => {
            violations.push(
                Violation::error(
                    RuleCode::CsvInvalidDate,
                    format!("{field} value {value:?} is not a YYYY-MM-DD date"),
                )
                .with_field(field),
            );
        }
        _ => {}
    }

    if let Some(choices) = schema.field_choices.get(field)
        && !choices.iter().any(|choice| choice == value)
    {
        violations.push(
            Violation::error(
                RuleCode::CsvInvalidChoice,
                format!(
                    "{field} value {value:?} is not one of {}",
                    choices.join(", ")
                ),
            )
            .with_field(field),
        );
    }

    if let Some(ranges) = schema.character_limits.get(field)
        && !ranges.contains(value.chars().count())
    {
        violations.push(
            Violation::error(
                RuleCode::CsvLengthOutOfRange,
                format!("{field} length {} is outside {ranges}", value.chars().count()),
            )
            .with_field(field),
        );
    }
    violations
}
