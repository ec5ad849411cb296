use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::domain::Capability;
use crate::error::GateError;

/// A bucket naming template such as `{project}-{site}-{platform}-{test_flag}`.
#[derive(Debug, Clone)]
pub struct BucketLayout {
    template: String,
    labels: Vec<String>,
    pattern: Regex,
}

impl BucketLayout {
    pub fn parse(template: &str) -> Result<Self, GateError> {
        let label_re = Regex::new(r"\{(\w*)\}").map_err(|err| GateError::Config(err.to_string()))?;
        let mut labels = Vec::new();
        let mut pattern = String::from("^");
        let mut last = 0;
        for caps in label_re.captures_iter(template) {
            let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let label = label.as_str();
            if label.is_empty() {
                return Err(GateError::Config(format!(
                    "bucket layout {template} contains an empty label"
                )));
            }
            if labels.iter().any(|existing| existing == label) {
                return Err(GateError::Config(format!(
                    "bucket layout {template} repeats label {label}"
                )));
            }
            pattern.push_str(&regex::escape(&template[last..whole.start()]));
            pattern.push_str(&format!("(?P<{label}>[A-Za-z0-9_]+)"));
            labels.push(label.to_string());
            last = whole.end();
        }
        pattern.push_str(&regex::escape(&template[last..]));
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|err| {
            GateError::Config(format!("bucket layout {template} is invalid: {err}"))
        })?;
        Ok(Self {
            template: template.to_string(),
            labels,
            pattern,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|existing| existing == label)
    }

    /// Label values if `bucket` fits this layout.
    pub fn captures(&self, bucket: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.pattern.captures(bucket)?;
        let mut values = BTreeMap::new();
        for label in &self.labels {
            values.insert(label.clone(), caps.name(label)?.as_str().to_string());
        }
        Some(values)
    }

    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<String, GateError> {
        let mut out = self.template.clone();
        for label in &self.labels {
            let value = values.get(label).ok_or_else(|| {
                GateError::Config(format!(
                    "bucket layout {} needs a value for {label}",
                    self.template
                ))
            })?;
            out = out.replace(&format!("{{{label}}}"), value);
        }
        Ok(out)
    }
}

/// An ingest bucket kind with the capabilities its policy grants.
#[derive(Debug, Clone)]
pub struct SiteBucket {
    pub name: String,
    pub layout: BucketLayout,
    pub policy: String,
    pub capabilities: BTreeSet<Capability>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_standard_layout() {
        let layout = BucketLayout::parse("{project}-{site}-{platform}-{test_flag}").unwrap();
        let values = layout.captures("mscape-birm-ont-prod").unwrap();
        assert_eq!(values["project"], "mscape");
        assert_eq!(values["site"], "birm");
        assert_eq!(values["platform"], "ont");
        assert_eq!(values["test_flag"], "prod");
        assert!(layout.captures("mscape-birm-ont").is_none());
    }

    #[test]
    fn literal_segments_are_escaped() {
        let layout = BucketLayout::parse("{project}.fake-files").unwrap();
        assert!(layout.captures("proj1.fake-files").is_some());
        assert!(layout.captures("proj1xfake-files").is_none());
    }

    #[test]
    fn render_round_trips() {
        let layout = BucketLayout::parse("{project}-{site}-{platform}-{test_flag}").unwrap();
        let values = layout.captures("proj1-site1-illumina-test").unwrap();
        assert_eq!(layout.render(&values).unwrap(), "proj1-site1-illumina-test");
    }

    #[test]
    fn rejects_repeated_label() {
        assert!(BucketLayout::parse("{project}-{project}").is_err());
    }
}
