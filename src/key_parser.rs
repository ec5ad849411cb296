use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{ArtifactKey, FileFormat, FileRole, Platform};
use crate::error::GateError;
use crate::registry::{PathogenSpec, RoleSpec, SpecRegistry};

/// Structured identity recovered from an object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedKey {
    pub pathogen: String,
    pub artifact: ArtifactKey,
    pub role: FileRole,
    pub platform: Platform,
    pub format: FileFormat,
    pub direction: Option<String>,
    /// Every layout segment by name.
    pub fields: BTreeMap<String, String>,
    /// Key with the role suffix stripped.
    pub basename: String,
}

/// Maps object keys onto the layouts declared in the registry. Pure: no I/O,
/// no state beyond the borrowed registry.
#[derive(Debug, Clone, Copy)]
pub struct KeyParser<'a> {
    registry: &'a SpecRegistry,
}

impl<'a> KeyParser<'a> {
    pub fn new(registry: &'a SpecRegistry) -> Self {
        Self { registry }
    }

    /// Parses `object_key` for `pathogen`. The platform usually comes from
    /// the bucket name; without a hint every platform is searched and a tie
    /// on the longest suffix is an error.
    pub fn parse(
        &self,
        object_key: &str,
        pathogen: &str,
        platform_hint: Option<&Platform>,
    ) -> Result<ParsedKey, GateError> {
        let spec = self.registry.lookup(pathogen)?;
        let (platform, role_spec) = match platform_hint {
            Some(platform) => {
                let platform_spec = spec.platform(platform)?;
                let role_spec = longest_suffix(&platform_spec.roles, object_key).ok_or_else(
                    || {
                        GateError::key_format(
                            object_key,
                            format!("no file type declared for platform {platform} matches"),
                        )
                    },
                )?;
                (platform.clone(), role_spec)
            }
            None => search_platforms(spec, object_key)?,
        };
        split_key(spec, &platform, role_spec, object_key)
    }

    /// Renders a parsed identity back into its layout.
    pub fn encode(&self, parsed: &ParsedKey) -> Result<String, GateError> {
        let spec = self.registry.lookup(&parsed.pathogen)?;
        let role_spec = spec
            .role_spec(&parsed.platform, &parsed.role)
            .ok_or_else(|| GateError::UnknownPlatform {
                pathogen: spec.id.clone(),
                platform: parsed.platform.to_string(),
            })?;
        encode_with(spec, role_spec, &parsed.fields)
    }
}

fn longest_suffix<'s>(roles: &'s [RoleSpec], object_key: &str) -> Option<&'s RoleSpec> {
    roles
        .iter()
        .filter(|role| object_key.ends_with(&role.suffix))
        .max_by_key(|role| role.suffix.len())
}

fn search_platforms<'s>(
    spec: &'s PathogenSpec,
    object_key: &str,
) -> Result<(Platform, &'s RoleSpec), GateError> {
    let mut best: Option<(&Platform, &RoleSpec)> = None;
    let mut tied = false;
    for (platform, platform_spec) in &spec.platforms {
        let Some(role) = longest_suffix(&platform_spec.roles, object_key) else {
            continue;
        };
        match best {
            Some((_, current)) if current.suffix.len() > role.suffix.len() => {}
            Some((_, current)) if current.suffix.len() == role.suffix.len() => tied = true,
            _ => {
                best = Some((platform, role));
                tied = false;
            }
        }
    }
    match best {
        Some(_) if tied => Err(GateError::key_format(
            object_key,
            "file type matches more than one platform",
        )),
        Some((platform, role)) => Ok((platform.clone(), role)),
        None => Err(GateError::key_format(
            object_key,
            "no declared file type matches",
        )),
    }
}

fn split_key(
    spec: &PathogenSpec,
    platform: &Platform,
    role_spec: &RoleSpec,
    object_key: &str,
) -> Result<ParsedKey, GateError> {
    let basename = &object_key[..object_key.len() - role_spec.suffix.len()];
    let stem = basename.split(spec.delimiter).collect::<Vec<_>>();
    if stem.len() != role_spec.stem_segments() {
        return Err(GateError::key_format(
            object_key,
            format!(
                "expected {} segments for layout {}, found {}",
                role_spec.layout.len(),
                role_spec.layout.join(&spec.delimiter.to_string()),
                stem.len() + role_spec.suffix_segments
            ),
        ));
    }

    let suffix_body = &role_spec.suffix[spec.delimiter.len_utf8()..];
    let segments = stem
        .into_iter()
        .chain(suffix_body.split(spec.delimiter))
        .collect::<Vec<_>>();
    if let Some(position) = segments.iter().position(|segment| segment.is_empty()) {
        return Err(GateError::key_format(
            object_key,
            format!("segment {} ({}) is empty", position + 1, role_spec.layout[position]),
        ));
    }

    let fields = role_spec
        .layout
        .iter()
        .cloned()
        .zip(segments.into_iter().map(str::to_string))
        .collect::<BTreeMap<_, _>>();
    // Layout validation at load guarantees the identity segments exist.
    let field = |name: &str| fields.get(name).cloned().unwrap_or_default();

    Ok(ParsedKey {
        pathogen: spec.id.clone(),
        artifact: ArtifactKey::new(field("project"), field("run_index"), field("run_id")),
        role: role_spec.role.clone(),
        platform: platform.clone(),
        format: role_spec.format,
        direction: fields.get("direction").cloned(),
        basename: basename.to_string(),
        fields,
    })
}

fn encode_with(
    spec: &PathogenSpec,
    role_spec: &RoleSpec,
    fields: &BTreeMap<String, String>,
) -> Result<String, GateError> {
    let segments = role_spec
        .layout
        .iter()
        .map(|name| {
            fields.get(name).map(String::as_str).ok_or_else(|| {
                GateError::key_format(
                    &role_spec.layout.join("."),
                    format!("no value for segment {name}"),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(segments.join(&spec.delimiter.to_string()))
}
