//! `PartSpec` construction: turning one entry of a raw parts mapping into a
//! validated, plugin-resolved part.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::errors::ConfigError;
use crate::plugin::{Plugin, PluginProperties, PluginRegistry};
use crate::source::SourceSpec;

/// One part, fully resolved: plugin chosen, properties validated, source
/// parsed, dependencies checked against the rest of the project. Immutable
/// once built — plans and fingerprints key off its fields directly.
#[derive(Clone)]
pub struct PartSpec {
    pub name: String,
    pub plugin_name: String,
    pub plugin: std::sync::Arc<dyn Plugin>,
    pub properties: PluginProperties,
    pub source: Option<SourceSpec>,
    pub after: Vec<String>,
    pub stage_packages: Vec<String>,
    pub build_packages: Vec<String>,
    pub build_snaps: Vec<String>,
    pub overlay_packages: Vec<String>,
    pub overlay_script: Option<String>,
    pub overlay_files_selector: Vec<String>,
    pub stage: Vec<String>,
    pub prime: Vec<String>,
    pub organize: BTreeMap<String, String>,
    pub override_pull: Option<String>,
    pub override_build: Option<String>,
    pub override_stage: Option<String>,
    pub override_prime: Option<String>,
}

impl std::fmt::Debug for PartSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartSpec")
            .field("name", &self.name)
            .field("plugin_name", &self.plugin_name)
            .field("properties", &self.properties)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

/// Fields read directly off the raw mapping before anything is handed to the
/// plugin. Keys with the `<plugin>-` prefix stay with the plugin instead.
const GENERIC_KEYS: &[&str] = &[
    "plugin",
    "source",
    "source-type",
    "source-tag",
    "source-commit",
    "source-branch",
    "source-depth",
    "source-submodules",
    "source-checksum",
    "source-subdir",
    "after",
    "stage-packages",
    "build-packages",
    "build-snaps",
    "overlay-packages",
    "overlay-script",
    "overlay-files",
    "stage",
    "prime",
    "organize",
    "override-pull",
    "override-build",
    "override-stage",
    "override-prime",
];

impl PartSpec {
    /// Build one part from its raw YAML/JSON mapping.
    ///
    /// 1. If the mapping lacks an explicit `plugin` key, the plugin name
    ///    equals the part name.
    /// 2. Look up the plugin; unknown names fail with `UndefinedPlugin`.
    /// 3. If strict mode is on and the plugin doesn't support it, fail with
    ///    `PluginNotStrict`.
    /// 4. Validate and parse the plugin-specific properties (keys not in
    ///    `GENERIC_KEYS`).
    /// 5. Parse the generic fields.
    ///
    /// Dependency names are validated afterward, once every part in the
    /// project has been constructed — a part can't check its `after` list
    /// against parts that don't exist yet during its own construction.
    pub fn from_mapping(
        name: &str,
        raw: &BTreeMap<String, Value>,
        registry: &PluginRegistry,
        strict_mode: bool,
    ) -> Result<PartSpec, ConfigError> {
        validate_part_name(name)?;

        let plugin_name = match raw.get("plugin") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(ConfigError::MalformedPart {
                    part: name.to_string(),
                    message: format!("'plugin' must be a string, got {other}"),
                })
            }
            None => name.to_string(),
        };

        let plugin = registry.get(&plugin_name).ok_or_else(|| ConfigError::UndefinedPlugin {
            part: name.to_string(),
        })?;

        if strict_mode && !plugin.supports_strict_mode() {
            return Err(ConfigError::PluginNotStrict {
                part: name.to_string(),
                plugin: plugin_name.clone(),
            });
        }

        let plugin_raw: BTreeMap<String, Value> = raw
            .iter()
            .filter(|(k, _)| !GENERIC_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (strip_plugin_prefix(&plugin_name, k), v.clone()))
            .collect();
        let properties = plugin
            .parse_properties(&plugin_raw)
            .map_err(|e| reattach_part_name(e, name))?;

        let source = parse_source(name, raw)?;
        let after = string_list_field(raw, "after");
        let stage_packages = string_list_field(raw, "stage-packages");
        let build_packages = string_list_field(raw, "build-packages");
        let build_snaps = string_list_field(raw, "build-snaps");
        let overlay_packages = string_list_field(raw, "overlay-packages");
        let overlay_script = raw.get("overlay-script").and_then(Value::as_str).map(str::to_string);
        let overlay_files_selector = string_list_field(raw, "overlay-files");
        let stage = string_list_field(raw, "stage");
        let prime = string_list_field(raw, "prime");
        let override_pull = raw.get("override-pull").and_then(Value::as_str).map(str::to_string);
        let override_build = raw.get("override-build").and_then(Value::as_str).map(str::to_string);
        let override_stage = raw.get("override-stage").and_then(Value::as_str).map(str::to_string);
        let override_prime = raw.get("override-prime").and_then(Value::as_str).map(str::to_string);
        let organize = raw
            .get("organize")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(PartSpec {
            name: name.to_string(),
            plugin_name,
            plugin,
            properties,
            source,
            after,
            stage_packages,
            build_packages,
            build_snaps,
            overlay_packages,
            overlay_script,
            overlay_files_selector,
            stage,
            prime,
            organize,
            override_pull,
            override_build,
            override_stage,
            override_prime,
        })
    }

    pub fn has_overlay(&self) -> bool {
        self.overlay_script.is_some() || !self.overlay_packages.is_empty()
    }
}

/// Validate every part's `after` list against the full set of part names,
/// once all parts exist. Called once per project, after every `PartSpec`
/// has been built individually.
pub fn validate_dependencies(parts: &[PartSpec]) -> Result<(), ConfigError> {
    let names: BTreeSet<&str> = parts.iter().map(|p| p.name.as_str()).collect();
    for part in parts {
        for dep in &part.after {
            if !names.contains(dep.as_str()) {
                return Err(ConfigError::InvalidPartName {
                    part: part.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_part_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::MalformedPart {
            part: name.to_string(),
            message: "part names must be lowercase alphanumeric with internal hyphens only".to_string(),
        })
    }
}

fn strip_plugin_prefix(plugin_name: &str, key: &str) -> String {
    let prefix = format!("{plugin_name}-");
    key.strip_prefix(&prefix).unwrap_or(key).to_string()
}

fn reattach_part_name(err: ConfigError, part: &str) -> ConfigError {
    match err {
        ConfigError::PartSpecificationError { errors, .. } => ConfigError::PartSpecificationError {
            part: part.to_string(),
            errors,
        },
        other => other,
    }
}

fn string_list_field(raw: &BTreeMap<String, Value>, key: &str) -> Vec<String> {
    raw.get(key)
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_source(name: &str, raw: &BTreeMap<String, Value>) -> Result<Option<SourceSpec>, ConfigError> {
    let uri = match raw.get("source").and_then(Value::as_str) {
        Some(uri) => uri,
        None => return Ok(None),
    };

    let mut spec = SourceSpec::new(uri);
    if let Some(kind) = raw.get("source-type").and_then(Value::as_str) {
        spec = spec.with_kind(match kind {
            "local" => crate::source::SourceKind::Local,
            "tar" => crate::source::SourceKind::Tarball,
            "git" => crate::source::SourceKind::Git,
            "deb" => crate::source::SourceKind::Deb,
            other => {
                return Err(ConfigError::MalformedPart {
                    part: name.to_string(),
                    message: format!("unknown source-type '{other}'"),
                })
            }
        });
    }
    if let Some(tag) = raw.get("source-tag").and_then(Value::as_str) {
        spec = spec.with_tag(tag);
    }
    if let Some(commit) = raw.get("source-commit").and_then(Value::as_str) {
        spec = spec.with_commit(commit);
    }
    if let Some(branch) = raw.get("source-branch").and_then(Value::as_str) {
        spec = spec.with_branch(branch);
    }
    if let Some(depth) = raw.get("source-depth").and_then(Value::as_u64) {
        spec = spec.with_depth(depth as u32);
    }
    if let Some(checksum) = raw.get("source-checksum").and_then(Value::as_str) {
        spec = spec.with_checksum(checksum);
    }
    if let Some(subdir) = raw.get("source-subdir").and_then(Value::as_str) {
        spec.subdir = Some(subdir.to_string());
    }
    spec.submodules = raw
        .get("source-submodules")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    spec.validate().map_err(|e| match e {
        ConfigError::InvalidSourceOption { source_type, option } => ConfigError::InvalidSourceOption {
            source_type,
            option,
        },
        other => other,
    })?;

    Ok(Some(spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn plugin_name_defaults_to_part_name() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[("source", json!("/srv/hello"))]);
        let part = PartSpec::from_mapping("dump", &raw, &registry, false).unwrap();
        assert_eq!(part.plugin_name, "dump");
    }

    #[test]
    fn part_names_reject_uppercase_underscore_and_trailing_hyphen() {
        let registry = PluginRegistry::default();
        for bad in ["Foo", "foo_bar", "foo-", "-foo"] {
            let raw = mapping(&[("plugin", json!("nil"))]);
            let err = PartSpec::from_mapping(bad, &raw, &registry, false).unwrap_err();
            assert!(matches!(err, ConfigError::MalformedPart { .. }), "{bad} should be rejected");
        }
    }

    #[test]
    fn part_names_accept_lowercase_alphanumeric_with_internal_hyphens() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[("plugin", json!("nil"))]);
        let part = PartSpec::from_mapping("my-part-2", &raw, &registry, false).unwrap();
        assert_eq!(part.name, "my-part-2");
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[("plugin", json!("ghost-plugin"))]);
        let err = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedPlugin { .. }));
    }

    #[test]
    fn deb_source_options_are_rejected_at_construction() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[
            ("plugin", json!("nil")),
            ("source", json!("pkg.deb")),
            ("source-type", json!("deb")),
            ("source-branch", json!("main")),
        ]);
        let err = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap_err();
        match err {
            ConfigError::InvalidSourceOption { source_type, option } => {
                assert_eq!(source_type, "deb");
                assert_eq!(option, "source-branch");
            }
            other => panic!("expected InvalidSourceOption, got {other:?}"),
        }
    }

    #[test]
    fn dependencies_validated_against_whole_project() {
        let registry = PluginRegistry::default();
        let a = PartSpec::from_mapping("a", &mapping(&[("plugin", json!("nil"))]), &registry, false).unwrap();
        let b = PartSpec::from_mapping(
            "b",
            &mapping(&[("plugin", json!("nil")), ("after", json!(["ghost"]))]),
            &registry,
            false,
        )
        .unwrap();
        let err = validate_dependencies(&[a, b]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPartName { .. }));
    }

    #[test]
    fn build_snaps_and_override_scripts_are_recognized_generic_fields() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[
            ("plugin", json!("nil")),
            ("build-snaps", json!(["core22"])),
            ("override-pull", json!("craftctl default")),
            ("override-build", json!("make && craftctl default")),
            ("override-stage", json!("craftctl default")),
            ("override-prime", json!("craftctl default")),
        ]);
        let part = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap();
        assert_eq!(part.build_snaps, vec!["core22".to_string()]);
        assert_eq!(part.override_pull.as_deref(), Some("craftctl default"));
        assert_eq!(part.override_build.as_deref(), Some("make && craftctl default"));
        assert_eq!(part.override_stage.as_deref(), Some("craftctl default"));
        assert_eq!(part.override_prime.as_deref(), Some("craftctl default"));
    }

    #[test]
    fn overlay_files_selector_is_parsed_as_a_generic_field() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[
            ("plugin", json!("nil")),
            ("overlay-script", json!("echo hi")),
            ("overlay-files", json!(["etc/*", "-usr/share/doc"])),
        ]);
        let part = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap();
        assert_eq!(
            part.overlay_files_selector,
            vec!["etc/*".to_string(), "-usr/share/doc".to_string()]
        );
    }

    #[test]
    fn make_plugin_unknown_property_carries_part_name() {
        let registry = PluginRegistry::default();
        let raw = mapping(&[("plugin", json!("make")), ("make-bogus", json!(true))]);
        let err = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap_err();
        match err {
            ConfigError::PartSpecificationError { part, .. } => assert_eq!(part, "hello"),
            other => panic!("expected PartSpecificationError, got {other:?}"),
        }
    }
}
