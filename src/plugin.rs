//! Plugins translate a part's declared properties into the build commands,
//! build packages and build environment the executor runs at the `Build`
//! step. A plugin is resolved once, at part-construction time, and is
//! immutable for the life of the part.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::errors::ConfigError;

/// A validated, parsed set of plugin-specific properties. Kept as a JSON
/// value rather than a typed struct per plugin so the registry can stay
/// generic; individual plugins interpret their own slice of it.
pub type PluginProperties = BTreeMap<String, Value>;

/// The build-time contribution of a resolved plugin.
pub trait Plugin: Send + Sync {
    /// Stable identifier, e.g. `"make"`, `"dump"`, `"nil"`.
    fn name(&self) -> &'static str;

    /// Whether this plugin supports running under strict mode. Strict mode
    /// forbids plugins that need host tools beyond the declared build
    /// packages/snaps.
    fn supports_strict_mode(&self) -> bool {
        true
    }

    /// Validate and normalize the part's plugin-specific property mapping.
    /// Unknown keys are rejected here, not silently ignored.
    fn parse_properties(&self, raw: &BTreeMap<String, Value>) -> Result<PluginProperties, ConfigError>;

    /// Extra packages the host must install before building this part.
    fn build_packages(&self, _properties: &PluginProperties) -> Vec<String> {
        Vec::new()
    }

    /// Extra snaps the host must install before building this part.
    fn build_snaps(&self, _properties: &PluginProperties) -> Vec<String> {
        Vec::new()
    }

    /// Environment variables exported for the duration of the build.
    fn build_environment(&self, _properties: &PluginProperties) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Shell commands run, in order, inside the build environment.
    fn build_commands(&self, properties: &PluginProperties) -> Vec<String>;

    /// Whether the commands returned by `build_commands` have no ordering
    /// dependency on one another and may be fanned out across worker
    /// processes. Most plugins emit a strictly sequential script (configure,
    /// then build, then install) and must leave this `false`.
    fn commands_are_independent(&self) -> bool {
        false
    }
}

/// A plugin that does nothing at build time: it exists purely so a part can
/// be a dependency anchor or carry only a source/overlay contribution.
pub struct NilPlugin;

impl Plugin for NilPlugin {
    fn name(&self) -> &'static str {
        "nil"
    }

    fn parse_properties(&self, raw: &BTreeMap<String, Value>) -> Result<PluginProperties, ConfigError> {
        reject_unknown_keys("nil", raw, &[])?;
        Ok(BTreeMap::new())
    }

    fn build_commands(&self, _properties: &PluginProperties) -> Vec<String> {
        Vec::new()
    }
}

/// Copies `source` files verbatim into the install directory. No build
/// step beyond the copy; used for prebuilt assets and fixtures.
pub struct DumpPlugin;

impl Plugin for DumpPlugin {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn parse_properties(&self, raw: &BTreeMap<String, Value>) -> Result<PluginProperties, ConfigError> {
        reject_unknown_keys("dump", raw, &[])?;
        Ok(BTreeMap::new())
    }

    fn build_commands(&self, _properties: &PluginProperties) -> Vec<String> {
        vec!["cp -a . \"${CRAFT_PART_INSTALL}\"".to_string()]
    }
}

/// Runs a plain `make` / `make install` against the source tree, optionally
/// overridden with custom invocations and parameters.
pub struct MakePlugin;

impl Plugin for MakePlugin {
    fn name(&self) -> &'static str {
        "make"
    }

    fn parse_properties(&self, raw: &BTreeMap<String, Value>) -> Result<PluginProperties, ConfigError> {
        reject_unknown_keys("make", raw, &["make-parameters", "make-install-parameters"])?;
        Ok(raw.clone())
    }

    fn build_environment(&self, _properties: &PluginProperties) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn build_commands(&self, properties: &PluginProperties) -> Vec<String> {
        let make_params = string_list(properties, "make-parameters");
        let install_params = string_list(properties, "make-install-parameters");
        vec![
            format!("make {}", make_params.join(" ")).trim_end().to_string(),
            format!(
                "make install DESTDIR=\"${{CRAFT_PART_INSTALL}}\" {}",
                install_params.join(" ")
            )
            .trim_end()
            .to_string(),
        ]
    }
}

fn string_list(properties: &PluginProperties, key: &str) -> Vec<String> {
    properties
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn reject_unknown_keys(
    plugin: &str,
    raw: &BTreeMap<String, Value>,
    allowed: &[&str],
) -> Result<(), ConfigError> {
    let unknown: Vec<String> = raw
        .keys()
        .filter(|k| !allowed.contains(&k.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::PartSpecificationError {
            part: String::new(),
            errors: unknown
                .into_iter()
                .map(|k| format!("unrecognized property '{plugin}-{k}' for plugin '{plugin}'"))
                .collect(),
        })
    }
}

/// Looks up plugins by name. Populated with the built-in set at
/// construction; hosts that need more can register additional entries.
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        let mut registry = PluginRegistry {
            plugins: HashMap::new(),
        };
        registry.register(Arc::new(NilPlugin));
        registry.register(Arc::new(DumpPlugin));
        registry.register(Arc::new(MakePlugin));
        registry
    }
}

impl PluginRegistry {
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_built_in_plugins() {
        let registry = PluginRegistry::default();
        assert!(registry.get("nil").is_some());
        assert!(registry.get("dump").is_some());
        assert!(registry.get("make").is_some());
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn make_plugin_rejects_unknown_property() {
        let plugin = MakePlugin;
        let mut raw = BTreeMap::new();
        raw.insert("make-bogus".to_string(), Value::Bool(true));
        let err = plugin.parse_properties(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::PartSpecificationError { .. }));
    }

    #[test]
    fn make_plugin_builds_commands_with_parameters() {
        let plugin = MakePlugin;
        let mut raw = BTreeMap::new();
        raw.insert(
            "make-parameters".to_string(),
            Value::Array(vec![Value::String("-j4".to_string())]),
        );
        let properties = plugin.parse_properties(&raw).unwrap();
        let commands = plugin.build_commands(&properties);
        assert_eq!(commands[0], "make -j4");
    }

    #[test]
    fn dump_plugin_has_no_properties() {
        let plugin = DumpPlugin;
        assert!(plugin.parse_properties(&BTreeMap::new()).is_ok());
        assert_eq!(plugin.build_commands(&BTreeMap::new()).len(), 1);
    }
}
