//! Fingerprints: a canonical digest of everything that determines whether a
//! part's step needs to rerun. Two fingerprints are equal iff, as far as the
//! Sequencer can tell, rerunning the step would produce the same outcome.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::part::PartSpec;
use crate::step::Step;

/// The canonical, order-independent inputs that feed one (part, step)
/// fingerprint. Serialized through a `BTreeMap` so key order never leaks
/// into the hash.
#[derive(Serialize)]
struct FingerprintInputs<'a> {
    plugin_name: &'a str,
    plugin_properties: &'a BTreeMap<String, Value>,
    source: Option<&'a crate::source::SourceSpec>,
    stage_packages: &'a [String],
    build_packages: &'a [String],
    build_snaps: &'a [String],
    overlay_packages: &'a [String],
    overlay_script: Option<&'a str>,
    overlay_files_selector: &'a [String],
    override_pull: Option<&'a str>,
    override_build: Option<&'a str>,
    override_stage: Option<&'a str>,
    override_prime: Option<&'a str>,
    project_vars: BTreeMap<String, String>,
    overlay_hash: Option<&'a str>,
    host_arch: &'a str,
}

/// Compute the fingerprint for `part` at `step`, given the overlay hash in
/// effect (only meaningful from `Step::Overlay` onward) and a snapshot of
/// readable project variables.
pub fn compute(
    part: &PartSpec,
    step: Step,
    overlay_hash: Option<&str>,
    project_vars: BTreeMap<String, String>,
    host_arch: &str,
) -> String {
    let inputs = FingerprintInputs {
        plugin_name: &part.plugin_name,
        plugin_properties: &part.properties,
        source: part.source.as_ref(),
        stage_packages: &part.stage_packages,
        build_packages: &part.build_packages,
        build_snaps: &part.build_snaps,
        overlay_packages: &part.overlay_packages,
        overlay_script: part.overlay_script.as_deref(),
        overlay_files_selector: &part.overlay_files_selector,
        override_pull: part.override_pull.as_deref(),
        override_build: part.override_build.as_deref(),
        override_stage: part.override_stage.as_deref(),
        override_prime: part.override_prime.as_deref(),
        project_vars,
        overlay_hash: if step.reads_overlay_hash() { overlay_hash } else { None },
        host_arch,
    };
    // Route through serde_json::Value so the hash input is a canonical,
    // deterministically-ordered byte string regardless of struct field
    // declaration order.
    let canonical: Value = serde_json::to_value(&inputs).expect("fingerprint inputs are always serializable");
    let canonical_bytes = serde_json::to_vec(&canonical).expect("canonical value always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&canonical_bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginRegistry;
    use std::collections::BTreeMap as Map;

    fn nil_part(name: &str) -> PartSpec {
        let registry = PluginRegistry::default();
        let raw: Map<String, Value> = Map::from([("plugin".to_string(), Value::String("nil".to_string()))]);
        PartSpec::from_mapping(name, &raw, &registry, false).unwrap()
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let part = nil_part("hello");
        let a = compute(&part, Step::Build, None, Map::new(), "amd64");
        let b = compute(&part, Step::Build, None, Map::new(), "amd64");
        assert_eq!(a, b);
    }

    #[test]
    fn overlay_hash_only_affects_steps_from_overlay_onward() {
        let part = nil_part("hello");
        let with_hash = compute(&part, Step::Pull, Some("abc"), Map::new(), "amd64");
        let without_hash = compute(&part, Step::Pull, None, Map::new(), "amd64");
        assert_eq!(with_hash, without_hash, "Pull never reads the overlay hash");

        let with_hash = compute(&part, Step::Build, Some("abc"), Map::new(), "amd64");
        let without_hash = compute(&part, Step::Build, None, Map::new(), "amd64");
        assert_ne!(with_hash, without_hash, "Build reads the overlay hash");
    }

    #[test]
    fn overlay_files_selector_affects_the_fingerprint() {
        let registry = PluginRegistry::default();
        let raw_a: Map<String, Value> = Map::from([
            ("plugin".to_string(), Value::String("nil".to_string())),
            ("overlay-script".to_string(), Value::String("echo hi".to_string())),
            ("overlay-files".to_string(), serde_json::json!(["etc/*"])),
        ]);
        let raw_b: Map<String, Value> = Map::from([
            ("plugin".to_string(), Value::String("nil".to_string())),
            ("overlay-script".to_string(), Value::String("echo hi".to_string())),
            ("overlay-files".to_string(), serde_json::json!(["usr/*"])),
        ]);
        let a = PartSpec::from_mapping("hello", &raw_a, &registry, false).unwrap();
        let b = PartSpec::from_mapping("hello", &raw_b, &registry, false).unwrap();
        let fp_a = compute(&a, Step::Overlay, Some("abc"), Map::new(), "amd64");
        let fp_b = compute(&b, Step::Overlay, Some("abc"), Map::new(), "amd64");
        assert_ne!(fp_a, fp_b);
    }

    #[test]
    fn different_architectures_produce_different_fingerprints() {
        let part = nil_part("hello");
        let a = compute(&part, Step::Build, None, Map::new(), "amd64");
        let b = compute(&part, Step::Build, None, Map::new(), "arm64");
        assert_ne!(a, b);
    }
}
