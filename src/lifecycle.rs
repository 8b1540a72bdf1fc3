//! `LifecycleManager`: the front door. Combines part construction, the
//! `Sequencer`, and the `Executor` behind the public surface a host embeds.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use crate::action::Action;
use crate::errors::{ConfigError, ExecutionError, PlanningError};
use crate::executor::Executor;
use crate::graph::PartGraph;
use crate::part::{validate_dependencies, PartSpec};
use crate::plugin::PluginRegistry;
use crate::project_info::{expand_parts_mapping, ProjectInfo};
use crate::sequencer::{PlanRequest, Sequencer};
use crate::source::PulledAsset;
use crate::state::{StateRecord, StateStore, StepOutcome};
use crate::step::Step;

/// Parse a top-level parts document (`{"parts": {...}}`) from YAML or JSON
/// text into the normalized mapping shape every downstream step expects.
pub fn parse_parts_document(text: &str) -> Result<BTreeMap<String, BTreeMap<String, Value>>, ConfigError> {
    let document: Value = serde_yaml::from_str(text).map_err(|e| ConfigError::MalformedPart {
        part: String::new(),
        message: format!("could not parse parts document: {e}"),
    })?;
    let parts = document
        .get("parts")
        .ok_or(ConfigError::MissingPartsKey)?
        .as_object()
        .ok_or(ConfigError::MissingPartsKey)?;

    let mut out = BTreeMap::new();
    for (name, spec) in parts {
        let mapping = spec.as_object().ok_or_else(|| ConfigError::MalformedPart {
            part: name.clone(),
            message: "part specification must be a mapping".to_string(),
        })?;
        out.insert(name.clone(), mapping.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    }
    Ok(out)
}

pub struct LifecycleManager {
    graph: PartGraph,
    parts_by_name: BTreeMap<String, PartSpec>,
    project_info: ProjectInfo,
    state: StateStore,
}

impl LifecycleManager {
    /// Build the manager from a raw parts document and an already-built
    /// `ProjectInfo`. Construction order mirrors a strict front-loaded
    /// validation pass: application name and overlay coupling are checked
    /// by `ProjectInfo` itself before this runs; here, environment
    /// expansion happens first, then every part is constructed
    /// individually, then cross-part dependency names are validated only
    /// once the full part list exists.
    pub fn new(
        parts_text: &str,
        project_info: ProjectInfo,
        registry: &PluginRegistry,
    ) -> Result<LifecycleManager, ConfigError> {
        let raw_parts = parse_parts_document(parts_text)?;

        let mut parts = Vec::with_capacity(raw_parts.len());
        for (name, raw) in &raw_parts {
            let expanded: BTreeMap<String, Value> = raw
                .iter()
                .map(|(k, v)| (k.clone(), expand_parts_mapping(&project_info, v)))
                .collect();
            parts.push(PartSpec::from_mapping(name, &expanded, registry, project_info.strict_mode)?);
        }
        validate_dependencies(&parts)?;
        if project_info.overlay_base_dir.is_none() && parts.iter().any(PartSpec::has_overlay) {
            return Err(ConfigError::OverlayBaseLayerDirMissing);
        }

        let parts_by_name = parts.iter().map(|p| (p.name.clone(), p.clone())).collect();
        let graph = PartGraph::build(parts)?;
        let state = StateStore::new(project_info.state_dir());

        info!(parts = graph.len(), "lifecycle manager constructed");
        Ok(LifecycleManager {
            graph,
            parts_by_name,
            project_info,
            state,
        })
    }

    pub fn project_info(&self) -> &ProjectInfo {
        &self.project_info
    }

    /// Produce an ordered action list bringing the requested parts (or all
    /// parts) up to `target_step`.
    pub async fn plan(&self, request: PlanRequest) -> Result<Vec<Action>, PlanningError> {
        Sequencer::new(&self.graph, &self.project_info, &self.state).plan(request).await
    }

    /// Re-read every on-disk state record without touching any part spec.
    pub async fn reload_state(&self) -> BTreeMap<(String, Step), StateRecord> {
        Sequencer::new(&self.graph, &self.project_info, &self.state).reload_state().await
    }

    /// Borrow an `Executor` ready to run a plan produced by `plan()`.
    pub fn action_executor(&self) -> Executor<'_> {
        Executor::new(&self.parts_by_name, &self.project_info, &self.state)
    }

    /// Remove state and artifacts for `initial_step` and everything after
    /// it, for the named parts (or every part).
    pub async fn clean(&self, initial_step: Step, part_names: Option<&[String]>) -> Result<(), ExecutionError> {
        self.action_executor().clean(initial_step, part_names).await
    }

    /// The union of build/stage/overlay packages declared across every
    /// part, plus whatever each part's plugin additionally requires for its
    /// chosen properties — what a host would pass to its package manager's
    /// refresh before planning.
    pub fn refresh_packages_list(&self) -> Vec<String> {
        let mut packages: Vec<String> = self
            .parts_by_name
            .values()
            .flat_map(|p| {
                p.build_packages
                    .iter()
                    .chain(p.stage_packages.iter())
                    .chain(p.overlay_packages.iter())
                    .cloned()
                    .chain(p.plugin.build_packages(&p.properties))
            })
            .collect();
        packages.sort();
        packages.dedup();
        packages
    }

    /// The assets recorded for a part's last successful `Pull`, if any.
    pub async fn get_pull_assets(&self, part_name: &str) -> Result<Vec<PulledAsset>, PlanningError> {
        if !self.parts_by_name.contains_key(part_name) {
            return Err(PlanningError::UnknownPart(part_name.to_string()));
        }
        let record = self.state.load(part_name, Step::Pull).await;
        Ok(match record.map(|r| r.outcome) {
            Some(StepOutcome::Pull { assets, .. }) => assets,
            _ => Vec::new(),
        })
    }

    /// The stage packages that survived into the prime tree for a part, if
    /// it has been primed.
    pub async fn get_primed_stage_packages(&self, part_name: &str) -> Result<Vec<String>, PlanningError> {
        if !self.parts_by_name.contains_key(part_name) {
            return Err(PlanningError::UnknownPart(part_name.to_string()));
        }
        let record = self.state.load(part_name, Step::Prime).await;
        Ok(match record.map(|r| r.outcome) {
            Some(StepOutcome::Prime { primed_stage_packages, .. }) => primed_stage_packages,
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts_yaml() -> &'static str {
        r#"
parts:
  hello:
    plugin: nil
"#
    }

    #[test]
    fn missing_parts_key_is_rejected() {
        let registry = PluginRegistry::default();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", "/work").unwrap();
        let err = LifecycleManager::new("{}", info, &registry).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPartsKey));
    }

    #[test]
    fn constructs_from_a_trivial_single_part_document() {
        let registry = PluginRegistry::default();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", "/work").unwrap();
        let manager = LifecycleManager::new(parts_yaml(), info, &registry).unwrap();
        assert_eq!(manager.parts_by_name.len(), 1);
        assert_eq!(manager.refresh_packages_list(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn pull_assets_are_empty_before_any_plan_runs() {
        let registry = PluginRegistry::default();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", "/work").unwrap();
        let manager = LifecycleManager::new(parts_yaml(), info, &registry).unwrap();
        let assets = manager.get_pull_assets("hello").await.unwrap();
        assert!(assets.is_empty());
    }

    #[tokio::test]
    async fn unknown_part_name_is_rejected_by_accessors() {
        let registry = PluginRegistry::default();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", "/work").unwrap();
        let manager = LifecycleManager::new(parts_yaml(), info, &registry).unwrap();
        let err = manager.get_pull_assets("ghost").await.unwrap_err();
        assert!(matches!(err, PlanningError::UnknownPart(_)));
    }
}
