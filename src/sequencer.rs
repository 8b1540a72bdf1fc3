//! The planner: turns the current state of the world into an ordered list
//! of actions that will bring the requested parts up to a target step.

use std::collections::{BTreeMap, HashSet};

use glob::Pattern;
use tracing::{debug, info};

use crate::action::{Action, ActionKind};
use crate::errors::PlanningError;
use crate::fingerprint;
use crate::graph::{PartGraph, PartIndex};
use crate::overlay;
use crate::project_info::ProjectInfo;
use crate::source::handler_for;
use crate::state::{StateStore, StepOutcome};
use crate::step::Step;

/// Builder-style knobs for one `plan()` call.
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub target_step: Option<Step>,
    pub part_names: Option<Vec<String>>,
    pub rerun: bool,
}

impl PlanRequest {
    pub fn new(target_step: Step) -> Self {
        PlanRequest {
            target_step: Some(target_step),
            part_names: None,
            rerun: false,
        }
    }

    pub fn with_parts(mut self, names: Vec<String>) -> Self {
        self.part_names = Some(names);
        self
    }

    pub fn with_rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }
}

pub struct Sequencer<'a> {
    graph: &'a PartGraph,
    project_info: &'a ProjectInfo,
    state: &'a StateStore,
}

impl<'a> Sequencer<'a> {
    pub fn new(graph: &'a PartGraph, project_info: &'a ProjectInfo, state: &'a StateStore) -> Self {
        Sequencer { graph, project_info, state }
    }

    pub async fn plan(&self, request: PlanRequest) -> Result<Vec<Action>, PlanningError> {
        let target_step = request.target_step.unwrap_or(Step::Prime);

        let seeds: Vec<PartIndex> = match &request.part_names {
            None => (0..self.graph.len()).collect(),
            Some(names) => {
                let mut indices = Vec::with_capacity(names.len());
                for name in names {
                    let index = self
                        .graph
                        .index_of(name)
                        .ok_or_else(|| PlanningError::UnknownPart(name.clone()))?;
                    indices.push(index);
                }
                indices
            }
        };
        let requested: HashSet<PartIndex> = seeds.iter().copied().collect();
        let closure = self.graph.closure(&seeds);
        debug!(requested = seeds.len(), closure = closure.len(), "planning closure computed");

        let topo_order = self.graph.topological_order();
        let overlay_hashes = self.compute_overlay_hashes(topo_order);

        let ignore_patterns: Vec<Pattern> = self
            .project_info
            .ignore_outdated
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();

        let project_vars = self.project_info.project_vars.snapshot();
        let mut dirty: HashSet<PartIndex> = HashSet::new();
        let mut actions = Vec::new();

        for step in Step::ALL.into_iter().filter(|s| *s <= target_step) {
            for &index in topo_order {
                if !closure.contains(&index) {
                    continue;
                }
                let part = self.graph.part(index);
                if step == Step::Overlay && !part.has_overlay() {
                    // Parts that don't opt into overlay have nothing to do
                    // at this step at all — not even a Skip.
                    continue;
                }
                let overlay_hash = overlay_hashes.get(&index).map(String::as_str);
                let desired_fingerprint =
                    fingerprint::compute(part, step, overlay_hash, project_vars.clone(), &self.project_info.target_arch);

                let depends_dirty = self
                    .graph
                    .dependencies(index)
                    .iter()
                    .any(|dep| dirty.contains(dep));

                let record = self.state.load(&part.name, step).await;
                let is_seed_rerun = request.rerun && requested.contains(&index);

                let kind = if depends_dirty {
                    if record.is_some() {
                        ActionKind::Rerun
                    } else {
                        ActionKind::Run
                    }
                } else if is_seed_rerun {
                    ActionKind::Rerun
                } else {
                    match &record {
                        None => ActionKind::Run,
                        Some(r) if r.fingerprint == desired_fingerprint => ActionKind::Skip,
                        Some(r) => self
                            .classify_mismatch(part, step, r.outcome.clone(), &ignore_patterns)
                            .await,
                    }
                };

                if !kind.is_skip() {
                    dirty.insert(index);
                }

                info!(part = %part.name, %step, ?kind, "planned action");
                actions.push(Action::new(part.name.clone(), step, kind));
            }
        }

        Ok(actions)
    }

    /// Re-read every on-disk state record. Idempotent; never mutates any
    /// part spec. Exposed so a host can refresh its view of stored state
    /// without re-running `plan()`.
    pub async fn reload_state(&self) -> BTreeMap<(String, Step), crate::state::StateRecord> {
        let mut out = BTreeMap::new();
        for part in self.graph.parts() {
            for step in Step::ALL {
                if let Some(record) = self.state.load(&part.name, step).await {
                    out.insert((part.name.clone(), step), record);
                }
            }
        }
        out
    }

    fn compute_overlay_hashes(&self, topo_order: &[PartIndex]) -> BTreeMap<PartIndex, String> {
        let Some(base_hash) = &self.project_info.overlay_base_hash else {
            return BTreeMap::new();
        };
        let parts_in_order: Vec<_> = topo_order.iter().map(|&i| self.graph.part(i)).collect();
        let hashes = overlay::chain(base_hash, &parts_in_order);
        topo_order.iter().copied().zip(hashes).collect()
    }

    /// A stored fingerprint differs from the desired one. For `Pull`, a
    /// floating source (no pinned tag/commit/checksum) might simply have
    /// moved upstream without anything in the part spec changing; ask the
    /// source handler. Every other step has no such distinction — a
    /// fingerprint mismatch always means something the plugin or its inputs
    /// changed.
    async fn classify_mismatch(
        &self,
        part: &crate::part::PartSpec,
        step: Step,
        previous_outcome: StepOutcome,
        ignore_patterns: &[Pattern],
    ) -> ActionKind {
        if step != Step::Pull {
            return ActionKind::Rerun;
        }
        let Some(source) = &part.source else {
            return ActionKind::Rerun;
        };
        let StepOutcome::Pull { assets, .. } = previous_outcome else {
            return ActionKind::Rerun;
        };
        let Some(previous_asset) = assets.into_iter().next() else {
            return ActionKind::Rerun;
        };

        let covered_by_ignore = ignore_patterns.iter().any(|p| p.matches(&part.name));
        let handler = handler_for(source.kind);
        let outdated = handler.check_if_outdated(source, &previous_asset).await.unwrap_or(true);

        if !outdated {
            return ActionKind::Rerun;
        }
        if covered_by_ignore {
            return ActionKind::SkipOutdated;
        }
        match source.kind {
            crate::source::SourceKind::Deb => ActionKind::Rerun,
            _ => ActionKind::Update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartSpec;
    use crate::plugin::PluginRegistry;
    use serde_json::{json, Value};
    use std::collections::BTreeMap as Map;

    fn nil_part(name: &str, after: &[&str]) -> PartSpec {
        let registry = PluginRegistry::default();
        let mut raw: Map<String, Value> = Map::new();
        raw.insert("plugin".to_string(), json!("nil"));
        if !after.is_empty() {
            raw.insert("after".to_string(), json!(after));
        }
        PartSpec::from_mapping(name, &raw, &registry, false).unwrap()
    }

    fn project_info() -> ProjectInfo {
        ProjectInfo::new("demo_app", "demo", "/cache", "/work").unwrap()
    }

    #[tokio::test]
    async fn fresh_project_plans_run_for_every_step() {
        let graph = PartGraph::build(vec![nil_part("hello", &[])]).unwrap();
        let info = project_info();
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        let sequencer = Sequencer::new(&graph, &info, &state);

        let actions = sequencer.plan(PlanRequest::new(Step::Prime)).await.unwrap();
        // Overlay is omitted entirely: "hello" never opts into it.
        assert_eq!(actions.len(), 4);
        assert!(actions.iter().all(|a| a.kind == ActionKind::Run));
    }

    #[tokio::test]
    async fn unknown_requested_part_fails_planning() {
        let graph = PartGraph::build(vec![nil_part("hello", &[])]).unwrap();
        let info = project_info();
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        let sequencer = Sequencer::new(&graph, &info, &state);

        let err = sequencer
            .plan(PlanRequest::new(Step::Prime).with_parts(vec!["ghost".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanningError::UnknownPart(_)));
    }

    #[tokio::test]
    async fn matching_fingerprint_skips() {
        let graph = PartGraph::build(vec![nil_part("hello", &[])]).unwrap();
        let info = project_info();
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());

        let part = graph.part(0);
        let fp = fingerprint::compute(part, Step::Pull, None, Map::new(), &info.target_arch);
        let record = crate::state::StateRecord::new(
            fp,
            StepOutcome::Pull {
                assets: vec![],
                stage_packages_manifest: vec![],
            },
            chrono::Utc::now(),
        );
        state.save("hello", Step::Pull, &record).await.unwrap();

        let sequencer = Sequencer::new(&graph, &info, &state);
        let actions = sequencer.plan(PlanRequest::new(Step::Pull)).await.unwrap();
        assert_eq!(actions[0].kind, ActionKind::Skip);
    }

    #[tokio::test]
    async fn dependency_rerun_forces_dependent_rerun() {
        let graph = PartGraph::build(vec![nil_part("a", &[]), nil_part("b", &["a"])]).unwrap();
        let info = project_info();
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path());
        let sequencer = Sequencer::new(&graph, &info, &state);

        // Nothing persisted: both should Run, and dependency ordering keeps
        // "a" before "b" at every step.
        let actions = sequencer.plan(PlanRequest::new(Step::Build)).await.unwrap();
        let pull_actions: Vec<_> = actions.iter().filter(|a| a.step == Step::Pull).collect();
        assert_eq!(pull_actions[0].part_name, "a");
        assert_eq!(pull_actions[1].part_name, "b");
    }
}
