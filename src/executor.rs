//! Runs planned actions against real work directories: fetching sources,
//! mounting overlays, invoking plugin build scripts, and staging/priming
//! the results.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::{Action, ActionKind};
use crate::errors::ExecutionError;
use crate::fingerprint;
use crate::overlay::{CopyOverlayMounter, OverlayMounter};
use crate::part::PartSpec;
use crate::project_info::ProjectInfo;
use crate::source::handler_for;
use crate::state::{StateRecord, StateStore, StepOutcome};
use crate::step::Step;

/// A scoped handle bracketing one `execute()` call: ensures work directories
/// exist and overlay mounts/extra packages are installed on entry, and
/// unmounts/releases on exit along every path — success, failure, or
/// cancellation. The fallible teardown is exposed as `finish()`; `Drop`
/// covers the case a caller forgets to call it.
pub struct ExecutionContext<'a> {
    project_info: &'a ProjectInfo,
    mounter: Arc<dyn OverlayMounter>,
    mounted: bool,
    pub cancellation: CancellationToken,
    /// Extra snaps resolved for this run: `project_info.extra_build_snaps`
    /// plus an injected `chisel/latest/stable` when some part declares a
    /// package slice and chisel wasn't already listed.
    pub resolved_build_snaps: Vec<String>,
}

impl<'a> ExecutionContext<'a> {
    pub async fn enter(
        project_info: &'a ProjectInfo,
        mounter: Arc<dyn OverlayMounter>,
        parts: &BTreeMap<String, PartSpec>,
    ) -> Result<Self, ExecutionError> {
        tokio::fs::create_dir_all(project_info.parts_dir())
            .await
            .map_err(|e| other(e))?;
        for partition in &project_info.partitions {
            tokio::fs::create_dir_all(project_info.stage_partition_dir(partition.as_str()))
                .await
                .map_err(other)?;
            tokio::fs::create_dir_all(project_info.prime_partition_dir(partition.as_str()))
                .await
                .map_err(other)?;
        }

        let mut mounted = false;
        if let Some(base_dir) = &project_info.overlay_base_dir {
            mounter
                .mount(&[base_dir.clone()], &project_info.overlay_dir(), &project_info.overlay_dir())
                .await
                .map_err(|e| ExecutionError::Other(e.into()))?;
            mounted = true;
        }

        let mut resolved_build_snaps = project_info.extra_build_snaps.clone();
        for part in parts.values() {
            resolved_build_snaps.extend(part.build_snaps.iter().cloned());
            resolved_build_snaps.extend(part.plugin.build_snaps(&part.properties));
        }
        resolved_build_snaps.sort();
        resolved_build_snaps.dedup();
        let declares_slices = parts
            .values()
            .flat_map(|p| p.stage_packages.iter().chain(p.build_packages.iter()))
            .any(|pkg| pkg.contains('_'));
        if declares_slices && !resolved_build_snaps.iter().any(|s| s.starts_with("chisel")) {
            resolved_build_snaps.push("chisel/latest/stable".to_string());
        }
        info!(
            extra_build_packages = project_info.extra_build_packages.len(),
            build_snaps = resolved_build_snaps.len(),
            "execution context entered"
        );

        Ok(ExecutionContext {
            project_info,
            mounter,
            mounted,
            cancellation: CancellationToken::new(),
            resolved_build_snaps,
        })
    }

    /// Fallible teardown: unmount overlays, release locks. Always safe to
    /// call more than once.
    pub async fn finish(mut self) -> Result<(), ExecutionError> {
        self.teardown().await
    }

    async fn teardown(&mut self) -> Result<(), ExecutionError> {
        if self.mounted {
            self.mounter
                .unmount(&self.project_info.overlay_dir())
                .await
                .map_err(|e| ExecutionError::Other(e.into()))?;
            self.mounted = false;
        }
        Ok(())
    }
}

impl Drop for ExecutionContext<'_> {
    fn drop(&mut self) {
        if self.mounted {
            warn!("ExecutionContext dropped without finish(); overlay mount may remain");
        }
    }
}

fn other(e: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Other(anyhow::anyhow!(e.to_string()))
}

/// Runs actions and performs cleans against a project's parts, using the
/// resolved part list, project info, and state store.
pub struct Executor<'a> {
    parts: &'a BTreeMap<String, PartSpec>,
    project_info: &'a ProjectInfo,
    state: &'a StateStore,
    mounter: Arc<dyn OverlayMounter>,
}

impl<'a> Executor<'a> {
    pub fn new(parts: &'a BTreeMap<String, PartSpec>, project_info: &'a ProjectInfo, state: &'a StateStore) -> Self {
        Executor {
            parts,
            project_info,
            state,
            mounter: Arc::new(CopyOverlayMounter),
        }
    }

    pub fn with_mounter(mut self, mounter: Arc<dyn OverlayMounter>) -> Self {
        self.mounter = mounter;
        self
    }

    /// Run a full action list in order. Every action's preconditions are
    /// guaranteed satisfied by the actions before it, because the sequencer
    /// produced this order.
    pub async fn execute(&self, actions: &[Action]) -> Result<(), ExecutionError> {
        let context = ExecutionContext::enter(self.project_info, self.mounter.clone(), self.parts).await?;
        let result = self.execute_inner(actions, &context).await;
        context.finish().await?;
        result
    }

    async fn execute_inner(&self, actions: &[Action], context: &ExecutionContext<'_>) -> Result<(), ExecutionError> {
        for action in actions {
            if context.cancellation.is_cancelled() {
                return Err(ExecutionError::Cancelled {
                    part: action.part_name.clone(),
                    step: action.step,
                });
            }
            self.execute_one(action, context).await?;
        }
        Ok(())
    }

    async fn execute_one(&self, action: &Action, context: &ExecutionContext<'_>) -> Result<(), ExecutionError> {
        if action.kind.is_skip() {
            return Ok(());
        }

        let part = self
            .parts
            .get(&action.part_name)
            .expect("sequencer only plans actions for known parts");

        if action.kind == ActionKind::Rerun {
            self.remove_artifacts_from(part, action.step).await?;
            self.state.remove_from(&part.name, action.step).await?;
        }

        let outcome = match action.step {
            Step::Pull => self.run_pull(part).await?,
            Step::Overlay => self.run_overlay(part, context).await?,
            Step::Build => self.run_build(part).await?,
            Step::Stage => self.run_stage(part).await?,
            Step::Prime => self.run_prime(part).await?,
        };

        let overlay_hash = None; // recomputed by the sequencer on the next plan(), not tracked here.
        let fingerprint = fingerprint::compute(
            part,
            action.step,
            overlay_hash,
            self.project_info.project_vars.snapshot(),
            &self.project_info.target_arch,
        );
        let record = StateRecord::new(fingerprint, outcome, chrono::Utc::now());
        self.state.save(&part.name, action.step, &record).await?;
        info!(part = %part.name, step = %action.step, "action completed");
        Ok(())
    }

    async fn run_pull(&self, part: &PartSpec) -> Result<StepOutcome, ExecutionError> {
        let dirs = self.project_info.part_dirs(&part.name);
        let mut assets = Vec::new();
        if let Some(source) = &part.source {
            let handler = handler_for(source.kind);
            let mut joinset: JoinSet<Result<crate::source::PulledAsset, ExecutionError>> = JoinSet::new();
            let source = source.clone();
            let dest = dirs.src.clone();
            joinset.spawn(async move { handler.pull(&source, &dest).await });
            while let Some(result) = joinset.join_next().await {
                let asset = result.map_err(|e| other(e))??;
                assets.push(asset);
            }
        }
        Ok(StepOutcome::Pull {
            assets,
            stage_packages_manifest: part.stage_packages.clone(),
        })
    }

    async fn run_overlay(&self, part: &PartSpec, _context: &ExecutionContext<'_>) -> Result<StepOutcome, ExecutionError> {
        let hash = if let Some(script) = &part.overlay_script {
            format!("{:x}", md5_like_digest(script))
        } else {
            String::new()
        };
        Ok(StepOutcome::Overlay {
            hash,
            manifest: part.overlay_packages.clone(),
        })
    }

    async fn run_build(&self, part: &PartSpec) -> Result<StepOutcome, ExecutionError> {
        let dirs = self.project_info.part_dirs(&part.name);
        tokio::fs::create_dir_all(&dirs.build).await.map_err(other)?;
        tokio::fs::create_dir_all(&dirs.install).await.map_err(other)?;

        // Pulled sources land in `src`; the plugin's build commands run
        // against a populated `build` dir, the way craft-parts primes the
        // build tree from the pulled source before invoking the plugin.
        if dirs.src.exists() {
            copy_filtered(&dirs.src, &dirs.build, &[], part, Step::Build).await?;
        }

        let commands = part.plugin.build_commands(&part.properties);
        let env = part.plugin.build_environment(&part.properties);
        self.run_build_commands(part, &commands, &env, &dirs.build, &dirs.install).await?;

        // Only the designated project-vars writer part gets its snapshot
        // recorded; every other part always persists an empty map here.
        let project_vars_written = if self.project_info.project_vars.is_writer(&part.name) {
            self.project_info.project_vars.snapshot()
        } else {
            BTreeMap::new()
        };

        Ok(StepOutcome::Build {
            package_manifest: part.build_packages.clone(),
            project_vars_written,
        })
    }

    async fn run_build_commands(
        &self,
        part: &PartSpec,
        commands: &[String],
        env: &BTreeMap<String, String>,
        build_dir: &std::path::Path,
        install_dir: &std::path::Path,
    ) -> Result<(), ExecutionError> {
        if part.plugin.commands_are_independent() && self.project_info.parallel_build_count > 1 {
            return self.run_build_commands_fanned_out(part, commands, env, build_dir, install_dir).await;
        }
        for command in commands {
            run_one_command(part, command, env, build_dir, install_dir).await?;
        }
        Ok(())
    }

    /// Runs independent commands concurrently, at most
    /// `parallel_build_count` at a time.
    async fn run_build_commands_fanned_out(
        &self,
        part: &PartSpec,
        commands: &[String],
        env: &BTreeMap<String, String>,
        build_dir: &std::path::Path,
        install_dir: &std::path::Path,
    ) -> Result<(), ExecutionError> {
        let limit = self.project_info.parallel_build_count;
        let mut joinset: JoinSet<Result<(), ExecutionError>> = JoinSet::new();
        let mut pending: Vec<String> = commands.to_vec();
        while !pending.is_empty() || !joinset.is_empty() {
            while joinset.len() < limit {
                let Some(command) = pending.pop() else { break };
                let part = part.clone();
                let env = env.clone();
                let build_dir = build_dir.to_path_buf();
                let install_dir = install_dir.to_path_buf();
                joinset.spawn(async move { run_one_command(&part, &command, &env, &build_dir, &install_dir).await });
            }
            match joinset.join_next().await {
                Some(result) => result.map_err(|e| other(e))??,
                None => break,
            }
        }
        Ok(())
    }

    /// Stage is partition-aware: the part's `stage` selectors are grouped by
    /// their `(partition)` prefix (bare selectors, and an empty selector
    /// list, target the `default` partition) and copied into that
    /// partition's own sub-tree under the shared stage dir, so two parts
    /// staging into different partitions never see each other's files.
    async fn run_stage(&self, part: &PartSpec) -> Result<StepOutcome, ExecutionError> {
        let dirs = self.project_info.part_dirs(&part.name);
        let grouped = group_by_partition(self.project_info, &part.stage)?;
        let mut files = Vec::new();
        let mut dirs_copied = Vec::new();
        for (partition, patterns) in grouped {
            let dest = self.project_info.stage_partition_dir(&partition);
            let (f, d) = copy_filtered(&dirs.install, &dest, &patterns, part, Step::Stage).await?;
            files.extend(f.into_iter().map(|p| join_partition_path(&partition, &p)));
            dirs_copied.extend(d.into_iter().map(|p| join_partition_path(&partition, &p)));
        }
        Ok(StepOutcome::Stage {
            files,
            dirs: dirs_copied,
            overlay_files_annotation: Vec::new(),
        })
    }

    async fn run_prime(&self, part: &PartSpec) -> Result<StepOutcome, ExecutionError> {
        let grouped = group_by_partition(self.project_info, &part.prime)?;
        let mut files = Vec::new();
        let mut dirs_copied = Vec::new();
        for (partition, patterns) in grouped {
            let src = self.project_info.stage_partition_dir(&partition);
            let dest = self.project_info.prime_partition_dir(&partition);
            let (f, d) = copy_filtered(&src, &dest, &patterns, part, Step::Prime).await?;
            files.extend(f.into_iter().map(|p| join_partition_path(&partition, &p)));
            dirs_copied.extend(d.into_iter().map(|p| join_partition_path(&partition, &p)));
        }
        let primed_stage_packages = if self.project_info.track_stage_packages {
            part.stage_packages.clone()
        } else {
            Vec::new()
        };
        Ok(StepOutcome::Prime {
            files,
            dirs: dirs_copied,
            primed_stage_packages,
        })
    }

    /// For a `Rerun` (or targeted `clean`) of part `P` from step `from`
    /// onward: remove the part-exclusive `src`/`build`/`install` dirs
    /// wholesale, and remove exactly the files/dirs this part's prior
    /// Stage/Prime record contributed to the shared, partition-scoped
    /// stage/prime trees. Must run before the state records it reads are
    /// deleted.
    async fn remove_artifacts_from(&self, part: &PartSpec, from: Step) -> Result<(), ExecutionError> {
        let dirs = self.project_info.part_dirs(&part.name);
        if from <= Step::Pull {
            let _ = tokio::fs::remove_dir_all(&dirs.src).await;
        }
        if from <= Step::Build {
            let _ = tokio::fs::remove_dir_all(&dirs.build).await;
            let _ = tokio::fs::remove_dir_all(&dirs.install).await;
        }
        if from <= Step::Stage {
            if let Some(record) = self.state.load(&part.name, Step::Stage).await {
                if let StepOutcome::Stage { files, dirs: stage_dirs, .. } = record.outcome {
                    remove_partitioned_paths(&files, &stage_dirs, |p| self.project_info.stage_partition_dir(p)).await;
                }
            }
        }
        if from <= Step::Prime {
            if let Some(record) = self.state.load(&part.name, Step::Prime).await {
                if let StepOutcome::Prime { files, dirs: prime_dirs, .. } = record.outcome {
                    remove_partitioned_paths(&files, &prime_dirs, |p| self.project_info.prime_partition_dir(p)).await;
                }
            }
        }
        Ok(())
    }

    /// `clean(initial_step, part_names?)`: removes recorded state and
    /// on-disk artifacts for that step and everything after it, for the
    /// given parts (or every part, which additionally removes the shared
    /// work directories).
    pub async fn clean(&self, initial_step: Step, part_names: Option<&[String]>) -> Result<(), ExecutionError> {
        let targets: Vec<&PartSpec> = match part_names {
            Some(names) => names.iter().filter_map(|n| self.parts.get(n)).collect(),
            None => self.parts.values().collect(),
        };
        for part in &targets {
            self.remove_artifacts_from(part, initial_step).await?;
            self.state.remove_from(&part.name, initial_step).await?;
        }
        if part_names.is_none() {
            let _ = tokio::fs::remove_dir_all(self.project_info.stage_dir()).await;
            let _ = tokio::fs::remove_dir_all(self.project_info.prime_dir()).await;
        }
        Ok(())
    }
}

async fn run_one_command(
    part: &PartSpec,
    command: &str,
    env: &BTreeMap<String, String>,
    build_dir: &std::path::Path,
    install_dir: &std::path::Path,
) -> Result<(), ExecutionError> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(build_dir);
    cmd.env("CRAFT_PART_INSTALL", install_dir);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let status = cmd.status().await.map_err(other)?;
    if !status.success() {
        return Err(ExecutionError::SubprocessFailed {
            part: part.name.clone(),
            step: Step::Build,
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Group `stage`/`prime` selectors by their `(partition)` prefix. A selector
/// with no prefix, and an empty selector list (meaning "copy everything"),
/// both target the `default` partition. Referencing a partition the project
/// hasn't declared is an error.
fn group_by_partition(
    project_info: &ProjectInfo,
    selectors: &[String],
) -> Result<BTreeMap<String, Vec<String>>, ExecutionError> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if selectors.is_empty() {
        grouped.insert("default".to_string(), Vec::new());
        return Ok(grouped);
    }
    for selector in selectors {
        let (partition, pattern) = split_partition_prefix(selector);
        if !project_info.has_partition(partition) {
            return Err(ExecutionError::Other(anyhow::anyhow!(
                "selector '{selector}' references undeclared partition '{partition}'"
            )));
        }
        grouped.entry(partition.to_string()).or_default().push(pattern.to_string());
    }
    Ok(grouped)
}

/// Split a `(partition)/rest/of/path` selector into its partition name and
/// bare pattern. A selector with no `(partition)` prefix belongs to `default`.
fn split_partition_prefix(selector: &str) -> (&str, &str) {
    if let Some(rest) = selector.strip_prefix('(') {
        if let Some(end) = rest.find(')') {
            let partition = &rest[..end];
            let pattern = rest[end + 1..].trim_start_matches('/');
            return (partition, pattern);
        }
    }
    ("default", selector)
}

/// Tag a path recorded in a `StepOutcome` with the partition its copy
/// belongs to, so a later `Rerun` knows which partition sub-tree to clean it
/// from without re-parsing the part's selectors.
fn join_partition_path(partition: &str, rel: &str) -> String {
    format!("{partition}::{rel}")
}

fn split_partition_path(entry: &str) -> (&str, &str) {
    entry.split_once("::").unwrap_or(("default", entry))
}

/// Delete exactly the files/dirs a prior Stage or Prime outcome recorded,
/// from whichever partition sub-tree each one was copied into. Deepest
/// directories are removed first so a directory empties out before its own
/// removal is attempted; removal is best-effort since other parts may still
/// own sibling entries under the same directory.
async fn remove_partitioned_paths(files: &[String], dirs: &[String], root_for: impl Fn(&str) -> std::path::PathBuf) {
    for entry in files {
        let (partition, rel) = split_partition_path(entry);
        let _ = tokio::fs::remove_file(root_for(partition).join(rel)).await;
    }
    let mut dir_paths: Vec<_> = dirs
        .iter()
        .map(|entry| {
            let (partition, rel) = split_partition_path(entry);
            root_for(partition).join(rel)
        })
        .collect();
    dir_paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dir_paths {
        let _ = tokio::fs::remove_dir(&dir).await;
    }
}

async fn copy_filtered(
    src_dir: &std::path::Path,
    dest_dir: &std::path::Path,
    selectors: &[String],
    part: &PartSpec,
    step: Step,
) -> Result<(Vec<String>, Vec<String>), ExecutionError> {
    tokio::fs::create_dir_all(dest_dir).await.map_err(other)?;
    if !src_dir.exists() {
        return Ok((Vec::new(), Vec::new()));
    }
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(src_dir).min_depth(1) {
        let entry = entry.map_err(other)?;
        let rel = entry.path().strip_prefix(src_dir).expect("walkdir yields paths under src_dir");
        if !selectors.is_empty() {
            let rel_str = rel.to_string_lossy();
            let selected = selectors.iter().any(|s| rel_str.starts_with(s.as_str()));
            if !selected {
                continue;
            }
        }
        let target = dest_dir.join(rel);
        if entry.file_type().is_dir() {
            tokio::fs::create_dir_all(&target).await.map_err(other)?;
            dirs.push(rel.to_string_lossy().to_string());
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(other)?;
            }
            if target.exists() {
                let existing = tokio::fs::read(&target).await.map_err(other)?;
                let incoming = tokio::fs::read(entry.path()).await.map_err(other)?;
                if existing != incoming {
                    return Err(ExecutionError::StageFilesConflict {
                        part: part.name.clone(),
                        step,
                        path: rel.to_string_lossy().to_string(),
                        other_part: "unknown".to_string(),
                    });
                }
            } else {
                tokio::fs::copy(entry.path(), &target).await.map_err(other)?;
            }
            files.push(rel.to_string_lossy().to_string());
        }
    }
    Ok((files, dirs))
}

fn md5_like_digest(input: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::plugin::PluginRegistry;
    use serde_json::{json, Value};

    async fn dump_part(name: &str, source: &std::path::Path) -> PartSpec {
        let registry = PluginRegistry::default();
        let mut raw: BTreeMap<String, Value> = BTreeMap::new();
        raw.insert("plugin".to_string(), json!("dump"));
        raw.insert("source".to_string(), json!(source.to_string_lossy().to_string()));
        PartSpec::from_mapping(name, &raw, &registry, false).unwrap()
    }

    #[tokio::test]
    async fn pull_then_build_produces_state_for_a_dump_part() {
        let source_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(source_dir.path().join("payload.txt"), b"hi").await.unwrap();

        let work_dir = tempfile::tempdir().unwrap();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", work_dir.path()).unwrap();
        let part = dump_part("hello", source_dir.path()).await;
        let mut parts = BTreeMap::new();
        parts.insert(part.name.clone(), part);

        let state = StateStore::new(info.state_dir());
        let executor = Executor::new(&parts, &info, &state);

        let actions = vec![
            Action::new("hello", Step::Pull, ActionKind::Run),
            Action::new("hello", Step::Build, ActionKind::Run),
        ];
        executor.execute(&actions).await.unwrap();

        assert!(state.load("hello", Step::Pull).await.is_some());
        assert!(state.load("hello", Step::Build).await.is_some());
        assert!(work_dir.path().join("parts/hello/install/payload.txt").exists());
    }

    #[tokio::test]
    async fn clean_removes_state_from_the_given_step_onward() {
        let work_dir = tempfile::tempdir().unwrap();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", work_dir.path()).unwrap();
        let state = StateStore::new(info.state_dir());
        state
            .save(
                "hello",
                Step::Pull,
                &StateRecord::new(
                    "fp",
                    StepOutcome::Pull {
                        assets: vec![],
                        stage_packages_manifest: vec![],
                    },
                    chrono::Utc::now(),
                ),
            )
            .await
            .unwrap();

        let parts = BTreeMap::new();
        let executor = Executor::new(&parts, &info, &state);
        executor.clean(Step::Pull, None).await.unwrap();

        assert!(state.load("hello", Step::Pull).await.is_none());
    }

    #[tokio::test]
    async fn primed_stage_packages_only_recorded_when_tracked() {
        let source_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(source_dir.path().join("payload.txt"), b"hi").await.unwrap();

        let work_dir = tempfile::tempdir().unwrap();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", work_dir.path())
            .unwrap()
            .with_track_stage_packages(true);
        let mut raw: BTreeMap<String, Value> = BTreeMap::new();
        raw.insert("plugin".to_string(), json!("dump"));
        raw.insert("source".to_string(), json!(source_dir.path().to_string_lossy().to_string()));
        raw.insert("stage-packages".to_string(), json!(["libfoo1"]));
        let registry = PluginRegistry::default();
        let part = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap();
        let mut parts = BTreeMap::new();
        parts.insert(part.name.clone(), part);

        let state = StateStore::new(info.state_dir());
        let executor = Executor::new(&parts, &info, &state);
        let actions = vec![
            Action::new("hello", Step::Pull, ActionKind::Run),
            Action::new("hello", Step::Build, ActionKind::Run),
            Action::new("hello", Step::Stage, ActionKind::Run),
            Action::new("hello", Step::Prime, ActionKind::Run),
        ];
        executor.execute(&actions).await.unwrap();

        let record = state.load("hello", Step::Prime).await.unwrap();
        match record.outcome {
            StepOutcome::Prime { primed_stage_packages, .. } => {
                assert_eq!(primed_stage_packages, vec!["libfoo1".to_string()]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn chisel_is_injected_when_a_part_declares_a_package_slice() {
        let work_dir = tempfile::tempdir().unwrap();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", work_dir.path()).unwrap();
        let mut raw: BTreeMap<String, Value> = BTreeMap::new();
        raw.insert("plugin".to_string(), json!("nil"));
        raw.insert("stage-packages".to_string(), json!(["openssl_bins"]));
        let registry = PluginRegistry::default();
        let part = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap();
        let mut parts = BTreeMap::new();
        parts.insert(part.name.clone(), part);

        let context = ExecutionContext::enter(&info, Arc::new(CopyOverlayMounter), &parts).await.unwrap();
        assert!(context.resolved_build_snaps.iter().any(|s| s == "chisel/latest/stable"));
        context.finish().await.unwrap();
    }

    #[tokio::test]
    async fn stage_selectors_route_into_their_own_partition_sub_tree() {
        let source_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(source_dir.path().join("default.txt"), b"d").await.unwrap();
        tokio::fs::write(source_dir.path().join("debug.txt"), b"g").await.unwrap();

        let work_dir = tempfile::tempdir().unwrap();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", work_dir.path())
            .unwrap()
            .with_partitions(&["default", "debug"])
            .unwrap();
        let mut raw: BTreeMap<String, Value> = BTreeMap::new();
        raw.insert("plugin".to_string(), json!("dump"));
        raw.insert("source".to_string(), json!(source_dir.path().to_string_lossy().to_string()));
        raw.insert("stage".to_string(), json!(["default.txt", "(debug)/debug.txt"]));
        let registry = PluginRegistry::default();
        let part = PartSpec::from_mapping("hello", &raw, &registry, false).unwrap();
        let mut parts = BTreeMap::new();
        parts.insert(part.name.clone(), part);

        let state = StateStore::new(info.state_dir());
        let executor = Executor::new(&parts, &info, &state);
        let actions = vec![
            Action::new("hello", Step::Pull, ActionKind::Run),
            Action::new("hello", Step::Build, ActionKind::Run),
            Action::new("hello", Step::Stage, ActionKind::Run),
        ];
        executor.execute(&actions).await.unwrap();

        assert!(work_dir.path().join("stage/default/default.txt").exists());
        assert!(work_dir.path().join("stage/debug/debug.txt").exists());
        assert!(!work_dir.path().join("stage/default/debug.txt").exists());
    }

    #[tokio::test]
    async fn rerun_removes_prior_stage_and_prime_artifacts_before_rerunning() {
        let source_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(source_dir.path().join("payload.txt"), b"v1").await.unwrap();

        let work_dir = tempfile::tempdir().unwrap();
        let info = ProjectInfo::new("demo_app", "demo", "/cache", work_dir.path()).unwrap();
        let part = dump_part("hello", source_dir.path()).await;
        let mut parts = BTreeMap::new();
        parts.insert(part.name.clone(), part);

        let state = StateStore::new(info.state_dir());
        let executor = Executor::new(&parts, &info, &state);
        let actions = vec![
            Action::new("hello", Step::Pull, ActionKind::Run),
            Action::new("hello", Step::Build, ActionKind::Run),
            Action::new("hello", Step::Stage, ActionKind::Run),
            Action::new("hello", Step::Prime, ActionKind::Run),
        ];
        executor.execute(&actions).await.unwrap();

        let staged = work_dir.path().join("stage/default/payload.txt");
        let primed = work_dir.path().join("prime/default/payload.txt");
        assert!(staged.exists());
        assert!(primed.exists());

        // Rerun Build with changed content: the install/stage/prime artifacts
        // from the previous run must be gone before Stage/Prime run again,
        // or the stale bytes would conflict with the freshly staged ones.
        tokio::fs::write(source_dir.path().join("payload.txt"), b"v2-longer").await.unwrap();
        let rerun_actions = vec![
            Action::new("hello", Step::Pull, ActionKind::Rerun),
            Action::new("hello", Step::Build, ActionKind::Rerun),
            Action::new("hello", Step::Stage, ActionKind::Rerun),
            Action::new("hello", Step::Prime, ActionKind::Rerun),
        ];
        executor.execute(&rerun_actions).await.unwrap();

        assert_eq!(tokio::fs::read(&staged).await.unwrap(), b"v2-longer");
        assert_eq!(tokio::fs::read(&primed).await.unwrap(), b"v2-longer");
    }
}
