//! `ProjectInfo`: the immutable, project-wide configuration that every part
//! is built against. Constructed once per `LifecycleManager` and never
//! mutated afterward — project variables are the one exception, and even
//! those are restricted to a single designated writer part.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::errors::ConfigError;

const MAX_EXPANSION_DEPTH: usize = 10;

/// Project-scoped variables, mutable only by the part named as their single
/// writer (if any), and only during that part's `Build` step.
#[derive(Clone)]
pub struct ProjectVars {
    values: Arc<RwLock<BTreeMap<String, String>>>,
    writer_part_name: Option<String>,
}

impl ProjectVars {
    pub fn new(initial: BTreeMap<String, String>, writer_part_name: Option<String>) -> Self {
        ProjectVars {
            values: Arc::new(RwLock::new(initial)),
            writer_part_name,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }

    pub fn is_writer(&self, part_name: &str) -> bool {
        self.writer_part_name.as_deref() == Some(part_name)
    }

    /// Set a variable. Only the designated writer part may call this, and
    /// only while that part is actively building; callers enforce the
    /// "during Build" half of the restriction, this enforces the "which
    /// part" half.
    pub fn set(&self, acting_part: &str, key: &str, value: &str) -> Result<(), ConfigError> {
        match &self.writer_part_name {
            Some(writer) if writer == acting_part => {
                self.values.write().insert(key.to_string(), value.to_string());
                Ok(())
            }
            Some(writer) => Err(ConfigError::FeatureError(format!(
                "part '{acting_part}' may not set project variables; only '{writer}' may"
            ))),
            None => Err(ConfigError::FeatureError(
                "project declares no project-vars-part-name; no part may set project variables".to_string(),
            )),
        }
    }
}

/// A validated partition name: either a bare lowercase-alphanumeric name, or
/// a `namespace/name` pair where the namespace is lowercase alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionName(String);

impl PartitionName {
    pub fn parse(raw: &str) -> Result<PartitionName, ConfigError> {
        let segments: Vec<&str> = raw.splitn(2, '/').collect();
        let valid = segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        if valid && segments.len() <= 2 {
            Ok(PartitionName(raw.to_string()))
        } else {
            Err(ConfigError::InvalidPartitionName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Project-wide directory and configuration state, shared read-only by
/// every part's plan and execution.
pub struct ProjectInfo {
    pub application_name: String,
    pub project_name: String,
    pub cache_dir: PathBuf,
    pub work_dir: PathBuf,
    pub target_arch: String,
    pub base: Option<String>,
    pub parallel_build_count: usize,
    pub strict_mode: bool,
    pub project_vars: ProjectVars,
    pub partitions: Vec<PartitionName>,
    pub overlay_base_dir: Option<PathBuf>,
    pub overlay_base_hash: Option<String>,
    pub ignore_outdated: Vec<String>,
    pub extra_build_packages: Vec<String>,
    pub extra_build_snaps: Vec<String>,
    pub track_stage_packages: bool,
}

impl ProjectInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        application_name: impl Into<String>,
        project_name: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Result<ProjectInfo, ConfigError> {
        let application_name = application_name.into();
        validate_application_name(&application_name)?;
        Ok(ProjectInfo {
            application_name,
            project_name: project_name.into(),
            cache_dir: cache_dir.into(),
            work_dir: work_dir.into(),
            target_arch: host_arch().to_string(),
            base: None,
            parallel_build_count: 1,
            strict_mode: false,
            project_vars: ProjectVars::new(BTreeMap::new(), None),
            partitions: vec![PartitionName("default".to_string())],
            overlay_base_dir: None,
            overlay_base_hash: None,
            ignore_outdated: Vec::new(),
            extra_build_packages: Vec::new(),
            extra_build_snaps: Vec::new(),
            track_stage_packages: false,
        })
    }

    pub fn with_target_arch(mut self, arch: impl Into<String>) -> Self {
        self.target_arch = arch.into();
        self
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_parallel_build_count(mut self, n: usize) -> Self {
        self.parallel_build_count = n.max(1);
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_project_vars(
        mut self,
        initial: BTreeMap<String, String>,
        writer_part_name: Option<String>,
    ) -> Self {
        self.project_vars = ProjectVars::new(initial, writer_part_name);
        self
    }

    pub fn with_partitions(mut self, names: &[&str]) -> Result<Self, ConfigError> {
        let mut partitions = Vec::with_capacity(names.len());
        for name in names {
            partitions.push(PartitionName::parse(name)?);
        }
        if partitions.first().map(PartitionName::as_str) != Some("default") {
            return Err(ConfigError::InvalidPartitionName(
                "the first partition must be named 'default'".to_string(),
            ));
        }
        self.partitions = partitions;
        Ok(self)
    }

    /// Overlay base dir and hash are coupled: either both present or both
    /// absent. Validated eagerly so a missing hash is caught before any
    /// overlay mounting is attempted.
    pub fn with_overlay_base(
        mut self,
        base_dir: Option<PathBuf>,
        base_hash: Option<String>,
    ) -> Result<Self, ConfigError> {
        match (&base_dir, &base_hash) {
            (Some(_), None) => return Err(ConfigError::OverlayBaseLayerHashMissing),
            (None, Some(_)) => return Err(ConfigError::OverlayBaseLayerDirMissing),
            _ => {}
        }
        self.overlay_base_dir = base_dir;
        self.overlay_base_hash = base_hash;
        Ok(self)
    }

    pub fn with_ignore_outdated(mut self, patterns: Vec<String>) -> Self {
        self.ignore_outdated = patterns;
        self
    }

    pub fn with_extra_build_packages(mut self, packages: Vec<String>) -> Self {
        self.extra_build_packages = packages;
        self
    }

    pub fn with_extra_build_snaps(mut self, snaps: Vec<String>) -> Self {
        self.extra_build_snaps = snaps;
        self
    }

    pub fn with_track_stage_packages(mut self, track: bool) -> Self {
        self.track_stage_packages = track;
        self
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.work_dir.join("parts")
    }

    /// Root under which every partition's stage sub-tree lives.
    pub fn stage_dir(&self) -> PathBuf {
        self.work_dir.join("stage")
    }

    /// Root under which every partition's prime sub-tree lives.
    pub fn prime_dir(&self) -> PathBuf {
        self.work_dir.join("prime")
    }

    /// The stage sub-tree for one partition. The `default` partition's
    /// sub-tree holds everything a selector doesn't explicitly route
    /// elsewhere.
    pub fn stage_partition_dir(&self, partition: &str) -> PathBuf {
        self.stage_dir().join(partition)
    }

    pub fn prime_partition_dir(&self, partition: &str) -> PathBuf {
        self.prime_dir().join(partition)
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.partitions.iter().any(|p| p.as_str() == name)
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.work_dir.join("overlay")
    }

    /// Root that `StateStore` nests `<part>/state/<step>` under.
    pub fn state_dir(&self) -> PathBuf {
        self.parts_dir()
    }

    pub fn part_dirs(&self, part_name: &str) -> PartDirs {
        let base = self.parts_dir().join(part_name);
        PartDirs {
            src: base.join("src"),
            build: base.join("build"),
            install: base.join("install"),
            layer: base.join("layer"),
        }
    }

    /// Substitute `${var}` references in `text` using project variables and
    /// a small set of built-ins (`arch`, `application_name`, `project_name`).
    /// Single-pass, left-to-right, with a bounded recursion depth so a
    /// pathological chain of references can't expand forever. References
    /// that don't resolve are left untouched, verbatim.
    pub fn expand(&self, text: &str) -> String {
        self.expand_bounded(text, 0)
    }

    fn expand_bounded(&self, text: &str, depth: usize) -> String {
        if depth >= MAX_EXPANSION_DEPTH {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        let mut last_end = 0;
        while let Some((i, c)) = chars.next() {
            if c == '$' {
                if let Some(&(_, '{')) = chars.peek() {
                    if let Some(close_rel) = text[i + 1..].find('}') {
                        let close = i + 1 + close_rel;
                        let name = &text[i + 2..close];
                        out.push_str(&text[last_end..i]);
                        match self.resolve_builtin_or_var(name) {
                            Some(value) => out.push_str(&self.expand_bounded(&value, depth + 1)),
                            None => out.push_str(&text[i..=close]),
                        }
                        last_end = close + 1;
                        while chars.peek().map(|(pos, _)| *pos <= close).unwrap_or(false) {
                            chars.next();
                        }
                    }
                }
            }
        }
        out.push_str(&text[last_end..]);
        out
    }

    fn resolve_builtin_or_var(&self, name: &str) -> Option<String> {
        match name {
            "arch" => Some(self.target_arch.clone()),
            "application_name" => Some(self.application_name.clone()),
            "project_name" => Some(self.project_name.clone()),
            other => self.project_vars.get(other),
        }
    }
}

pub struct PartDirs {
    pub src: PathBuf,
    pub build: PathBuf,
    pub install: PathBuf,
    pub layer: PathBuf,
}

fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

fn validate_application_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidApplicationName(name.to_string()))
    }
}

/// Deep-expand every string value in a raw parts mapping, recursively.
/// Applied once, before any `PartSpec` is constructed from the mapping.
pub fn expand_parts_mapping(info: &ProjectInfo, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(info.expand(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_parts_mapping(info, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_parts_mapping(info, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn work_dir_exists(path: &Path) -> bool {
    path.exists()
}
