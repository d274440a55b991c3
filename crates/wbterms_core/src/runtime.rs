use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{TermStoreConfig, load_config, render_default_config};
use crate::migrate::pending_migration_count;

pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `wbterms db migrate` to apply pending schema migrations.";

pub const STATE_DIR_NAME: &str = ".wbterms";
pub const DEFAULT_DB_FILENAME: &str = "terms.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub primary_db: Option<PathBuf>,
    pub replica_db: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub primary_db_path: PathBuf,
    /// Same file as the primary unless a replica was configured.
    pub replica_db_path: PathBuf,
    pub config: TermStoreConfig,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
    pub primary_source: ValueSource,
    pub replica_source: ValueSource,
}

impl ResolvedPaths {
    pub fn has_separate_replica(&self) -> bool {
        self.replica_db_path != self.primary_db_path
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={}\nconfig_path={} ({})\nprimary_db={} ({})\nreplica_db={} ({})\npolicy={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.primary_db_path),
            self.primary_source.as_str(),
            normalize_for_display(&self.replica_db_path),
            self.replica_source.as_str(),
            MIGRATIONS_POLICY_MESSAGE
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub config_exists: bool,
    pub primary_exists: bool,
    pub primary_size_bytes: Option<u64>,
    pub replica_exists: bool,
    pub pending_migrations: Option<usize>,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();
    let primary_exists = paths.primary_db_path.exists();
    let replica_exists = paths.replica_db_path.exists();
    let primary_size_bytes = if primary_exists {
        let metadata = fs::metadata(&paths.primary_db_path)
            .with_context(|| format!("failed to inspect {}", paths.primary_db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };
    let pending_migrations = if primary_exists {
        Some(pending_migration_count(&paths.primary_db_path)?)
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(".wbterms/ is missing; run `wbterms init` first".to_string());
    }
    if !primary_exists {
        warnings.push("primary database is missing; run `wbterms db migrate`".to_string());
    } else if pending_migrations.unwrap_or(0) > 0 {
        warnings.push(MIGRATIONS_POLICY_MESSAGE.to_string());
    }
    if paths.has_separate_replica() && !replica_exists {
        warnings.push(format!(
            "replica {} does not exist; reads will fail until it is provisioned",
            normalize_for_display(&paths.replica_db_path)
        ));
    }

    Ok(RuntimeStatus {
        state_dir_exists,
        config_exists,
        primary_exists,
        primary_size_bytes,
        replica_exists,
        pending_migrations,
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);
    let data_dir = state_dir.join("data");

    let (config_path, config_source) = pick_path(
        overrides.config.as_deref(),
        &lookup_env,
        "WBTERMS_CONFIG",
        None,
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join("config.toml"), ValueSource::Default));
    let config = load_config(&config_path)?;

    let (primary_db_path, primary_source) = pick_path(
        overrides.primary_db.as_deref(),
        &lookup_env,
        "WBTERMS_PRIMARY_DB",
        config.store.primary_db.as_deref(),
        &project_root,
    )
    .unwrap_or_else(|| (data_dir.join(DEFAULT_DB_FILENAME), ValueSource::Default));

    let (replica_db_path, replica_source) = pick_path(
        overrides.replica_db.as_deref(),
        &lookup_env,
        "WBTERMS_REPLICA_DB",
        config.store.replica_db.as_deref(),
        &project_root,
    )
    .unwrap_or_else(|| (primary_db_path.clone(), ValueSource::Default));

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        data_dir,
        config_path,
        primary_db_path,
        replica_db_path,
        config,
        root_source,
        config_source,
        primary_source,
        replica_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let mut required_dirs = vec![paths.state_dir.clone(), paths.data_dir.clone()];
    if let Some(parent) = paths.primary_db_path.parent() {
        required_dirs.push(parent.to_path_buf());
    }

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(&paths.config_path, &render_default_config(), options.force)?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

fn pick_path<F>(
    flag: Option<&Path>,
    lookup_env: &F,
    env_key: &str,
    configured: Option<&Path>,
    project_root: &Path,
) -> Option<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = flag {
        return Some((absolutize(path, project_root), ValueSource::Flag));
    }
    if let Some(value) = lookup_env(env_key).filter(|value| !value.trim().is_empty()) {
        return Some((
            absolutize(Path::new(value.trim()), project_root),
            ValueSource::Env,
        ));
    }
    configured.map(|path| (absolutize(path, project_root), ValueSource::Config))
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("WBTERMS_PROJECT_ROOT").filter(|value| !value.trim().is_empty())
    {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }
    match detect_project_root_heuristic(&context.cwd) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

fn detect_project_root_heuristic(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, init_layout, inspect_runtime,
        resolve_paths_with_lookup,
    };
    use crate::migrate::{DEFAULT_BUSY_TIMEOUT, run_migrations};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd };
        let env = HashMap::from([(
            "WBTERMS_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
    }

    #[test]
    fn heuristic_finds_state_dir_in_ancestors() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(".wbterms")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let resolved = resolve_paths_with_lookup(
            &ResolutionContext { cwd: nested },
            &PathOverrides::default(),
            no_env,
        )
        .expect("resolve paths");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
        assert_eq!(
            resolved.primary_db_path,
            root.join(".wbterms").join("data").join("terms.db")
        );
    }

    #[test]
    fn replica_defaults_to_primary() {
        let temp = tempdir().expect("tempdir");
        let resolved = resolve_paths_with_lookup(
            &ResolutionContext {
                cwd: temp.path().to_path_buf(),
            },
            &PathOverrides::default(),
            no_env,
        )
        .expect("resolve paths");

        assert_eq!(resolved.root_source, ValueSource::Default);
        assert_eq!(resolved.replica_db_path, resolved.primary_db_path);
        assert_eq!(resolved.replica_source, ValueSource::Default);
        assert!(!resolved.has_separate_replica());
    }

    #[test]
    fn database_paths_follow_flag_env_config_order() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join(".wbterms")).expect("state dir");
        fs::write(
            root.join(".wbterms").join("config.toml"),
            "[store]\nprimary_db = \"from-config.db\"\nreplica_db = \"replica-config.db\"\n",
        )
        .expect("write config");

        let context = ResolutionContext { cwd: root.clone() };
        let env = HashMap::from([(
            "WBTERMS_REPLICA_DB".to_string(),
            "replica-env.db".to_string(),
        )]);

        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
                env.get(key).cloned()
            })
            .expect("resolve paths");
        assert_eq!(resolved.primary_db_path, root.join("from-config.db"));
        assert_eq!(resolved.primary_source, ValueSource::Config);
        assert_eq!(resolved.replica_db_path, root.join("replica-env.db"));
        assert_eq!(resolved.replica_source, ValueSource::Env);

        let overrides = PathOverrides {
            primary_db: Some(root.join("flag.db")),
            ..PathOverrides::default()
        };
        let resolved = resolve_paths_with_lookup(&context, &overrides, no_env)
            .expect("resolve paths");
        assert_eq!(resolved.primary_db_path, root.join("flag.db"));
        assert_eq!(resolved.primary_source, ValueSource::Flag);
        assert_eq!(resolved.replica_source, ValueSource::Config);
    }

    #[test]
    fn init_creates_layout_and_keeps_existing_config() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_with_lookup(
            &ResolutionContext {
                cwd: temp.path().to_path_buf(),
            },
            &PathOverrides::default(),
            no_env,
        )
        .expect("resolve paths");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert!(report.wrote_config);
        assert!(paths.data_dir.is_dir());
        assert!(paths.config_path.is_file());

        fs::write(&paths.config_path, "# edited\n").expect("edit config");
        let report = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(!report.wrote_config);
        assert!(report.created_dirs.is_empty());
        assert_eq!(
            fs::read_to_string(&paths.config_path).expect("read config"),
            "# edited\n"
        );

        let forced = InitOptions {
            force: true,
            ..InitOptions::default()
        };
        assert!(init_layout(&paths, &forced).expect("force init").wrote_config);
    }

    #[test]
    fn inspect_reports_missing_and_pending_state() {
        let temp = tempdir().expect("tempdir");
        let paths = resolve_paths_with_lookup(
            &ResolutionContext {
                cwd: temp.path().to_path_buf(),
            },
            &PathOverrides::default(),
            no_env,
        )
        .expect("resolve paths");

        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.primary_exists);
        assert_eq!(status.pending_migrations, None);
        assert_eq!(status.warnings.len(), 2);

        init_layout(&paths, &InitOptions::default()).expect("init");
        run_migrations(&paths.primary_db_path, DEFAULT_BUSY_TIMEOUT).expect("migrate");
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(status.primary_exists);
        assert_eq!(status.pending_migrations, Some(0));
        assert!(status.warnings.is_empty());
    }
}
