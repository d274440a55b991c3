use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use wbterms_core::migrate::{
    MigrateReport, open_connection, pending_migration_count, run_migrations, table_row_counts,
};
use wbterms_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    init_layout, inspect_runtime, resolve_paths,
};
use wbterms_core::{
    DatabaseTermInLangIdsAcquirer, DatabaseTermInLangIdsResolver, DatabaseTypeIdsStore,
    ResolveFilter, TermType, TermsArray,
};

const DEFAULT_LOG_FILTER: &str = "wbterms=info,wbterms_core=info";

#[derive(Debug, Parser)]
#[command(
    name = "wbterms",
    version,
    about = "Acquire and resolve deduplicated term-in-lang ids in a Wikibase-style term store"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Primary (writable) database")]
    primary: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Replica (read-only) database")]
    replica: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    overrides: PathOverrides,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            overrides: PathOverrides {
                project_root: cli.project_root.clone(),
                primary_db: cli.primary.clone(),
                replica_db: cli.replica.clone(),
                config: cli.config.clone(),
            },
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the .wbterms/ layout and migrate the primary database")]
    Init(InitArgs),
    Db(DbArgs),
    #[command(about = "Acquire term-in-lang ids for a terms JSON document")]
    Acquire(AcquireArgs),
    #[command(about = "Print the terms behind term-in-lang ids")]
    Resolve(ResolveArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wbterms/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    #[command(about = "Apply pending schema migrations")]
    Migrate,
    #[command(about = "Row counts per term store table")]
    Stats,
}

#[derive(Debug, Args)]
struct AcquireArgs {
    #[arg(value_name = "FILE", help = "Terms JSON, e.g. {\"label\": {\"en\": \"Berlin\"}}")]
    file: PathBuf,
    #[arg(long, help = "Print the result as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(value_name = "ID", required = true)]
    ids: Vec<i64>,
    #[arg(long = "type", value_name = "TYPE", help = "Only resolve this term type")]
    types: Vec<TermType>,
    #[arg(long = "lang", value_name = "LANG", help = "Only resolve this language")]
    languages: Vec<String>,
    #[arg(long, help = "Print the result as JSON")]
    json: bool,
}

#[derive(Debug, Serialize)]
struct AcquiredTermOutput<'a> {
    term_type: TermType,
    language: &'a str,
    text: &'a str,
    type_id: i64,
    term_in_lang_id: i64,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Acquire(args)) => run_acquire(&runtime, args),
        Some(Commands::Resolve(args)) => run_resolve(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let migrated = run_migrations(&paths.primary_db_path, paths.config.busy_timeout())?;

    println!("Initialized wbterms runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("primary_db: {}", normalize_path(&paths.primary_db_path));
    println!("replica_db: {}", normalize_path(&paths.replica_db_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_migrate_report("primary", &migrated);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let busy_timeout = paths.config.busy_timeout();

    println!("db migrate");
    let primary = run_migrations(&paths.primary_db_path, busy_timeout)?;
    println!("primary_db: {}", normalize_path(&paths.primary_db_path));
    print_migrate_report("primary", &primary);
    if paths.has_separate_replica() {
        let replica = run_migrations(&paths.replica_db_path, busy_timeout)?;
        println!("replica_db: {}", normalize_path(&paths.replica_db_path));
        print_migrate_report("replica", &replica);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("primary_db: {}", normalize_path(&paths.primary_db_path));
    println!("primary_exists: {}", format_flag(status.primary_exists));
    println!(
        "primary_size_bytes: {}",
        status
            .primary_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if paths.has_separate_replica() {
        println!("replica_db: {}", normalize_path(&paths.replica_db_path));
        println!("replica_exists: {}", format_flag(status.replica_exists));
    }
    match status.pending_migrations {
        Some(0) => {
            let connection = open_connection(&paths.primary_db_path, paths.config.busy_timeout())?;
            for (table, count) in table_row_counts(&connection)? {
                println!("rows.{table}: {count}");
            }
        }
        Some(pending) => println!("pending_migrations: {pending}"),
        None => println!("rows: <no database> (run `wbterms init`)"),
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_acquire(runtime: &RuntimeOptions, args: AcquireArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    ensure_migrated(&paths)?;
    let options = paths.config.acquirer_options()?;
    let input = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let terms = TermsArray::from_json(&input)
        .with_context(|| format!("failed to parse terms in {}", args.file.display()))?;

    let busy_timeout = paths.config.busy_timeout();
    let primary = open_connection(&paths.primary_db_path, busy_timeout)?;
    let separate_replica = if paths.has_separate_replica() {
        Some(open_connection(&paths.replica_db_path, busy_timeout)?)
    } else {
        None
    };
    let replica = separate_replica.as_ref().unwrap_or(&primary);

    let type_ids = DatabaseTypeIdsStore::new(replica, &primary);
    let acquirer =
        DatabaseTermInLangIdsAcquirer::new(replica, &primary, &type_ids).with_options(options);
    let batch = acquirer.acquire(&terms)?;
    let ids = acquirer.finalize(&batch)?;
    debug!(terms = ids.len(), "finalized term_in_lang ids");

    let output = batch
        .terms()
        .iter()
        .zip(&ids)
        .map(|(acquired, id)| AcquiredTermOutput {
            term_type: acquired.term.term_type,
            language: &acquired.term.language,
            text: &acquired.term.text,
            type_id: acquired.type_id,
            term_in_lang_id: *id,
        })
        .collect::<Vec<_>>();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("acquire");
        println!("file: {}", normalize_path(&args.file));
        println!("terms: {}", output.len());
        for term in &output {
            println!(
                "{}.{}: {} ({})",
                term.term_type, term.language, term.term_in_lang_id, term.text
            );
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_resolve(runtime: &RuntimeOptions, args: ResolveArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    ensure_migrated(&paths)?;

    let busy_timeout = paths.config.busy_timeout();
    let primary = open_connection(&paths.primary_db_path, busy_timeout)?;
    let separate_replica = if paths.has_separate_replica() {
        Some(open_connection(&paths.replica_db_path, busy_timeout)?)
    } else {
        None
    };
    let replica = separate_replica.as_ref().unwrap_or(&primary);

    let mut filter = ResolveFilter::all();
    for term_type in args.types {
        filter = filter.with_type(term_type);
    }
    for language in &args.languages {
        filter = filter.with_language(language);
    }

    let type_ids = DatabaseTypeIdsStore::new(replica, &primary);
    let resolver = DatabaseTermInLangIdsResolver::new(replica, &primary, &type_ids);
    let terms = resolver.resolve_term_in_lang_ids(&args.ids, &filter)?;

    if args.json {
        println!("{}", terms.to_json_pretty()?);
    } else {
        println!("resolve");
        println!("ids: {}", args.ids.len());
        println!("terms: {}", terms.term_count());
        for (term_type, language, text) in terms.iter() {
            println!("{term_type}.{language}: {text}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn ensure_migrated(paths: &ResolvedPaths) -> Result<()> {
    let mut databases = vec![&paths.primary_db_path];
    if paths.has_separate_replica() {
        databases.push(&paths.replica_db_path);
    }
    for db_path in databases {
        let pending = pending_migration_count(db_path)?;
        if pending > 0 {
            bail!(
                "{} has {pending} pending migration(s).\n{MIGRATIONS_POLICY_MESSAGE}",
                normalize_path(db_path)
            );
        }
    }
    Ok(())
}

fn print_migrate_report(prefix: &str, report: &MigrateReport) {
    println!("{prefix}.applied: {}", report.applied.len());
    for migration in &report.applied {
        println!(
            "{prefix}.migration: v{:03}_{}",
            migration.version, migration.name
        );
    }
    println!("{prefix}.schema_version: {}", report.current_version);
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let initial = resolve_paths(&context, &runtime.overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &runtime.overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
