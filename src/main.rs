// src/main.rs
//
// =============================================================================
// VOXLOGICA: COMMAND LINE ENTRY POINT
// =============================================================================
//
// Modes:
// 1. RUN:   Reduce a program document and drive it to completion.
// 2. OPS:   List registered namespaces and their operators.
// 3. PURGE: Drop failed states (or everything) from the persistent store.
//
// Exit status: 0 when every goal completed, 1 otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use voxlogica::bufferplan;
use voxlogica::engine::{EngineOptions, ExecutionEngine, GoalStatus};
use voxlogica::goals::GoalRunner;
use voxlogica::plan::Node;
use voxlogica::primitives::PrimitiveRegistry;
use voxlogica::reducer::{Environment, Reducer};
use voxlogica::store::{MemoryStore, ResultStore, SqliteStore};
use voxlogica::Program;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "voxlogica", version, about = "Content-addressed DAG execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce and execute a program document (.yaml/.yml or JSON).
    Run {
        /// Path to the program document.
        program: PathBuf,

        /// Store directory (default: ~/.voxlogica, or $VOXLOGICA_STORE).
        #[arg(long)]
        store: Option<PathBuf>,

        /// Concurrent primitive invocations (default: machine concurrency).
        #[arg(long)]
        workers: Option<usize>,

        /// Route results through a throwaway in-memory store.
        #[arg(long)]
        no_cache: bool,

        /// Reduce and report the plan without executing it.
        #[arg(long)]
        dry_run: bool,

        /// Log the advisory buffer assignment for the reduced plan.
        #[arg(long)]
        print_buffers: bool,
    },

    /// List namespaces and the operators they provide.
    Ops {
        /// Restrict the listing to one namespace.
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Remove cached state from the persistent store.
    Purge {
        /// Store directory (default: ~/.voxlogica, or $VOXLOGICA_STORE).
        #[arg(long)]
        store: Option<PathBuf>,

        /// Drop failed states so the next run retries those nodes.
        #[arg(long)]
        failed: bool,

        /// Drop every cached result and execution state.
        #[arg(long)]
        all: bool,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            program,
            store,
            workers,
            no_cache,
            dry_run,
            print_buffers,
        } => run_program(program, store, workers, no_cache, dry_run, print_buffers).await?,
        Commands::Ops { namespace } => {
            list_operators(namespace);
            0
        }
        Commands::Purge { store, failed, all } => run_purge(store, failed, all).await?,
    };

    std::process::exit(code);
}

fn store_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("VOXLOGICA_STORE").map(PathBuf::from))
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".voxlogica")))
        .unwrap_or_else(|| PathBuf::from(".voxlogica"))
}

// ============================================================================
// 3. RUN
// ============================================================================

async fn run_program(
    program: PathBuf,
    store_flag: Option<PathBuf>,
    workers: Option<usize>,
    no_cache: bool,
    dry_run: bool,
    print_buffers: bool,
) -> Result<i32> {
    let program = Program::load(&program)
        .with_context(|| format!("failed to load program {:?}", program))?;

    let registry = Arc::new(PrimitiveRegistry::with_builtins());
    let reducer = Reducer::new(&registry);
    let (_, mut plan) = reducer.reduce_program(&program, Environment::new())?;
    reducer.expand_pending(&mut plan)?;

    log::info!(
        "plan: {} node(s), {} goal(s), imports {:?}",
        plan.len(),
        plan.goals().len(),
        plan.imports()
    );

    if print_buffers {
        // One buffer class per operator family; embedders refine this.
        let assignment = bufferplan::assign_buffers(
            &plan,
            |id| match plan.get(id) {
                Some(Node::Operation { operator, .. }) => operator.clone(),
                Some(Node::Constant(_)) => "constant".into(),
                _ => "other".into(),
            },
            |a, b| a == b,
        );
        log::info!("buffer plan: {} buffer(s)", assignment.buffer_count);
        for (id, buffer) in &assignment.buffers {
            log::info!("  {} -> buffer {}", &id[..12], buffer);
        }
    }

    if dry_run {
        for goal in plan.goals() {
            log::info!("goal: {:?} '{}' <- {}", goal.kind, goal.label, &goal.node_id[..12]);
        }
        return Ok(0);
    }

    let store: Arc<dyn ResultStore> = if no_cache {
        Arc::new(MemoryStore::new())
    } else {
        let dir = store_dir(store_flag);
        Arc::new(SqliteStore::open(&dir).with_context(|| format!("opening store at {dir:?}"))?)
    };

    let mut options = EngineOptions::default();
    if let Some(w) = workers {
        options.workers = w.max(1);
    }
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        log::warn!("interrupt received, cancelling...");
        cancel.cancel();
    });

    let engine = ExecutionEngine::new(store, registry, options);
    let result = engine.run(plan, &GoalRunner::stdout()).await?;

    for goal in &result.goals {
        match &goal.status {
            GoalStatus::Completed => {}
            GoalStatus::Failed(msg) => log::error!("'{}': {msg}", goal.label),
            GoalStatus::Cancelled => log::warn!("'{}': cancelled", goal.label),
        }
    }
    Ok(result.exit_code())
}

// ============================================================================
// 4. OPS & PURGE
// ============================================================================

fn list_operators(namespace: Option<String>) {
    let registry = PrimitiveRegistry::with_builtins();
    for (ns, ops) in registry.list() {
        if let Some(filter) = &namespace {
            if &ns != filter {
                continue;
            }
        }
        println!("{ns}");
        for (op, description) in ops {
            println!("  {op:<12} {description}");
        }
    }
}

async fn run_purge(store_flag: Option<PathBuf>, failed: bool, all: bool) -> Result<i32> {
    let dir = store_dir(store_flag);
    let store = SqliteStore::open(&dir).with_context(|| format!("opening store at {dir:?}"))?;

    if all {
        let n = store.purge_all().await?;
        log::info!("purged {n} row(s)");
    } else if failed {
        let n = store.purge_failed().await?;
        log::info!("purged {n} failed state(s)");
    } else {
        log::warn!("nothing to do: pass --failed or --all");
        return Ok(1);
    }
    Ok(0)
}
