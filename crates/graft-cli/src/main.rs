mod config;
mod runtime_cmds;
mod serve_cmd;
mod status_cmd;

use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use uuid::Uuid;

use graft_core::config::{CoreConfig, exit};
use graft_core::evaluator::EvaluatorConfig;
use graft_core::executor::ExecutorConfig;
use graft_core::handler::builtin::builtin_registry;
use graft_core::oracle::HttpPlanner;
use graft_core::orchestrator::{Orchestrator, OrchestratorConfig};
use graft_db::pool;
use graft_db::queries::workflows as workflow_db;
use graft_fabric::pg::{FabricConfig, PgFabric};

use config::GraftConfig;

#[derive(Parser)]
#[command(name = "graft", about = "Self-correcting distributed workflow engine")]
struct Cli {
    /// Database URL (overrides GRAFT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Planner oracle base URL (overrides GRAFT_PLANNER_URL env var)
    #[arg(long, global = true)]
    planner_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a graft config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/graft")]
        db_url: String,
        /// Planner oracle base URL
        #[arg(long)]
        oracle_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the graft database (create + migrate)
    DbInit,
    /// Submit a workflow prompt
    Submit {
        /// The natural-language request to plan and execute
        prompt: String,
    },
    /// Show workflow status (omit workflow_id to list all workflows)
    Status {
        /// Workflow ID to show (omit to list all)
        workflow_id: Option<String>,
    },
    /// Cancel a running workflow
    Cancel {
        /// Workflow ID to cancel
        workflow_id: String,
    },
    /// Run the orchestrator (dispatch + supervision loops)
    Orchestrate,
    /// Run an executor process
    Executor {
        /// Executor identity; generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Comma-separated capability tags to consume dispatches for
        #[arg(long, default_value = "code_executor,file_writer,api_caller,generic")]
        capabilities: String,
        /// Concurrent in-flight tasks
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Run an evaluator process
    Evaluator {
        /// Comma-separated stderr substrings treated as acceptable for
        /// code_executor results
        #[arg(long)]
        stderr_whitelist: Option<String>,
    },
    /// Serve the HTTP submission and status API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8700)]
        port: u16,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Execute the `graft init` command: write the config file.
fn cmd_init(db_url: &str, oracle_url: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        planner: oracle_url.map(|url| config::PlannerSection {
            url: url.to_string(),
        }),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    if let Some(url) = oracle_url {
        println!("  planner.url = {url}");
    }
    println!();
    println!("Next: run `graft db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `graft db-init` command: create database and run migrations.
async fn cmd_db_init(resolved: &GraftConfig) -> anyhow::Result<()> {
    println!("Initializing graft database...");

    let db_pool = pool::bootstrap(&resolved.db_config).await?;

    let counts = pool::schema_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("graft db-init complete.");
    Ok(())
}

/// Map a runtime failure to the documented exit codes.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<graft_fabric::FabricError>().is_some() {
            return exit::FABRIC;
        }
        if cause.downcast_ref::<graft_db::StoreError>().is_some()
            || cause.downcast_ref::<sqlx::Error>().is_some()
        {
            return exit::STORE;
        }
    }
    exit::STORE
}

fn fail(err: anyhow::Error, code: i32) -> ! {
    eprintln!("{err:#}");
    std::process::exit(code);
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Commands that need no resolved configuration.
    match &cli.command {
        Commands::Init {
            db_url,
            oracle_url,
            force,
        } => {
            if let Err(e) = cmd_init(db_url, oracle_url.as_deref(), *force) {
                fail(e, exit::CONFIG);
            }
            return Ok(());
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "graft",
                &mut std::io::stdout(),
            );
            return Ok(());
        }
        _ => {}
    }

    let resolved =
        match GraftConfig::resolve(cli.database_url.as_deref(), cli.planner_url.as_deref()) {
            Ok(resolved) => resolved,
            Err(e) => fail(e, exit::CONFIG),
        };
    let core = match CoreConfig::from_env() {
        Ok(core) => core,
        Err(e) => fail(e, exit::CONFIG),
    };

    if let Commands::DbInit = &cli.command {
        if let Err(e) = cmd_db_init(&resolved).await {
            fail(e, exit::STORE);
        }
        return Ok(());
    }

    let db_pool = match resolved.db_config.connect().await {
        Ok(db_pool) => db_pool,
        Err(e) => fail(e, exit::STORE),
    };
    let fabric = Arc::new(PgFabric::new(
        db_pool.clone(),
        FabricConfig {
            dead_letter_after: core.dead_letter_after,
            ..FabricConfig::default()
        },
    ));

    let result = match cli.command {
        Commands::Init { .. } | Commands::DbInit | Commands::Completions { .. } => unreachable!(),
        Commands::Submit { prompt } => {
            let planner_url = match resolved.require_planner_url() {
                Ok(url) => url.to_owned(),
                Err(e) => fail(e, exit::CONFIG),
            };
            let orchestrator = Orchestrator::new(
                db_pool.clone(),
                fabric.clone(),
                Arc::new(HttpPlanner::new(planner_url)),
                OrchestratorConfig::from_core(&core),
                EvaluatorConfig::default(),
            );
            orchestrator.submit(&prompt).await.map(|workflow_id| {
                println!("{workflow_id}");
            })
        }
        Commands::Status { workflow_id } => {
            status_cmd::run_status(&db_pool, workflow_id.as_deref()).await
        }
        Commands::Cancel { workflow_id } => {
            let parsed = Uuid::parse_str(&workflow_id)
                .with_context(|| format!("invalid workflow ID: {workflow_id}"));
            match parsed {
                Ok(id) => workflow_db::cancel_workflow(&db_pool, id)
                    .await
                    .map(|()| println!("Workflow {workflow_id} cancelled."))
                    .map_err(Into::into),
                Err(e) => Err(e),
            }
        }
        Commands::Orchestrate => {
            let planner_url = match resolved.require_planner_url() {
                Ok(url) => url.to_owned(),
                Err(e) => fail(e, exit::CONFIG),
            };
            runtime_cmds::run_orchestrate(
                db_pool.clone(),
                fabric.clone(),
                Arc::new(HttpPlanner::new(planner_url)),
                &core,
                EvaluatorConfig::default(),
            )
            .await
        }
        Commands::Executor {
            id,
            capabilities,
            concurrency,
        } => {
            let executor_id = id.unwrap_or_else(|| {
                format!("exec-{}", &Uuid::new_v4().simple().to_string()[..8])
            });
            let mut exec_config =
                ExecutorConfig::from_core(&core, executor_id, parse_list(&capabilities));
            exec_config.max_concurrent = concurrency;
            runtime_cmds::run_executor(
                db_pool.clone(),
                fabric.clone(),
                Arc::new(builtin_registry()),
                exec_config,
            )
            .await
        }
        Commands::Evaluator { stderr_whitelist } => {
            let eval_config = EvaluatorConfig {
                stderr_whitelist: stderr_whitelist.as_deref().map(parse_list).unwrap_or_default(),
                ..EvaluatorConfig::default()
            };
            runtime_cmds::run_evaluator(db_pool.clone(), fabric.clone(), eval_config).await
        }
        Commands::Serve { bind, port } => {
            let planner_url = match resolved.require_planner_url() {
                Ok(url) => url.to_owned(),
                Err(e) => fail(e, exit::CONFIG),
            };
            let orchestrator = Arc::new(Orchestrator::new(
                db_pool.clone(),
                fabric.clone(),
                Arc::new(HttpPlanner::new(planner_url)),
                OrchestratorConfig::from_core(&core),
                EvaluatorConfig::default(),
            ));
            let state = Arc::new(serve_cmd::ServeState {
                pool: db_pool.clone(),
                orchestrator,
            });
            serve_cmd::run_serve(state, &bind, port).await
        }
    };

    db_pool.close().await;

    if let Err(e) = result {
        let code = exit_code_for(&e);
        fail(e, code);
    }

    Ok(())
}
