use std::sync::Arc;

use clap::{Parser, Subcommand};
use mistral_core::config::MistralConfig;
use mistral_core::AuthContext;
use mistral_db::{get_named_locks, jobs, Args as JobArgs, Database, JobFilter};
use mistral_scheduler::{DefaultScheduler, Job, LegacyScheduler, PostTxQueue, Registry};
use serde_json::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mistral-node", about = "Run and inspect the deferred-work scheduler")]
struct Cli {
    /// Config file (falls back to MISTRAL_CONFIG, then ~/.mistral/mistral.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the schedulers until Ctrl-C.
    Run,
    /// Persist a job for any running node to pick up.
    Schedule {
        #[arg(long)]
        func: String,
        #[arg(long)]
        factory: Option<String>,
        /// Delay in seconds.
        #[arg(long, default_value_t = 0.0)]
        after: f64,
        #[arg(long)]
        key: Option<String>,
        /// `name=value`; the value is parsed as JSON, or kept as a string.
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<(String, Value)>,
        /// Store as a delayed call for the legacy scheduler.
        #[arg(long)]
        legacy: bool,
    },
    /// List scheduled jobs.
    Jobs {
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        processing: Option<bool>,
    },
    /// List named locks currently held.
    Locks {
        #[arg(long)]
        name: Option<String>,
    },
}

fn parse_arg(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mistral_node=info,mistral_scheduler=info,mistral_db=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = MistralConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        MistralConfig::default()
    });

    ensure_parent_dir(&config.database.path);
    info!(path = %config.database.path, "opening SQLite database");
    let db = Database::open(config.database.clone())?;

    match cli.command {
        Command::Run => run(db, config).await,
        Command::Schedule {
            func,
            factory,
            after,
            key,
            args,
            legacy,
        } => {
            let mut job = Job::new(func)?.run_after(after);
            if let Some(factory) = factory {
                job = job.factory(factory);
            }
            if let Some(key) = key {
                job = job.key(key);
            }
            job = job.args(args.into_iter().collect::<JobArgs>());
            schedule(db, config, job, legacy).await
        }
        Command::Jobs { key, processing } => {
            let filter = JobFilter { key, processing };
            let rows = db.transaction(true, |s| jobs::get_scheduled_jobs(s, &filter))?;
            for job in &rows {
                println!(
                    "{}  {}  execute_at={}  captured={}  key={}",
                    job.id,
                    job.func_name,
                    job.execute_at.to_rfc3339(),
                    job.captured_at.is_some(),
                    job.key.as_deref().unwrap_or("-"),
                );
            }
            println!("{} job(s)", rows.len());
            Ok(())
        }
        Command::Locks { name } => {
            let locks = db.transaction(true, |s| get_named_locks(s, name.as_deref()))?;
            for lock in &locks {
                println!("{}  {}  since {}", lock.id, lock.name, lock.created_at.to_rfc3339());
            }
            println!("{} lock(s)", locks.len());
            Ok(())
        }
    }
}

/// Targets this node knows how to run.
fn build_registry() -> Arc<Registry> {
    let registry = Registry::new();
    registry.register_function("log_message", |ctx, args| {
        let user = ctx
            .auth
            .as_ref()
            .and_then(|a| a.user_id.as_deref())
            .unwrap_or("-");
        info!(user, args = %serde_json::Value::Object(args), "log_message");
        Ok(())
    });
    Arc::new(registry)
}

async fn run(db: Database, config: MistralConfig) -> anyhow::Result<()> {
    let registry = build_registry();
    let post_tx = PostTxQueue::new(db.clone());

    let scheduler = DefaultScheduler::new(db.clone(), Arc::clone(&registry), config.scheduler)?;
    scheduler.start()?;

    let legacy = if config.legacy_scheduler.enabled {
        let legacy = LegacyScheduler::new(db.clone(), registry, config.legacy_scheduler);
        legacy.start()?;
        Some(legacy)
    } else {
        None
    };

    info!("Mistral node running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler.stop(true).await;
    if let Some(legacy) = legacy {
        legacy.stop(true).await;
    }
    tokio::task::spawn_blocking(move || post_tx.wait()).await??;
    Ok(())
}

/// Persist `job` in one transaction and report it once that transaction
/// has committed.
async fn schedule(
    db: Database,
    config: MistralConfig,
    job: Job,
    legacy: bool,
) -> anyhow::Result<()> {
    let registry = build_registry();
    let auth = AuthContext::admin();
    let post_tx = PostTxQueue::new(db.clone());

    if legacy {
        let scheduler = LegacyScheduler::new(db.clone(), registry, config.legacy_scheduler);
        post_tx.run(Some(&auth), |ops| {
            db.transaction(false, |s| scheduler.schedule_call(&job, Some(&auth), Some(s)))?;
            let func = job.func_name.clone();
            ops.register_operation(
                move |_| {
                    info!(func = %func, "delayed call committed");
                    Ok(())
                },
                false,
            );
            Ok::<_, anyhow::Error>(())
        })?;
    } else {
        let scheduler = DefaultScheduler::new(db.clone(), registry, config.scheduler)?;
        let stored = scheduler.schedule(job, Some(&auth)).await?;
        post_tx.run(Some(&auth), |ops| {
            let id = stored.id.clone();
            ops.register_operation(
                move |_| {
                    info!(job_id = %id, "scheduled job committed");
                    Ok(())
                },
                false,
            );
            Ok::<_, anyhow::Error>(())
        })?;
        // the local timer dies with this process; a running node polls the row
        scheduler.stop(false).await;
    }

    post_tx.wait()?;
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
