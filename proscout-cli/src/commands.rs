//! CLI subcommand handlers.

use crate::{Cli, Commands, ConfigAction};
use proscout_core::{
    EventBus, FileJobQueue, FileRunStore, JobQueue, Orchestrator, Reconciler, ResearchRun,
    ResearchTools, ResilientTools, RunController, RunStore, ScoutConfig, ScriptedTools,
    ToolScript, WorkerPool,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Everything a subcommand needs, wired against the on-disk state directory.
struct Services {
    config: Arc<ScoutConfig>,
    store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    events: EventBus,
}

impl Services {
    /// The store lays out its own tables under `state_dir`.
    fn open(config: ScoutConfig, state_dir: &Path) -> Self {
        let store: Arc<dyn RunStore> = Arc::new(FileRunStore::new(state_dir));
        let queue: Arc<dyn JobQueue> = Arc::new(FileJobQueue::new(state_dir.join("queue.json")));
        Self {
            config: Arc::new(config),
            store,
            queue,
            events: EventBus::default(),
        }
    }

    fn controller(&self) -> RunController {
        RunController::new(
            self.store.clone(),
            self.queue.clone(),
            self.events.clone(),
            self.config.graph.clone(),
        )
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.queue.clone(),
            self.config.graph.clone(),
            self.config.recovery.clone(),
        )
    }

    fn worker_pool(&self, tools: Arc<dyn ResearchTools>, concurrency: usize) -> WorkerPool {
        let orchestrator = Arc::new(Orchestrator::new(
            self.store.clone(),
            tools,
            self.events.clone(),
            self.config.clone(),
        ));
        WorkerPool::new(orchestrator, self.queue.clone(), concurrency)
    }
}

fn load(workspace: &Path) -> anyhow::Result<ScoutConfig> {
    let config = proscout_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn fixture_path(explicit: Option<PathBuf>, workspace: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| workspace.join(".proscout").join("fixture.json"))
}

/// Build the tool backend: scripted answers behind retry and circuit breaking.
fn build_tools(config: &ScoutConfig, fixture: &Path) -> anyhow::Result<Arc<dyn ResearchTools>> {
    let script = if fixture.exists() {
        ToolScript::from_json_file(fixture)
            .map_err(|e| anyhow::anyhow!("Failed to read fixture {}: {}", fixture.display(), e))?
    } else {
        warn!(path = %fixture.display(), "No tool fixture found; every lookup will miss");
        ToolScript::default()
    };
    Ok(Arc::new(ResilientTools::new(
        ScriptedTools::new(script),
        config.tools.retry_policy(),
        config.tools.breaker_settings(),
    )))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_run_line(run: &ResearchRun) {
    let phase = run
        .current_phase
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<9}  {:<16}  step {:>3}  {}  {}",
        run.id,
        run.status,
        phase,
        run.step_count,
        run.subject_id,
        run.error.as_deref().unwrap_or("")
    );
}

/// Handle a CLI subcommand.
pub async fn handle_command(cli: Cli, workspace: &Path) -> anyhow::Result<()> {
    let command = match cli.command {
        Commands::Config { action } => return handle_config(action, workspace),
        command => command,
    };

    let mut config = load(workspace)?;
    if let Some(dir) = cli.state_dir {
        config.storage.state_dir = Some(dir);
    }
    let state_dir = config.storage.resolve_state_dir();
    let services = Services::open(config, &state_dir);

    match command {
        Commands::Trigger { subject, owner } => {
            let run = services.controller().trigger(&subject, &owner).await?;
            println!("Queued run {} for subject '{}'", run.id, run.subject_id);
            Ok(())
        }
        Commands::Pause { run_id } => {
            let run = services.controller().pause(run_id).await?;
            println!("Pause requested for run {} (phase {:?})", run.id, run.current_phase);
            Ok(())
        }
        Commands::Resume { run_id } => {
            let run = services.controller().resume(run_id).await?;
            println!("Queued run {} to resume", run.id);
            Ok(())
        }
        Commands::Cancel { run_id } => {
            let run = services.controller().cancel(run_id).await?;
            if run.cancel_requested {
                println!("Cancellation requested for run {}", run.id);
            } else {
                println!("Run {} cancelled", run.id);
            }
            Ok(())
        }
        Commands::Status { run_id } => {
            let run = services.controller().status(run_id).await?;
            print_json(&run)?;
            if let Some(result) = services.store.load_result(run_id).await? {
                print_json(&result)?;
            }
            Ok(())
        }
        Commands::List => {
            let runs = services.controller().list().await?;
            if runs.is_empty() {
                println!("No runs.");
            }
            for run in &runs {
                print_run_line(run);
            }
            Ok(())
        }
        Commands::Work {
            follow,
            concurrency,
        } => {
            let fixture = fixture_path(cli.fixture, workspace);
            let tools = build_tools(&services.config, &fixture)?;
            let concurrency = concurrency.unwrap_or(services.config.workers.concurrency);
            let pool = services.worker_pool(tools, concurrency);
            if follow {
                work_until_interrupted(&services, pool).await
            } else {
                let processed = pool.run_until_idle().await?;
                println!("Processed {} job(s)", processed);
                Ok(())
            }
        }
        Commands::Reconcile { now } => {
            let reconciler = services.reconciler();
            let report = if now {
                reconciler.reconcile().await?
            } else {
                reconciler.run_at_startup().await?
            };
            print_json(&report)?;
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// Reconcile once, then keep workers polling until Ctrl-C.
async fn work_until_interrupted(services: &Services, pool: WorkerPool) -> anyhow::Result<()> {
    let report = services.reconciler().run_at_startup().await?;
    if report.changes() > 0 {
        info!(changes = report.changes(), "Startup reconciliation applied");
    }

    let mut events = services.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    run_id = %event.run_id,
                    subject_id = %event.subject_id,
                    kind = ?event.kind,
                    "Lifecycle event"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = Arc::new(pool).spawn(shutdown_rx);
    info!(workers = handles.len(), "Workers running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down workers");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".proscout");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ScoutConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = proscout_core::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proscout_core::RunStatus;

    #[test]
    fn test_fixture_path_defaults_to_workspace() {
        let ws = Path::new("/tmp/ws");
        assert_eq!(
            fixture_path(None, ws),
            PathBuf::from("/tmp/ws/.proscout/fixture.json")
        );
        assert_eq!(
            fixture_path(Some(PathBuf::from("f.json")), ws),
            PathBuf::from("f.json")
        );
    }

    #[test]
    fn test_missing_fixture_builds_empty_backend() {
        let dir = tempfile::tempdir().unwrap();
        let tools = build_tools(&ScoutConfig::default(), &dir.path().join("absent.json"));
        assert!(tools.is_ok());
    }

    #[test]
    fn test_config_init_writes_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        handle_config(ConfigAction::Init, dir.path()).unwrap();
        let written = dir.path().join(".proscout").join("config.toml");
        assert!(written.exists());
        let config = load(dir.path()).unwrap();
        assert_eq!(config.graph, ScoutConfig::default().graph);
    }

    #[tokio::test]
    async fn test_state_survives_between_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let first = Services::open(ScoutConfig::default(), dir.path());
        let run = first.controller().trigger("item-9", "owner-9").await.unwrap();

        let second = Services::open(ScoutConfig::default(), dir.path());
        let reloaded = second.controller().status(run.id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Pending);
        assert!(second.queue.contains_run(run.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_rows_live_directly_under_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let services = Services::open(ScoutConfig::default(), dir.path());
        let run = services.controller().trigger("item-3", "owner-3").await.unwrap();

        let row = dir.path().join("runs").join(format!("{}.json", run.id));
        assert!(row.is_file());
        assert!(!dir.path().join("runs").join("runs").exists());
        assert!(dir.path().join("queue.json").is_file());
    }
}
