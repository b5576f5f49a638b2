use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wuselig_audit::{read_entries, AuditLog, AUDIT_FILE};
use wuselig_core::{AgentResult, AgentTask, Event, WorkItemId};
use wuselig_orchestrator::{
    order_window, JsonlOutbox, Orchestrator, OrchestratorConfig, RecordingOutbound,
};
use wuselig_store::{FileWorkflowStore, WorkflowStore};

#[derive(Parser)]
#[command(name = "wuselig", about = "Wuselig: event-driven agent workflow orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wuselig.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a batch of inbound events (one JSON event per line)
    Process {
        /// Events file in JSON-lines format
        events: PathBuf,
    },
    /// Feed agent results reported by the execution environment back in
    Report {
        /// JSON-lines file of `{"task": ..., "result": ...}` records
        results: PathBuf,
    },
    /// Deliver effects left pending by an interrupted run
    Recover,
    /// Show the workflow state of a work item
    Status {
        /// Repository in owner/name form
        repo: String,
        /// Issue or pull request number
        number: u64,
    },
    /// List all work items with a workflow
    List,
    /// Print audit records
    Audit {
        /// Only records for this delivery id
        #[arg(long)]
        delivery_id: Option<String>,
    },
    /// Rebuild a workflow from its history and compare with the stored state
    Replay {
        /// Repository in owner/name form
        repo: String,
        /// Issue or pull request number
        number: u64,
    },
}

#[derive(Debug, Deserialize)]
struct WuseligConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(flatten)]
    orchestrator: OrchestratorConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl WuseligConfig {
    fn parse(s: &str) -> anyhow::Result<Self> {
        let config: WuseligConfig = toml::from_str(s)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => Self::parse(&s)
                .with_context(|| format!("Invalid config file '{}'", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Self::parse("")
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            )),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox.jsonl")
    }
}

/// One line of a `report` input file.
#[derive(Debug, Serialize, Deserialize)]
struct ResultRecord {
    task: AgentTask,
    result: AgentResult,
}

/// Parse a JSON-lines file, naming the offending line on error.
fn parse_lines<T: serde::de::DeserializeOwned>(data: &str) -> anyhow::Result<Vec<T>> {
    data.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid record", n + 1))
        })
        .collect()
}

async fn build_orchestrator(
    config: &WuseligConfig,
) -> anyhow::Result<(Orchestrator, Arc<AuditLog>)> {
    let store = Arc::new(FileWorkflowStore::new(config.state_dir()).await?);
    let outbox = Arc::new(JsonlOutbox::open(config.outbox_path()).await?);
    let audit = Arc::new(AuditLog::new(config.audit_dir()));
    let orchestrator = Orchestrator::new(&config.orchestrator, store, outbox, audit.clone())?;
    Ok((orchestrator, audit))
}

/// Drop the orchestrator and wait until its audit records are on disk.
async fn shutdown(orchestrator: Orchestrator, audit: Arc<AuditLog>) {
    drop(orchestrator);
    match Arc::try_unwrap(audit) {
        Ok(audit) => audit.close().await,
        Err(_) => warn!("audit log still shared; pending records may be lost"),
    }
}

async fn handle_all(orchestrator: &Orchestrator, events: &[Event]) -> (usize, usize) {
    let (mut handled, mut failed) = (0, 0);
    for event in events {
        match orchestrator.handle(event).await {
            Ok(outcome) => {
                handled += 1;
                println!(
                    "{} {} -> {}{}",
                    event.delivery_id,
                    event.work_item,
                    outcome.action,
                    outcome
                        .state
                        .map(|s| format!(" [{} v{}]", s.phase, s.version))
                        .unwrap_or_default()
                );
            }
            Err(e) => {
                failed += 1;
                println!("{} {} -> error: {e}", event.delivery_id, event.work_item);
            }
        }
    }
    (handled, failed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = WuseligConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Process { events } => {
            let data = tokio::fs::read_to_string(&events)
                .await
                .with_context(|| format!("Failed to read events file '{}'", events.display()))?;
            let mut events: Vec<Event> = parse_lines(&data)?;
            order_window(&mut events);

            let (orchestrator, audit) = build_orchestrator(&config).await?;
            orchestrator.recover().await?;
            let (handled, failed) = handle_all(&orchestrator, &events).await;
            info!(handled, failed, "batch processed");
            shutdown(orchestrator, audit).await;
            if failed > 0 {
                anyhow::bail!("{failed} event(s) were not applied and must be redelivered");
            }
        }
        Commands::Report { results } => {
            let data = tokio::fs::read_to_string(&results)
                .await
                .with_context(|| format!("Failed to read results file '{}'", results.display()))?;
            let records: Vec<ResultRecord> = parse_lines(&data)?;
            let events: Vec<Event> = records
                .into_iter()
                .map(|r| r.result.into_event(&r.task))
                .collect();

            let (orchestrator, audit) = build_orchestrator(&config).await?;
            let (handled, failed) = handle_all(&orchestrator, &events).await;
            info!(handled, failed, "results processed");
            shutdown(orchestrator, audit).await;
            if failed > 0 {
                anyhow::bail!("{failed} result(s) were not applied and must be redelivered");
            }
        }
        Commands::Recover => {
            let (orchestrator, audit) = build_orchestrator(&config).await?;
            let delivered = orchestrator.recover().await?;
            println!("Delivered {delivered} pending effect(s).");
            shutdown(orchestrator, audit).await;
        }
        Commands::Status { repo, number } => {
            let store = FileWorkflowStore::new(config.state_dir()).await?;
            let id = WorkItemId::new(repo, number);
            match store.get(&id).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("No workflow for {id}."),
            }
        }
        Commands::List => {
            let store = FileWorkflowStore::new(config.state_dir()).await?;
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No workflows.");
            }
            for id in ids {
                if let Some(state) = store.get(&id).await? {
                    println!(
                        "{id}  {}  v{}  retries={}  pending={}",
                        state.phase,
                        state.version,
                        state.retry_count,
                        state.outbox.len()
                    );
                }
            }
        }
        Commands::Audit { delivery_id } => {
            let path = config.audit_dir().join(AUDIT_FILE);
            let entries = read_entries(&path)
                .await
                .with_context(|| format!("Failed to read audit log '{}'", path.display()))?;
            for entry in entries
                .iter()
                .filter(|e| delivery_id.as_deref().map_or(true, |d| e.delivery_id == d))
            {
                println!("{}", serde_json::to_string(entry)?);
            }
        }
        Commands::Replay { repo, number } => {
            let store = FileWorkflowStore::new(config.state_dir()).await?;
            let id = WorkItemId::new(repo, number);
            let Some(stored) = store.get(&id).await? else {
                anyhow::bail!("No workflow for {id}");
            };
            let orchestrator = Orchestrator::new(
                &config.orchestrator,
                Arc::new(store),
                Arc::new(RecordingOutbound::new()),
                Arc::new(AuditLog::in_memory()),
            )?;
            let replayed = orchestrator.replay(&stored.history).await?;
            let replayed_phase = replayed.as_ref().map(|s| s.phase);
            println!(
                "{id}: stored phase {}, replayed phase {}",
                stored.phase,
                replayed_phase.map_or_else(|| "none".to_string(), |p| p.to_string())
            );
            if replayed_phase != Some(stored.phase) {
                anyhow::bail!("replay diverges from stored state for {id}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wuselig_core::{AgentKind, EventSource, Phase};

    #[test]
    fn test_config_defaults() {
        let config = WuseligConfig::parse("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.orchestrator, OrchestratorConfig::default());
        assert_eq!(config.outbox_path(), PathBuf::from("./data/outbox.jsonl"));
    }

    #[test]
    fn test_config_sections() {
        let config = WuseligConfig::parse(
            r#"
data_dir = "/var/lib/wuselig"
agents = ["planner"]

[retry]
max_retries = 1

[invoker]
max_duration_secs = 600
"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/wuselig"));
        assert_eq!(config.orchestrator.agents, vec![AgentKind::Planner]);
        assert_eq!(config.orchestrator.retry.max_retries, 1);
        assert_eq!(config.orchestrator.invoker.max_duration_secs, 600);
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        assert!(WuseligConfig::parse("max_cas_attempts = 0").is_err());
    }

    #[test]
    fn test_parse_lines_reports_line_number() {
        let event = Event::label_added(
            "d-1",
            WorkItemId::new("acme/widgets", 1),
            "agent:planner",
            EventSource::human("octocat"),
        );
        let good = serde_json::to_string(&event).unwrap();
        let parsed: Vec<Event> = parse_lines(&format!("{good}\n\n{good}\n")).unwrap();
        assert_eq!(parsed.len(), 2);

        let err = parse_lines::<Event>(&format!("{good}\n{{oops")).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_result_record_becomes_result_event() {
        let task = AgentTask::new(AgentKind::Planner, WorkItemId::new("acme/widgets", 1), 0, "d-1");
        let line = serde_json::to_string(&ResultRecord {
            task: task.clone(),
            result: AgentResult::success(Vec::new()),
        })
        .unwrap();
        let records: Vec<ResultRecord> = parse_lines(&line).unwrap();
        let event = records
            .into_iter()
            .map(|r| r.result.into_event(&r.task))
            .next()
            .unwrap();
        assert_eq!(event.delivery_id, task.result_delivery_id());
        assert!(matches!(
            event.kind,
            wuselig_core::EventKind::AgentCompleted {
                phase: Phase::Planning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_process_and_report_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = WuseligConfig {
            data_dir: tmp.path().to_path_buf(),
            orchestrator: OrchestratorConfig::default(),
        };
        let item = WorkItemId::new("acme/widgets", 42);

        let (orchestrator, audit) = build_orchestrator(&config).await.unwrap();
        let trigger = Event::label_added("d-1", item.clone(), "agent:planner", EventSource::human("octocat"));
        let (handled, failed) = handle_all(&orchestrator, &[trigger]).await;
        assert_eq!((handled, failed), (1, 0));
        shutdown(orchestrator, audit).await;

        let records = wuselig_orchestrator::read_outbox(&config.outbox_path())
            .await
            .unwrap();
        let task = match &records[0].effect {
            wuselig_core::Effect::Dispatch { task, .. } => task.clone(),
            other => panic!("unexpected effect {other:?}"),
        };

        let (orchestrator, audit) = build_orchestrator(&config).await.unwrap();
        let result = AgentResult::success(Vec::new()).into_event(&task);
        handle_all(&orchestrator, &[result]).await;
        let state = orchestrator.store().get(&item).await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::AwaitingApproval);
        shutdown(orchestrator, audit).await;

        let entries = read_entries(&config.audit_dir().join(AUDIT_FILE)).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
