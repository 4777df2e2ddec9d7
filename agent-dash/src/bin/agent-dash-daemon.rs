// agent-dash-daemon: detached runner for one agent session
//
// Responsibilities:
// - Parse the `--config=<json>` launch descriptor
// - Run the agent CLI in the session's working directory
// - Publish lifecycle records to the registry stream and output to the session stream
// - Turn SIGTERM/ctrl-c into a cancelled session
// - Flush every buffered record (or dead-letter it) before exiting

use agent_dash_lib::{
    session::{
        agent::{accumulate_usage, build_command, interpret_line, AgentCommand, AgentSignal},
        config::Config,
        protocol::{
            OutputChunk, OutputKind, RegistryEvent, SessionStatus, SessionStreamEvent, SpawnConfig,
            TokenUsage,
        },
    },
    stream::{DeadLetter, HttpStreamClient, StreamPublisher},
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "AGENT_DASH_LOG";
const DEFAULT_LOG_FILTER: &str = "info,agent_dash_lib=debug";

/// Stderr lines kept for the failure message
const STDERR_TAIL_LINES: usize = 20;

/// How the agent run ended
#[derive(Debug, Clone, PartialEq)]
enum SessionOutcome {
    Completed {
        exit_code: i32,
        token_usage: Option<TokenUsage>,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

impl SessionOutcome {
    fn status(&self) -> SessionStatus {
        match self {
            SessionOutcome::Completed { .. } => SessionStatus::Completed,
            SessionOutcome::Failed { .. } => SessionStatus::Failed,
            SessionOutcome::Cancelled => SessionStatus::Cancelled,
        }
    }
}

/// Per-run bookkeeping while output streams in
struct SessionRun<'a> {
    publisher: &'a StreamPublisher,
    config: &'a SpawnConfig,
    cli_session_id: Option<String>,
    status: SessionStatus,
    usage: Option<TokenUsage>,
    agent_error: Option<String>,
    stderr_tail: VecDeque<String>,
}

impl<'a> SessionRun<'a> {
    fn new(publisher: &'a StreamPublisher, config: &'a SpawnConfig) -> Self {
        Self {
            publisher,
            config,
            cli_session_id: None,
            status: SessionStatus::Pending,
            usage: None,
            agent_error: None,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    async fn publish(&self, event: SessionStreamEvent) {
        if let Err(e) = self
            .publisher
            .publish_session(&self.config.session_id, &event)
            .await
        {
            tracing::warn!(session_id = %self.config.session_id, error = %e, "failed to publish session event");
        }
    }

    async fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        tracing::debug!(session_id = %self.config.session_id, from = %self.status, to = %status, "status changed");
        self.status = status;
        self.publish(SessionStreamEvent::status(status)).await;
    }

    async fn on_line(&mut self, kind: OutputKind, line: String) {
        if kind == OutputKind::Stderr {
            if self.stderr_tail.len() == STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.clone());
        }

        let signals = if kind == OutputKind::Stdout {
            interpret_line(self.config.agent_type, &line)
        } else {
            Vec::new()
        };

        self.publish(SessionStreamEvent::output(OutputChunk::new(kind, line)))
            .await;

        for signal in signals {
            match signal {
                AgentSignal::CliSessionId(id) => {
                    // Only the first id identifies the run
                    if self.cli_session_id.is_none() {
                        tracing::info!(session_id = %self.config.session_id, cli_session_id = %id, "agent session started");
                        self.cli_session_id = Some(id.clone());
                        self.publish(SessionStreamEvent::CliSessionId {
                            timestamp: Utc::now(),
                            cli_session_id: id,
                        })
                        .await;
                    }
                }
                AgentSignal::Status(status) => self.set_status(status).await,
                AgentSignal::Usage(usage) => {
                    accumulate_usage(self.usage.get_or_insert_with(TokenUsage::default), &usage);
                }
                AgentSignal::Error(message) => {
                    tracing::warn!(session_id = %self.config.session_id, error = %message, "agent reported error");
                    self.agent_error = Some(message);
                }
            }
        }
    }

    fn failure_text(&self, exit: &str) -> String {
        if let Some(error) = &self.agent_error {
            return error.clone();
        }
        let tail: Vec<&str> = self.stderr_tail.iter().map(String::as_str).collect();
        if tail.is_empty() {
            exit.to_string()
        } else {
            format!("{}: {}", exit, tail.join("\n"))
        }
    }
}

async fn forward_lines<R>(reader: R, kind: OutputKind, tx: mpsc::Sender<(OutputKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((kind, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(?kind, error = %e, "failed to read agent output");
                break;
            }
        }
    }
}

/// Run the agent to completion (or until `shutdown` resolves), publishing as it goes
async fn run_agent<S>(
    publisher: &StreamPublisher,
    config: &SpawnConfig,
    command: AgentCommand,
    shutdown: S,
) -> SessionOutcome
where
    S: Future<Output = ()>,
{
    let mut run = SessionRun::new(publisher, config);

    let spawned = Command::new(&command.program)
        .args(&command.args)
        .current_dir(&config.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let error = format!("failed to launch {}: {}", command.program, e);
            tracing::error!(session_id = %config.session_id, %error);
            run.publish(SessionStreamEvent::output(OutputChunk::new(
                OutputKind::System,
                error.clone(),
            )))
            .await;
            return SessionOutcome::Failed { error };
        }
    };

    tracing::info!(
        session_id = %config.session_id,
        program = %command.program,
        pid = ?child.id(),
        "agent started"
    );
    run.set_status(SessionStatus::Running).await;

    let (tx, mut rx) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, OutputKind::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, OutputKind::Stderr, tx.clone()));
    }
    drop(tx);

    tokio::pin!(shutdown);
    let mut cancelled = false;

    // Drain output until both pipes close
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some((kind, line)) => run.on_line(kind, line).await,
                None => break,
            },
            _ = &mut shutdown => {
                cancelled = true;
                break;
            }
        }
    }

    let exit = if cancelled {
        None
    } else {
        tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut shutdown => None,
        }
    };

    let Some(exit) = exit else {
        tracing::info!(session_id = %config.session_id, "cancelling agent");
        if let Err(e) = child.start_kill() {
            tracing::warn!(session_id = %config.session_id, error = %e, "failed to kill agent");
        }
        let _ = child.wait().await;
        return SessionOutcome::Cancelled;
    };

    match exit {
        Ok(status) if status.success() && run.agent_error.is_none() => SessionOutcome::Completed {
            exit_code: status.code().unwrap_or(0),
            token_usage: run.usage.clone(),
        },
        Ok(status) => SessionOutcome::Failed {
            error: run.failure_text(&format!("agent exited with {}", status)),
        },
        Err(e) => SessionOutcome::Failed {
            error: format!("failed to wait for agent: {}", e),
        },
    }
}

fn terminal_event(config: &SpawnConfig, outcome: &SessionOutcome) -> RegistryEvent {
    let session_id = config.session_id.clone();
    let timestamp = Utc::now();
    match outcome {
        SessionOutcome::Completed {
            exit_code,
            token_usage,
        } => RegistryEvent::SessionCompleted {
            session_id,
            timestamp,
            metadata: Some(serde_json::json!({
                "exitCode": exit_code,
                "agentType": config.agent_type,
            })),
            token_usage: token_usage.clone(),
        },
        SessionOutcome::Failed { error } => RegistryEvent::SessionFailed {
            session_id,
            timestamp,
            error: error.clone(),
        },
        SessionOutcome::Cancelled => RegistryEvent::SessionCancelled {
            session_id,
            timestamp,
        },
    }
}

/// Publish the terminal records, then flush and close everything.
///
/// Whatever the final flush couldn't deliver ends up in the publisher's
/// dead letters.
async fn finish(publisher: &StreamPublisher, config: &SpawnConfig, outcome: &SessionOutcome) {
    let session_id = &config.session_id;

    if let Err(e) = publisher
        .publish_session(session_id, &SessionStreamEvent::status(outcome.status()))
        .await
    {
        tracing::warn!(%session_id, error = %e, "failed to publish final status");
    }
    if let Err(e) = publisher
        .publish_registry(&terminal_event(config, outcome))
        .await
    {
        tracing::warn!(%session_id, error = %e, "failed to publish terminal registry record");
    }

    if let Err(e) = publisher.close_session(session_id).await {
        tracing::warn!(%session_id, error = %e, "failed to flush session stream");
    }
    if let Err(e) = publisher.close().await {
        tracing::warn!(%session_id, error = %e, "final flush failed");
        let drained = publisher.drain_unflushed(&e.to_string()).await;
        tracing::warn!(%session_id, records = drained, "undelivered records moved to dead letters");
    }
}

fn write_dead_letters(path: &Path, dead_letters: &[DeadLetter]) -> Result<()> {
    if dead_letters.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open dead-letter file: {}", path.display()))?;

    for letter in dead_letters {
        for record in &letter.records {
            let record = serde_json::from_str::<serde_json::Value>(record)
                .unwrap_or_else(|_| serde_json::Value::String(record.clone()));
            let line = serde_json::json!({
                "destination": letter.destination,
                "error": letter.error,
                "record": record,
            });
            writeln!(file, "{}", line)
                .with_context(|| format!("Failed to write dead-letter file: {}", path.display()))?;
        }
    }
    Ok(())
}

fn init_logging(config: &Config, session_id: &str) -> Result<()> {
    let path = config.session_log_file(session_id);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = terminate.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let spawn_config =
        SpawnConfig::from_args(std::env::args()).context("Invalid daemon arguments")?;

    let config = Config::from_env();
    config
        .ensure_dirs()
        .context("Failed to create state directories")?;
    init_logging(&config, &spawn_config.session_id)?;

    let session_id = spawn_config.session_id.clone();
    tracing::info!(
        %session_id,
        agent = %spawn_config.agent_type,
        nonce = %spawn_config.nonce,
        stream_url = %spawn_config.stream_url,
        "daemon starting"
    );

    let client = HttpStreamClient::new(spawn_config.stream_url.clone())
        .context("Failed to create stream client")?;
    let publisher = Arc::new(StreamPublisher::new(
        Arc::new(client),
        config.publisher.clone(),
    ));
    publisher.start_auto_flush();

    let created = RegistryEvent::SessionCreated {
        session_id: session_id.clone(),
        timestamp: Utc::now(),
        agent_type: spawn_config.agent_type,
        prompt: spawn_config.prompt.clone(),
        model: spawn_config.model.clone(),
        working_dir: spawn_config.working_dir.clone(),
    };
    if let Err(e) = publisher.publish_registry(&created).await {
        tracing::warn!(%session_id, error = %e, "failed to publish session_created");
    }

    let command = build_command(&spawn_config);
    let outcome = run_agent(&publisher, &spawn_config, command, shutdown_signal()).await;
    tracing::info!(%session_id, status = %outcome.status(), "agent finished");

    finish(&publisher, &spawn_config, &outcome).await;

    let dead_letters = publisher.take_dead_letters();
    if !dead_letters.is_empty() {
        let path = config.dead_letter_file(&session_id);
        tracing::error!(
            %session_id,
            batches = dead_letters.len(),
            path = %path.display(),
            "writing undelivered records"
        );
        write_dead_letters(&path, &dead_letters)?;
    }

    if let SessionOutcome::Failed { error } = &outcome {
        tracing::info!(%session_id, %error, "daemon exiting after failed session");
        std::process::exit(1);
    }

    tracing::info!(%session_id, "daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_dash_lib::session::config::PublisherConfig;
    use agent_dash_lib::session::protocol::{session_stream_key, AgentType, REGISTRY_STREAM_KEY};
    use agent_dash_lib::stream::MemoryStream;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn test_setup(agent: AgentType) -> (Arc<MemoryStream>, StreamPublisher, SpawnConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStream::new());
        let publisher = StreamPublisher::new(store.clone(), PublisherConfig::immediate());
        let config = SpawnConfig::new(
            "sess-1",
            agent,
            "do it",
            temp_dir.path(),
            "http://127.0.0.1:1",
        );
        (store, publisher, config, temp_dir)
    }

    fn session_events(store: &MemoryStream) -> Vec<SessionStreamEvent> {
        store.decoded(&session_stream_key("sess-1"))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completed_run_publishes_output_and_usage() {
        let (store, publisher, config, _temp) = test_setup(AgentType::Claude);
        let script = r#"
            echo '{"type":"system","subtype":"init","session_id":"cli-1"}'
            echo '{"type":"system","subtype":"init","session_id":"cli-2"}'
            echo '{"type":"assistant","message":{}}'
            echo '{"type":"result","subtype":"success","usage":{"input_tokens":7,"output_tokens":3}}'
            pwd
        "#;

        let outcome = run_agent(&publisher, &config, sh(script), std::future::pending()).await;
        let SessionOutcome::Completed { token_usage, .. } = &outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert_eq!(token_usage.as_ref().unwrap().input_tokens, 7);

        finish(&publisher, &config, &outcome).await;

        let events = session_events(&store);
        let cli_ids: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionStreamEvent::CliSessionId { cli_session_id, .. } => Some(cli_session_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(cli_ids, vec!["cli-1"]);

        let outputs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionStreamEvent::Output { chunk, .. } => Some(chunk.content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs.len(), 5);
        let cwd = std::fs::canonicalize(&config.working_dir).unwrap();
        assert_eq!(
            std::fs::canonicalize(outputs.last().unwrap()).unwrap(),
            cwd
        );

        let statuses: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionStreamEvent::StatusChanged { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                SessionStatus::Running,
                SessionStatus::Working,
                SessionStatus::Idle,
                SessionStatus::Completed
            ]
        );

        let registry: Vec<RegistryEvent> = store.decoded(REGISTRY_STREAM_KEY);
        assert!(matches!(
            registry.last(),
            Some(RegistryEvent::SessionCompleted { token_usage: Some(_), .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr_tail() {
        let (store, publisher, config, _temp) = test_setup(AgentType::Codex);
        let outcome = run_agent(
            &publisher,
            &config,
            sh("echo 'model not found' >&2; exit 3"),
            std::future::pending(),
        )
        .await;

        let SessionOutcome::Failed { error } = &outcome else {
            panic!("unexpected outcome: {:?}", outcome);
        };
        assert!(error.contains("model not found"), "error: {}", error);

        finish(&publisher, &config, &outcome).await;
        let registry: Vec<RegistryEvent> = store.decoded(REGISTRY_STREAM_KEY);
        assert_eq!(registry.last().unwrap().status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_agent_binary_fails() {
        let (_store, publisher, config, _temp) = test_setup(AgentType::Claude);
        let command = AgentCommand {
            program: "/definitely/not/an/agent".into(),
            args: Vec::new(),
        };
        let outcome = run_agent(&publisher, &config, command, std::future::pending()).await;
        assert!(
            matches!(&outcome, SessionOutcome::Failed { error } if error.contains("failed to launch"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_cancels_running_agent() {
        let (store, publisher, config, _temp) = test_setup(AgentType::Claude);
        let started = std::time::Instant::now();
        let outcome = run_agent(
            &publisher,
            &config,
            sh("exec sleep 30"),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;

        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));

        finish(&publisher, &config, &outcome).await;
        let registry: Vec<RegistryEvent> = store.decoded(REGISTRY_STREAM_KEY);
        assert!(matches!(
            registry.last(),
            Some(RegistryEvent::SessionCancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_finish_during_outage_dead_letters_terminal_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStream::new());
        let publisher = StreamPublisher::new(
            store.clone(),
            PublisherConfig {
                buffer_size: 50,
                flush_interval: Duration::from_secs(60),
                max_flush_attempts: 10,
            },
        );
        let config = SpawnConfig::new(
            "sess-1",
            AgentType::Claude,
            "do it",
            temp_dir.path(),
            "http://127.0.0.1:1",
        );

        store.fail_next_appends(3);
        finish(&publisher, &config, &SessionOutcome::Cancelled).await;

        assert!(store.records(REGISTRY_STREAM_KEY).is_empty());
        assert_eq!(publisher.buffered(REGISTRY_STREAM_KEY), 0);
        assert_eq!(publisher.buffered(&session_stream_key("sess-1")), 0);

        let dead_letters = publisher.take_dead_letters();
        let path = temp_dir.path().join("dead.jsonl");
        write_dead_letters(&path, &dead_letters).unwrap();

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        let registry_line = lines
            .iter()
            .find(|l| l["destination"] == REGISTRY_STREAM_KEY)
            .expect("terminal registry record dead-lettered");
        let terminal: RegistryEvent =
            serde_json::from_value(registry_line["record"].clone()).unwrap();
        assert!(matches!(terminal, RegistryEvent::SessionCancelled { .. }));
        assert!(lines
            .iter()
            .any(|l| l["destination"] == session_stream_key("sess-1").as_str()));
    }

    #[test]
    fn test_dead_letters_written_as_jsonl() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sess.jsonl");
        let letters = vec![DeadLetter {
            destination: "sessions/s".into(),
            records: vec![r#"{"type":"status_changed"}"#.into(), "raw".into()],
            error: "503".into(),
        }];

        write_dead_letters(&path, &letters).unwrap();
        write_dead_letters(&path, &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["record"]["type"], "status_changed");
        assert_eq!(lines[1]["record"], "raw");
        assert_eq!(lines[1]["destination"], "sessions/s");
    }
}
