//! Agent CLI invocation and interpretation of its JSON output.
//!
//! Both supported CLIs are run in their line-delimited JSON mode. Each stdout
//! line is forwarded verbatim as output; [`interpret_line`] additionally pulls
//! out the few facts the daemon publishes separately (native session id,
//! activity, token usage).

use serde_json::Value;

use crate::session::protocol::{AgentType, SessionStatus, SpawnConfig, TokenUsage};

/// Program and argv for one agent run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Something the daemon learned from one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSignal {
    CliSessionId(String),
    Status(SessionStatus),
    Usage(TokenUsage),
    /// The agent reported an error in-band
    Error(String),
}

/// Prompt text with the task reference prepended
pub fn effective_prompt(config: &SpawnConfig) -> String {
    match &config.task_path {
        Some(task_path) => format!("Task file: {}\n\n{}", task_path.display(), config.prompt),
        None => config.prompt.clone(),
    }
}

pub fn build_command(config: &SpawnConfig) -> AgentCommand {
    let prompt = effective_prompt(config);
    let resume_id = config
        .resume_session_id
        .as_ref()
        .filter(|_| config.resume);

    let mut args: Vec<String> = Vec::new();
    match config.agent_type {
        AgentType::Claude => {
            args.extend(["-p".to_string(), prompt]);
            args.extend(["--output-format", "stream-json", "--verbose"].map(String::from));
            if let Some(model) = &config.model {
                args.extend(["--model".to_string(), model.clone()]);
            }
            if let Some(id) = resume_id {
                args.extend(["--resume".to_string(), id.clone()]);
            }
        }
        AgentType::Codex => {
            args.extend(["exec", "--json"].map(String::from));
            if let Some(model) = &config.model {
                args.extend(["--model".to_string(), model.clone()]);
            }
            if let Some(id) = resume_id {
                args.extend(["resume".to_string(), id.clone()]);
            }
            args.push(prompt);
        }
    }

    AgentCommand {
        program: config.agent_type.program().to_string(),
        args,
    }
}

fn usage_field(usage: &Value, key: &str) -> u64 {
    usage.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn parse_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage_field(usage, "input_tokens"),
        output_tokens: usage_field(usage, "output_tokens"),
        cache_read_input_tokens: usage_field(usage, "cache_read_input_tokens")
            .max(usage_field(usage, "cached_input_tokens")),
        cache_creation_input_tokens: usage_field(usage, "cache_creation_input_tokens"),
    }
}

fn str_field<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// Extract signals from one stdout line; non-JSON lines yield nothing
pub fn interpret_line(agent: AgentType, line: &str) -> Vec<AgentSignal> {
    let Ok(record) = serde_json::from_str::<Value>(line.trim()) else {
        return Vec::new();
    };
    let Some(kind) = str_field(&record, "type") else {
        return Vec::new();
    };

    let mut signals = Vec::new();
    match (agent, kind) {
        (AgentType::Claude, "system") => {
            if str_field(&record, "subtype") == Some("init") {
                if let Some(id) = str_field(&record, "session_id") {
                    signals.push(AgentSignal::CliSessionId(id.to_string()));
                }
                signals.push(AgentSignal::Status(SessionStatus::Running));
            }
        }
        (AgentType::Claude, "assistant") | (AgentType::Codex, "turn.started") => {
            signals.push(AgentSignal::Status(SessionStatus::Working));
        }
        (AgentType::Claude, "result") => {
            if let Some(usage) = record.get("usage") {
                signals.push(AgentSignal::Usage(parse_usage(usage)));
            }
            if record.get("is_error").and_then(Value::as_bool) == Some(true) {
                let message = str_field(&record, "result")
                    .or_else(|| str_field(&record, "subtype"))
                    .unwrap_or("agent reported an error");
                signals.push(AgentSignal::Error(message.to_string()));
            }
            signals.push(AgentSignal::Status(SessionStatus::Idle));
        }
        (AgentType::Codex, "thread.started") => {
            if let Some(id) = str_field(&record, "thread_id") {
                signals.push(AgentSignal::CliSessionId(id.to_string()));
            }
            signals.push(AgentSignal::Status(SessionStatus::Running));
        }
        (AgentType::Codex, "turn.completed") => {
            if let Some(usage) = record.get("usage") {
                signals.push(AgentSignal::Usage(parse_usage(usage)));
            }
            signals.push(AgentSignal::Status(SessionStatus::Idle));
        }
        (AgentType::Codex, "turn.failed") | (AgentType::Codex, "error") => {
            let message = record
                .get("error")
                .and_then(|e| str_field(e, "message"))
                .or_else(|| str_field(&record, "message"))
                .unwrap_or("agent reported an error");
            signals.push(AgentSignal::Error(message.to_string()));
        }
        _ => {}
    }
    signals
}

/// Sum of usage reports over a run
pub fn accumulate_usage(total: &mut TokenUsage, usage: &TokenUsage) {
    total.input_tokens += usage.input_tokens;
    total.output_tokens += usage.output_tokens;
    total.cache_read_input_tokens += usage.cache_read_input_tokens;
    total.cache_creation_input_tokens += usage.cache_creation_input_tokens;
}
