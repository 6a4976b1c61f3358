//! Operator command parsing and dispatch.
//!
//! Commands are chat-style lines: `/agent verb key=value ...` plus the
//! registry-wide `/list`. Dispatch resolves the agent in an explicit
//! registry and applies the verb directly through the agent's control
//! handle; the bus sees a copy of each applied command on an audit topic,
//! but control never flows through the bus itself.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::info;

use crate::agent::{AgentState, ControlHandle, ParamMap};
use crate::bus::message::{topic, Message, Payload, Target};
use crate::bus::MessageBus;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("not a command: {0}")]
    NotACommand(String),
    #[error("empty command")]
    Empty,
    #[error("unknown verb '{0}'")]
    UnknownVerb(String),
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("malformed parameter '{0}', expected key=value")]
    MalformedParam(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerb {
    Start,
    Stop,
    Pause,
    Resume,
    Set,
    Update,
    Status,
    List,
}

impl CommandVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandVerb::Start => "start",
            CommandVerb::Stop => "stop",
            CommandVerb::Pause => "pause",
            CommandVerb::Resume => "resume",
            CommandVerb::Set => "set",
            CommandVerb::Update => "update",
            CommandVerb::Status => "status",
            CommandVerb::List => "list",
        }
    }
}

impl FromStr for CommandVerb {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, CommandError> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(CommandVerb::Start),
            "stop" => Ok(CommandVerb::Stop),
            "pause" => Ok(CommandVerb::Pause),
            "resume" => Ok(CommandVerb::Resume),
            "set" => Ok(CommandVerb::Set),
            "update" => Ok(CommandVerb::Update),
            "status" => Ok(CommandVerb::Status),
            "list" => Ok(CommandVerb::List),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }
}

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub agent: String,
    pub verb: CommandVerb,
    pub params: ParamMap,
}

/// Parse `/agent verb key=value ...`. Integer-looking values become JSON
/// numbers, everything else a string. `/list` needs no agent or verb.
pub fn parse_command(line: &str) -> Result<CommandInvocation, CommandError> {
    let line = line.trim();
    let Some(body) = line.strip_prefix('/') else {
        return Err(CommandError::NotACommand(line.to_string()));
    };
    let mut parts = body.split_whitespace();
    let agent = parts.next().ok_or(CommandError::Empty)?;
    if agent.eq_ignore_ascii_case("list") {
        return Ok(CommandInvocation {
            agent: String::new(),
            verb: CommandVerb::List,
            params: ParamMap::new(),
        });
    }
    let verb: CommandVerb = parts.next().ok_or(CommandError::Empty)?.parse()?;
    let mut params = ParamMap::new();
    for part in parts {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| CommandError::MalformedParam(part.to_string()))?;
        if key.is_empty() {
            return Err(CommandError::MalformedParam(part.to_string()));
        }
        let json = match value.parse::<i64>() {
            Ok(n) => serde_json::json!(n),
            Err(_) => serde_json::json!(value),
        };
        params.insert(key.to_string(), json);
    }
    Ok(CommandInvocation {
        agent: agent.to_string(),
        verb,
        params,
    })
}

/// What dispatch reports back to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    Status { agent: String, state: AgentState },
    Listing(Vec<(String, AgentState)>),
}

/// Explicit name → control-handle registry; the single place commands are
/// applied to agents.
pub struct AgentRegistry {
    bus: Arc<MessageBus>,
    entries: RwLock<BTreeMap<String, Arc<dyn ControlHandle>>>,
}

impl AgentRegistry {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, handle: Arc<dyn ControlHandle>) {
        let id = handle.id().to_string();
        info!(agent = %id, "agent registered");
        self.entries
            .write()
            .expect("registry poisoned")
            .insert(id, handle);
    }

    pub fn list(&self) -> Vec<(String, AgentState)> {
        self.entries
            .read()
            .expect("registry poisoned")
            .iter()
            .map(|(id, h)| (id.clone(), h.state()))
            .collect()
    }

    fn lookup(&self, agent: &str) -> Result<Arc<dyn ControlHandle>, CommandError> {
        self.entries
            .read()
            .expect("registry poisoned")
            .get(agent)
            .cloned()
            .ok_or_else(|| CommandError::UnknownAgent(agent.to_string()))
    }

    /// Apply a parsed command. Lifecycle verbs act on the control handle;
    /// every applied command is also published on its audit topic.
    pub async fn dispatch(&self, cmd: CommandInvocation) -> Result<CommandOutcome, CommandError> {
        if cmd.verb == CommandVerb::List {
            return Ok(CommandOutcome::Listing(self.list()));
        }
        let handle = self.lookup(&cmd.agent)?;
        info!(agent = %cmd.agent, verb = cmd.verb.as_str(), "dispatching command");
        let outcome = match cmd.verb {
            CommandVerb::Start => {
                handle.start().await;
                CommandOutcome::Applied
            }
            CommandVerb::Stop => {
                handle.stop().await;
                CommandOutcome::Applied
            }
            CommandVerb::Pause => {
                handle.pause().await;
                CommandOutcome::Applied
            }
            CommandVerb::Resume => {
                handle.resume().await;
                CommandOutcome::Applied
            }
            CommandVerb::Set | CommandVerb::Update => {
                handle.update(cmd.params.clone()).await;
                CommandOutcome::Applied
            }
            CommandVerb::Status => CommandOutcome::Status {
                agent: cmd.agent.clone(),
                state: handle.state(),
            },
            CommandVerb::List => unreachable!("handled above"),
        };
        // audit copy only; control was already applied above
        let audit = Message::new(
            "registry",
            Target::Agent(cmd.agent.clone()),
            Payload::Command(cmd.params),
        );
        self.bus
            .publish(&topic::command(&cmd.agent, cmd.verb.as_str()), audit)
            .await;
        Ok(outcome)
    }

    /// Parse and dispatch in one step.
    pub async fn dispatch_line(&self, line: &str) -> Result<CommandOutcome, CommandError> {
        let cmd = parse_command(line)?;
        self.dispatch(cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, Behavior, CycleContext, CycleError, CycleStep};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Sleeper {
        updates: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Behavior for Sleeper {
        type Percept = ();
        type Decision = ();

        async fn perceive(&mut self, _cx: &CycleContext) -> Result<(), CycleError> {
            Ok(())
        }

        async fn decide(&mut self, _p: (), _cx: &CycleContext) -> Result<(), CycleError> {
            Ok(())
        }

        async fn act(&mut self, _d: (), _cx: &CycleContext) -> Result<CycleStep, CycleError> {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(CycleStep::Continue)
        }

        async fn update(&mut self, _params: ParamMap) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_parse_basic() {
        let cmd = parse_command("/miner-1 set strategy=line depth=12").unwrap();
        assert_eq!(cmd.agent, "miner-1");
        assert_eq!(cmd.verb, CommandVerb::Set);
        assert_eq!(cmd.params.get("strategy"), Some(&serde_json::json!("line")));
        assert_eq!(cmd.params.get("depth"), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_parse_list_and_errors() {
        assert_eq!(parse_command("/list").unwrap().verb, CommandVerb::List);
        assert!(matches!(
            parse_command("hello"),
            Err(CommandError::NotACommand(_))
        ));
        assert_eq!(parse_command("/"), Err(CommandError::Empty));
        assert_eq!(parse_command("/miner-1"), Err(CommandError::Empty));
        assert!(matches!(
            parse_command("/miner-1 dance"),
            Err(CommandError::UnknownVerb(_))
        ));
        assert!(matches!(
            parse_command("/miner-1 set strategy"),
            Err(CommandError::MalformedParam(_))
        ));
        assert!(matches!(
            parse_command("/miner-1 set =line"),
            Err(CommandError::MalformedParam(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_lifecycle_and_audit() {
        let bus = Arc::new(MessageBus::new());
        let audits = Arc::new(AtomicUsize::new(0));
        {
            let audits = Arc::clone(&audits);
            bus.subscribe(topic::WILDCARD, "audit", move |msg| {
                let audits = Arc::clone(&audits);
                async move {
                    if matches!(msg.payload, Payload::Command(_)) {
                        audits.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            });
        }
        let registry = AgentRegistry::new(Arc::clone(&bus));
        let updates = Arc::new(AtomicUsize::new(0));
        let agent = Agent::new(
            "sleeper-1",
            Sleeper {
                updates: Arc::clone(&updates),
            },
            &Settings::fast(),
        );
        registry.register(Arc::new(agent.clone()));

        registry.dispatch_line("/sleeper-1 start").await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        registry
            .dispatch_line("/sleeper-1 set strategy=spiral")
            .await
            .unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        let status = registry.dispatch_line("/sleeper-1 status").await.unwrap();
        assert_eq!(
            status,
            CommandOutcome::Status {
                agent: "sleeper-1".into(),
                state: AgentState::Running
            }
        );
        registry.dispatch_line("/sleeper-1 stop").await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert_eq!(audits.load(Ordering::SeqCst), 4);

        assert!(matches!(
            registry.dispatch_line("/ghost start").await,
            Err(CommandError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_list_reports_all_agents() {
        let bus = Arc::new(MessageBus::new());
        let registry = AgentRegistry::new(bus);
        for name in ["b-agent", "a-agent"] {
            let agent = Agent::new(
                name,
                Sleeper {
                    updates: Arc::new(AtomicUsize::new(0)),
                },
                &Settings::fast(),
            );
            registry.register(Arc::new(agent));
        }
        let listing = registry.dispatch_line("/list").await.unwrap();
        match listing {
            CommandOutcome::Listing(entries) => {
                // sorted by name
                let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["a-agent", "b-agent"]);
                assert!(entries.iter().all(|(_, s)| *s == AgentState::Idle));
            }
            other => panic!("expected listing, got {other:?}"),
        }
    }
}
