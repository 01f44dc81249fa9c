//! Command and event handlers, and the registration object that carries them
//! from the supervisor into each agent.
//!
//! Handlers are capability objects behind `Arc<dyn ..>`. Async closures are
//! wrapped with [`command_fn`] / [`event_fn`]; synchronous ones with
//! [`sync_command`] / [`sync_event`], so the agent only ever awaits
//! `handle(ctx)`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rave_protocol::{ChatMessage, PeerId};
use serde::{Deserialize, Serialize};

use crate::agent::{MessageInfo, SessionAgent};
use crate::api::UserProfile;

/// Everything a command handler can see and do.
#[derive(Clone)]
pub struct CommandContext {
    pub agent: Arc<SessionAgent>,
    /// Lowercased command token, without prefix.
    pub command: String,
    pub args: Vec<String>,
    pub sender: PeerId,
    /// The chat line that carried the command.
    pub message: ChatMessage,
}

impl CommandContext {
    /// Send `text` as a reply to the command's chat line.
    pub async fn reply(&self, text: impl Into<String>) -> String {
        let reply_to = (!self.message.id.is_empty()).then(|| self.message.id.clone());
        self.agent.send_message(text, reply_to).await
    }

    /// Send `text` to the session without a reply reference.
    pub async fn send(&self, text: impl Into<String>) -> String {
        self.agent.send_message(text, None).await
    }

    pub fn raw_text(&self) -> &str {
        &self.message.chat
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("session", &self.agent.session_id())
            .field("command", &self.command)
            .field("args", &self.args)
            .field("sender", &self.sender)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Message,
    UserJoined,
    UserLeft,
    Kicked,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Message => "message",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
            EventKind::Kicked => "kicked",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The socket is open and `fullyJoined` was sent.
    Connected,
    /// A chat line from someone else that is not a command.
    Message(MessageInfo),
    UserJoined(UserProfile),
    UserLeft(UserProfile),
    /// Fired at most once per agent.
    Kicked,
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::Connected => EventKind::Connected,
            AgentEvent::Message(_) => EventKind::Message,
            AgentEvent::UserJoined(_) => EventKind::UserJoined,
            AgentEvent::UserLeft(_) => EventKind::UserLeft,
            AgentEvent::Kicked => EventKind::Kicked,
        }
    }
}

#[derive(Clone)]
pub struct EventContext {
    pub agent: Arc<SessionAgent>,
    pub event: AgentEvent,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()>;

    /// One line for `help`.
    fn description(&self) -> &str {
        "No description"
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()>;
}

struct FnCommand<F> {
    f: F,
    description: String,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnCommand<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        (self.f)(ctx).await
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Wrap an async closure as a command handler.
pub fn command_fn<F, Fut>(description: impl Into<String>, f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnCommand {
        f,
        description: description.into(),
    })
}

struct SyncCommand<F> {
    f: F,
    description: String,
}

#[async_trait]
impl<F> CommandHandler for SyncCommand<F>
where
    F: Fn(&CommandContext) -> anyhow::Result<Option<String>> + Send + Sync,
{
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        if let Some(text) = (self.f)(&ctx)? {
            ctx.reply(text).await;
        }
        Ok(())
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Wrap a synchronous closure as a command handler. A returned string is sent
/// back as a reply.
pub fn sync_command<F>(description: impl Into<String>, f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&CommandContext) -> anyhow::Result<Option<String>> + Send + Sync + 'static,
{
    Arc::new(SyncCommand {
        f,
        description: description.into(),
    })
}

struct FnEvent<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnEvent<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

pub fn event_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnEvent(f))
}

struct SyncEvent<F>(F);

#[async_trait]
impl<F> EventHandler for SyncEvent<F>
where
    F: Fn(&EventContext) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()> {
        (self.0)(&ctx)
    }
}

pub fn sync_event<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&EventContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(SyncEvent(f))
}

/// Handlers keyed by lowercased command name and by event kind.
#[derive(Clone, Default)]
pub struct Registry {
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    events: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `help`, `ping` and `info`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_command("help", Arc::new(HelpCommand));
        registry.register_command("ping", Arc::new(PingCommand));
        registry.register_command("info", Arc::new(InfoCommand));
        registry
    }

    /// Register or replace a command.
    pub fn register_command(&mut self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.commands.insert(name.to_lowercase(), handler);
    }

    pub fn register_event(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.events.entry(kind).or_default().push(handler);
    }

    pub fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(&name.to_lowercase()).cloned()
    }

    /// Sorted command names with their descriptions.
    pub fn commands(&self) -> Vec<(String, String)> {
        let mut list: Vec<_> = self
            .commands
            .iter()
            .map(|(name, h)| (name.clone(), h.description().to_string()))
            .collect();
        list.sort();
        list
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn events(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.events.get(&kind).cloned().unwrap_or_default()
    }

    /// Layer `other` on top: its commands replace same-named ones, its event
    /// handlers run after ours.
    pub fn merge(&mut self, other: &Registry) {
        for (name, handler) in &other.commands {
            self.commands.insert(name.clone(), handler.clone());
        }
        for (kind, handlers) in &other.events {
            self.events
                .entry(*kind)
                .or_default()
                .extend(handlers.iter().cloned());
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        commands.sort();
        let events: HashMap<_, _> = self.events.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("Registry")
            .field("commands", &commands)
            .field("events", &events)
            .finish()
    }
}

struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        let prefixes = ctx.agent.prefixes();
        let lines: Vec<String> = ctx
            .agent
            .commands()
            .into_iter()
            .map(|(name, description)| {
                let forms: Vec<String> = prefixes.iter().map(|p| format!("`{p}{name}`")).collect();
                format!("{} - {}", forms.join(" / "), description)
            })
            .collect();
        let text = format!(
            "**Available Commands:** (prefixes: {})\n{}",
            prefixes.join(", "),
            lines.join("\n")
        );
        ctx.reply(text).await;
        Ok(())
    }

    fn description(&self) -> &str {
        "Show available commands"
    }
}

struct PingCommand;

#[async_trait]
impl CommandHandler for PingCommand {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        ctx.reply("Pong! 🏓").await;
        Ok(())
    }

    fn description(&self) -> &str {
        "Check if the bot is alive"
    }
}

struct InfoCommand;

#[async_trait]
impl CommandHandler for InfoCommand {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        let session: String = ctx.agent.session_id().chars().take(8).collect();
        let text = format!(
            "**Bot Info:**\nServer: `{}`\nSession: `{}...`\nMembers: `{}`\nCommands: `{}`",
            ctx.agent.endpoint(),
            session,
            ctx.agent.members().len(),
            ctx.agent.commands().len()
        );
        ctx.reply(text).await;
        Ok(())
    }

    fn description(&self) -> &str {
        "Show bot information"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn CommandHandler> {
        command_fn("noop", |_ctx| async { anyhow::Ok(()) })
    }

    #[test]
    fn test_names_are_lowercased() {
        let mut registry = Registry::new();
        registry.register_command("Status", noop());
        assert!(registry.command("status").is_some());
        assert!(registry.command("STATUS").is_some());
        assert_eq!(registry.commands(), vec![("status".into(), "noop".into())]);
    }

    #[test]
    fn test_builtins() {
        let registry = Registry::with_builtins();
        let names: Vec<String> = registry.commands().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["help", "info", "ping"]);
    }

    #[test]
    fn test_merge_overrides_commands_and_appends_events() {
        let mut global = Registry::with_builtins();
        global.register_event(EventKind::Message, sync_event(|_| Ok(())));

        let mut session = Registry::new();
        session.register_command("ping", command_fn("custom ping", |_ctx| async { anyhow::Ok(()) }));
        session.register_event(EventKind::Message, sync_event(|_| Ok(())));
        session.register_event(EventKind::Kicked, sync_event(|_| Ok(())));

        global.merge(&session);
        assert_eq!(global.command("ping").unwrap().description(), "custom ping");
        assert_eq!(global.events(EventKind::Message).len(), 2);
        assert_eq!(global.events(EventKind::Kicked).len(), 1);
        assert!(global.events(EventKind::UserLeft).is_empty());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::UserJoined.to_string(), "user_joined");
        assert_eq!(AgentEvent::Kicked.kind(), EventKind::Kicked);
    }

    #[test]
    fn test_sync_command_description() {
        let h = sync_command("echo", |ctx| Ok(Some(ctx.args.join(" "))));
        assert_eq!(h.description(), "echo");
    }
}
