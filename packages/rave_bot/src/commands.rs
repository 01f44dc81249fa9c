//! Operator commands the bot answers in every session, on top of the
//! built-in `help`, `ping` and `info`.

use std::sync::Arc;

use async_trait::async_trait;
use rave_manager::{
    CommandContext, CommandHandler, SessionState, Supervisor, SupervisorStatus, sync_command,
};
use tracing::{info, warn};

pub async fn register(supervisor: &Supervisor) {
    supervisor
        .register_command(
            "hello",
            sync_command("Say hello", |_ctx| {
                Ok(Some("Hello! 👋 I'm a multi-mesh bot!".to_string()))
            }),
        )
        .await;
    supervisor
        .register_command(
            "status",
            Arc::new(StatusCommand {
                supervisor: supervisor.clone(),
            }),
        )
        .await;
    supervisor
        .register_command(
            "restart",
            Arc::new(RestartCommand {
                supervisor: supervisor.clone(),
            }),
        )
        .await;
}

struct StatusCommand {
    supervisor: Supervisor,
}

#[async_trait]
impl CommandHandler for StatusCommand {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        let status = self.supervisor.status().await;
        ctx.reply(status_text(&status)).await;
        Ok(())
    }

    fn description(&self) -> &str {
        "Show bot manager status"
    }
}

/// Restarts the agent of the session the command came from.
struct RestartCommand {
    supervisor: Supervisor,
}

#[async_trait]
impl CommandHandler for RestartCommand {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<()> {
        let session_id = ctx.agent.session_id().to_string();
        ctx.reply("🔄 Reconnecting to this session...").await;
        info!(session = %session_id, sender = %ctx.sender, "restart requested from chat");

        // The restart tears down the agent running this handler, so it has
        // to happen outside of it.
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            if !supervisor.restart_session(&session_id).await {
                warn!(session = %session_id, "restart requested for unknown session");
            }
        });
        Ok(())
    }

    fn description(&self) -> &str {
        "Reconnect the bot to this session"
    }
}

pub fn status_text(status: &SupervisorStatus) -> String {
    let count = |state: SessionState| {
        status
            .sessions
            .iter()
            .filter(|s| s.state == state)
            .count()
    };
    let uptime = status.metrics.uptime_secs;
    format!(
        "**Bot Manager Status:**\nSessions: {}\nConnected: {}\nRetrying: {}\nFailed: {}\nUptime: {}h {}m",
        status.sessions.len(),
        count(SessionState::Connected),
        count(SessionState::Retrying),
        count(SessionState::Failed),
        uptime / 3600,
        uptime % 3600 / 60,
    )
}
