use rave_manager::{AgentEvent, EventKind, Supervisor, UserProfile, event_fn, sync_event};
use tracing::{debug, info};

use crate::config::AgentFileConfig;

pub async fn register(supervisor: &Supervisor, agent: &AgentFileConfig) {
    if agent.welcome_members {
        supervisor
            .register_event(
                EventKind::UserJoined,
                event_fn(|ctx| async move {
                    if let AgentEvent::UserJoined(profile) = &ctx.event {
                        if should_welcome(profile, ctx.agent.identity().user_id) {
                            ctx.agent.send_message(welcome_text(profile), None).await;
                        }
                    }
                    anyhow::Ok(())
                }),
            )
            .await;
    }

    if let Some(greeting) = agent.greeting.clone().filter(|g| !g.trim().is_empty()) {
        supervisor
            .register_event(
                EventKind::Connected,
                event_fn(move |ctx| {
                    let greeting = greeting.clone();
                    async move {
                        ctx.agent.send_message(greeting, None).await;
                        anyhow::Ok(())
                    }
                }),
            )
            .await;
    }

    supervisor
        .register_event(
            EventKind::UserLeft,
            sync_event(|ctx| {
                if let AgentEvent::UserLeft(profile) = &ctx.event {
                    debug!(session = %ctx.agent.session_id(), user = profile.id, name = %profile.display_name, "member left");
                }
                Ok(())
            }),
        )
        .await;
    supervisor
        .register_event(
            EventKind::Kicked,
            sync_event(|ctx| {
                info!(session = %ctx.agent.session_id(), "removed from session by its owner");
                Ok(())
            }),
        )
        .await;
}

fn should_welcome(profile: &UserProfile, self_id: u64) -> bool {
    profile.id != self_id
}

pub fn welcome_text(profile: &UserProfile) -> String {
    let name = profile.display_name.trim();
    let name = if name.is_empty() { "User" } else { name };
    format!("welcome {name} to the chat")
}
