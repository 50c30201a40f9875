// ABOUTME: Default event handlers that keep team state current from streamed and fetched events.
// ABOUTME: Users and channels are stored as raw JSON objects keyed by id.

use anyhow::{Context, Result};
use hookslack_core::{EntityRef, Envelope, EventContext, EventRouter, Team};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Register every default handler on `router`.
pub fn register_default_handlers(router: &EventRouter) {
    router.register_handler("message", handle_message);
    router.register_handler("reply", handle_reply);
    router.register_handler("pong", handle_pong);
    router.register_handler("team_join", handle_user_update);
    router.register_handler("user_change", handle_user_update);
    router.register_handler("presence_change", handle_presence_change);
    router.register_handler("manual_presence_change", handle_presence_change);
    for name in [
        "channel_created",
        "channel_joined",
        "group_joined",
        "im_created",
    ] {
        router.register_handler(name, handle_channel_update);
    }
    router.register_handler("channel_rename", handle_channel_rename);
    router.register_handler("group_rename", handle_channel_rename);
    for name in ["channel_deleted", "channel_left", "group_left", "im_close"] {
        router.register_handler(name, handle_channel_removed);
    }

    // Request results, keyed by normalized method name
    router.register_handler("usersinfo", handle_user_update);
    router.register_handler("conversationsinfo", handle_channel_update);
    router.register_handler("userslist", handle_users_list);
    router.register_handler("conversationslist", handle_conversations_list);
}

fn team(context: &EventContext) -> Result<&Rc<RefCell<Team>>> {
    context
        .team
        .as_ref()
        .context("Event is not associated with a known team")
}

fn object<'a>(payload: &'a Value, field: &str) -> Result<&'a Value> {
    payload
        .get(field)
        .filter(|value| value.is_object())
        .with_context(|| format!("Event has no `{field}` object"))
}

fn id_of(value: &Value) -> Result<&str> {
    value
        .get("id")
        .and_then(Value::as_str)
        .context("Object has no id")
}

fn handle_message(envelope: &Envelope, _: &EventRouter, context: &EventContext) -> Result<()> {
    let user = context.user().and_then(display_name);
    let channel = context.channel().and_then(display_name);
    tracing::info!(
        team = ?envelope.team,
        channel = ?channel,
        user = ?user,
        subtype = ?envelope.payload.get("subtype").and_then(serde_json::Value::as_str),
        text = %envelope.payload.get("text").and_then(serde_json::Value::as_str).unwrap_or_default(),
        "Message"
    );
    Ok(())
}

fn display_name(entity: &EntityRef) -> Option<String> {
    match entity {
        EntityRef::Resolved(value) => value
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| id_of(value).ok())
            .map(str::to_string),
        EntityRef::Unresolved(id) => Some(id.clone()),
    }
}

fn handle_reply(envelope: &Envelope, _: &EventRouter, context: &EventContext) -> Result<()> {
    let ok = envelope
        .payload
        .get("ok")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    match &context.reply {
        Some(sent) if ok => tracing::debug!(
            reply_to = ?envelope.reply_to(),
            ts = ?envelope.payload.get("ts"),
            channel = ?sent.get("channel"),
            "Message acknowledged"
        ),
        Some(sent) => tracing::warn!(
            reply_to = ?envelope.reply_to(),
            error = ?envelope.payload.get("error"),
            channel = ?sent.get("channel"),
            "Message rejected"
        ),
        None => tracing::debug!(reply_to = ?envelope.reply_to(), "Unexpected reply"),
    }
    Ok(())
}

fn handle_pong(envelope: &Envelope, router: &EventRouter, context: &EventContext) -> Result<()> {
    let now = router.runtime().now();
    team(context)?.borrow_mut().record_pong(now);
    tracing::trace!(team = ?envelope.team, "Pong");
    Ok(())
}

fn handle_user_update(envelope: &Envelope, _: &EventRouter, context: &EventContext) -> Result<()> {
    let user = object(&envelope.payload, "user")?;
    let id = id_of(user)?;
    team(context)?.borrow_mut().add_user(id, user.clone());
    tracing::debug!(user = %id, "User updated");
    Ok(())
}

fn handle_presence_change(
    envelope: &Envelope,
    _: &EventRouter,
    context: &EventContext,
) -> Result<()> {
    let presence = envelope
        .payload
        .get("presence")
        .cloned()
        .context("Presence change without presence")?;
    let mut team = team(context)?.borrow_mut();

    let mut ids: Vec<String> = envelope
        .payload
        .get("users")
        .and_then(Value::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(user) = envelope.reference("user") {
        ids.push(user.to_string());
    }

    for id in ids {
        let mut user = team
            .user(&id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "id": id }));
        if let Some(fields) = user.as_object_mut() {
            fields.insert("presence".to_string(), presence.clone());
        }
        team.add_user(&id, user);
    }
    Ok(())
}

fn handle_channel_update(
    envelope: &Envelope,
    _: &EventRouter,
    context: &EventContext,
) -> Result<()> {
    let channel = object(&envelope.payload, "channel")?;
    let id = id_of(channel)?;
    let mut team = team(context)?.borrow_mut();
    let merged = match team.channel(id) {
        Some(Value::Object(existing)) => {
            let mut merged = existing.clone();
            if let Some(fields) = channel.as_object() {
                merged.extend(fields.clone());
            }
            Value::Object(merged)
        }
        _ => channel.clone(),
    };
    team.add_channel(id, merged);
    tracing::debug!(channel = %id, "Channel updated");
    Ok(())
}

fn handle_channel_rename(
    envelope: &Envelope,
    router: &EventRouter,
    context: &EventContext,
) -> Result<()> {
    handle_channel_update(envelope, router, context)
}

fn handle_channel_removed(
    envelope: &Envelope,
    _: &EventRouter,
    context: &EventContext,
) -> Result<()> {
    let id = envelope
        .reference("channel")
        .context("Event has no channel id")?;
    if team(context)?.borrow_mut().remove_channel(id).is_some() {
        tracing::debug!(channel = %id, "Channel removed");
    }
    Ok(())
}

fn handle_users_list(envelope: &Envelope, _: &EventRouter, context: &EventContext) -> Result<()> {
    let mut team = team(context)?.borrow_mut();
    let members = envelope.payload.get("members").and_then(Value::as_array);
    for user in members.into_iter().flatten() {
        if let Ok(id) = id_of(user) {
            team.add_user(id, user.clone());
        }
    }
    Ok(())
}

fn handle_conversations_list(
    envelope: &Envelope,
    _: &EventRouter,
    context: &EventContext,
) -> Result<()> {
    let mut team = team(context)?.borrow_mut();
    let channels = envelope.payload.get("channels").and_then(Value::as_array);
    for channel in channels.into_iter().flatten() {
        if let Ok(id) = id_of(channel) {
            team.add_channel(id, channel.clone());
        }
    }
    Ok(())
}
