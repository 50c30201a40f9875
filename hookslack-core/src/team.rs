// ABOUTME: Connection-scoped state for one Slack workspace.
// ABOUTME: Known users and channels, liveness, and sent messages awaiting a streamed reply.

use crate::api::SlackApi;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct Team {
    pub id: String,
    pub name: String,
    users: HashMap<String, Value>,
    channels: HashMap<String, Value>,
    connected: bool,
    last_pong: Option<DateTime<Utc>>,
    next_message_id: i64,
    sent: HashMap<i64, Value>,
    api: Option<Rc<SlackApi>>,
}

impl Team {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_api(mut self, api: SlackApi) -> Self {
        self.api = Some(Rc::new(api));
        self
    }

    pub fn api(&self) -> Option<Rc<SlackApi>> {
        self.api.clone()
    }

    pub fn add_user(&mut self, id: &str, user: Value) {
        self.users.insert(id.to_string(), user);
    }

    pub fn user(&self, id: &str) -> Option<&Value> {
        self.users.get(id)
    }

    pub fn add_channel(&mut self, id: &str, channel: Value) {
        self.channels.insert(id.to_string(), channel);
    }

    pub fn channel(&self, id: &str) -> Option<&Value> {
        self.channels.get(id)
    }

    pub fn remove_channel(&mut self, id: &str) -> Option<Value> {
        self.channels.remove(id)
    }

    pub fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            tracing::info!(team = %self.id, connected, "Team connection state changed");
        }
        self.connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn record_pong(&mut self, now: DateTime<Utc>) {
        self.last_pong = Some(now);
    }

    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.last_pong
    }

    /// No pong within `timeout`. A team that never saw a pong is not stale yet.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.last_pong {
            Some(last) => now - last > timeout,
            None => false,
        }
    }

    pub fn next_message_id(&mut self) -> i64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    pub fn remember_sent(&mut self, id: i64, message: Value) {
        self.sent.insert(id, message);
    }

    pub fn take_sent(&mut self, id: i64) -> Option<Value> {
        self.sent.remove(&id)
    }

    /// Correlation identifier under which a streamed reply resolves.
    pub fn reply_key(&self, message_id: i64) -> String {
        format!("reply:{}:{}", self.id, message_id)
    }
}
