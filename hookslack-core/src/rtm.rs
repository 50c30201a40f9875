// ABOUTME: Streaming ingestion for a team's real-time connection.
// ABOUTME: Drains non-blocking websocket frames on fd readiness and hands payloads to the router.

use crate::envelope::Envelope;
use crate::metrics;
use crate::router::EventRouter;
use crate::team::Team;
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use hookslack_task::{HookEvent, HookHandle, Primitive};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
    Other,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("no frame available")]
    WouldBlock,
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Non-blocking source of websocket frames.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, FrameError>;
    fn send_text(&mut self, text: &str) -> Result<(), FrameError>;
    fn send_ping(&mut self) -> Result<(), FrameError>;
    /// Descriptor the host polls for readability
    fn raw_fd(&self) -> i32;
}

#[cfg(unix)]
mod socket {
    use super::{Frame, FrameError, FrameSource};
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::io::AsRawFd;
    use tokio_tungstenite::tungstenite::{Error, Message, WebSocket};

    impl<S: Read + Write + AsRawFd> FrameSource for WebSocket<S> {
        fn read_frame(&mut self) -> Result<Frame, FrameError> {
            match self.read() {
                Ok(Message::Text(text)) => Ok(Frame::Text(text)),
                Ok(Message::Binary(data)) => Ok(Frame::Binary(data)),
                Ok(Message::Ping(data)) => Ok(Frame::Ping(data)),
                Ok(Message::Pong(data)) => Ok(Frame::Pong(data)),
                Ok(Message::Close(_)) => Ok(Frame::Close),
                Ok(Message::Frame(_)) => Ok(Frame::Other),
                Err(e) => Err(map_error(e)),
            }
        }

        fn send_text(&mut self, text: &str) -> Result<(), FrameError> {
            write(self, Message::Text(text.to_string()))
        }

        fn send_ping(&mut self) -> Result<(), FrameError> {
            write(self, Message::Ping(Vec::new()))
        }

        fn raw_fd(&self) -> i32 {
            self.get_ref().as_raw_fd()
        }
    }

    // A would-block on write leaves the frame buffered; the next write flushes it.
    fn write<S: Read + Write>(socket: &mut WebSocket<S>, message: Message) -> Result<(), FrameError> {
        match socket.send(message) {
            Ok(()) => Ok(()),
            Err(e) => match map_error(e) {
                FrameError::WouldBlock => Ok(()),
                other => Err(other),
            },
        }
    }

    fn map_error(error: Error) -> FrameError {
        match error {
            Error::Io(e) if e.kind() == ErrorKind::WouldBlock => FrameError::WouldBlock,
            Error::ConnectionClosed | Error::AlreadyClosed => FrameError::Closed,
            other => FrameError::Transport(other.to_string()),
        }
    }
}

type LostCallback = Box<dyn FnOnce(&str)>;

struct ConnectionState {
    router: EventRouter,
    team: Rc<RefCell<Team>>,
    team_id: String,
    source: RefCell<Box<dyn FrameSource>>,
    token: String,
    handle: Cell<Option<HookHandle>>,
    on_lost: RefCell<Option<LostCallback>>,
    closed: Cell<bool>,
}

/// A team's streaming connection, driven by host fd readiness callbacks.
#[derive(Clone)]
pub struct RtmConnection {
    state: Rc<ConnectionState>,
}

impl RtmConnection {
    /// Hook readiness for `source` and route everything it yields for `team`.
    ///
    /// `on_lost` runs once, with the team id, when the connection drops.
    pub fn attach(
        router: &EventRouter,
        team: Rc<RefCell<Team>>,
        source: Box<dyn FrameSource>,
        on_lost: impl FnOnce(&str) + 'static,
    ) -> Self {
        let team_id = team.borrow().id.clone();
        let fd = source.raw_fd();
        let token = format!("rtm:{}:{}", team_id, uuid::Uuid::new_v4());
        let connection = Self {
            state: Rc::new(ConnectionState {
                router: router.clone(),
                team,
                team_id,
                source: RefCell::new(source),
                token,
                handle: Cell::new(None),
                on_lost: RefCell::new(Some(Box::new(on_lost))),
                closed: Cell::new(false),
            }),
        };

        let weak: Weak<ConnectionState> = Rc::downgrade(&connection.state);
        let runtime = router.runtime();
        runtime.register_callback(&connection.state.token, move |_event: HookEvent| {
            if let Some(state) = weak.upgrade() {
                RtmConnection { state }.on_readable();
            }
        });
        let handle = runtime.host().hook_fd(fd, true, &connection.state.token);
        connection.state.handle.set(Some(handle));
        connection.state.team.borrow_mut().set_connected(true);
        tracing::info!(team = %connection.state.team_id, fd, "Streaming connection attached");
        connection
    }

    pub fn team_id(&self) -> &str {
        &self.state.team_id
    }

    pub fn token(&self) -> &str {
        &self.state.token
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Drain every frame currently available. Returns how many payloads were routed.
    pub fn on_readable(&self) -> usize {
        let mut routed = 0;
        while !self.state.closed.get() {
            let frame = self.state.source.borrow_mut().read_frame();
            match frame {
                Ok(Frame::Pong(_)) => {
                    let now = self.state.router.runtime().now();
                    self.state.team.borrow_mut().record_pong(now);
                }
                Ok(Frame::Text(text)) => routed += usize::from(self.route(text.as_bytes())),
                Ok(Frame::Binary(data)) => routed += usize::from(self.route(&data)),
                Ok(Frame::Close) => self.lost("closed by peer"),
                Ok(Frame::Ping(_)) | Ok(Frame::Other) => {}
                Err(FrameError::WouldBlock) => break,
                Err(FrameError::Closed) => self.lost("connection closed"),
                Err(FrameError::Transport(e)) => self.lost(&e),
            }
        }
        routed
    }

    fn route(&self, data: &[u8]) -> bool {
        match serde_json::from_slice::<Value>(data) {
            Ok(payload @ Value::Object(_)) => {
                let now = self.state.router.runtime().now();
                self.state
                    .router
                    .receive(Envelope::from_stream(&self.state.team_id, payload, now));
                true
            }
            Ok(_) => {
                tracing::warn!(team = %self.state.team_id, "Dropping non-object frame");
                metrics::frame_dropped();
                false
            }
            Err(e) => {
                tracing::warn!(team = %self.state.team_id, error = %e, "Dropping malformed frame");
                metrics::frame_dropped();
                false
            }
        }
    }

    fn lost(&self, reason: &str) {
        if !self.detach() {
            return;
        }
        tracing::warn!(team = %self.state.team_id, reason = %reason, "Streaming connection lost");
        metrics::connection_lost();
        let callback = self.state.on_lost.borrow_mut().take();
        if let Some(callback) = callback {
            callback(&self.state.team_id);
        }
    }

    fn detach(&self) -> bool {
        if self.state.closed.replace(true) {
            return false;
        }
        self.state.team.borrow_mut().set_connected(false);
        let runtime = self.state.router.runtime();
        if let Some(handle) = self.state.handle.take() {
            runtime.host().unhook(handle);
        }
        runtime.unregister_callback(&self.state.token);
        true
    }

    /// Send a message and get a primitive resolved with its streamed reply.
    pub fn send(&self, mut message: Value) -> Result<Primitive<HookEvent>> {
        if self.state.closed.get() {
            bail!("Connection for team {} is closed", self.state.team_id);
        }
        let Some(object) = message.as_object_mut() else {
            bail!("Streamed messages must be JSON objects");
        };
        let (id, key) = {
            let mut team = self.state.team.borrow_mut();
            let id = team.next_message_id();
            (id, team.reply_key(id))
        };
        object.insert("id".to_string(), Value::from(id));

        self.state
            .source
            .borrow_mut()
            .send_text(&message.to_string())?;
        // Replies are only read on a later readiness callback
        let reply = self.state.router.runtime().hook_primitive(Some(&key));
        self.state.team.borrow_mut().remember_sent(id, message);
        tracing::debug!(team = %self.state.team_id, id, "Sent streamed message");
        Ok(reply)
    }

    pub fn ping(&self) -> Result<()> {
        self.state.source.borrow_mut().send_ping()?;
        Ok(())
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.state.team.borrow().is_stale(now, timeout)
    }

    /// Close without notifying the lost-connection callback.
    pub fn close(&self) {
        if self.detach() {
            tracing::info!(team = %self.state.team_id, "Streaming connection closed");
        }
    }
}

impl std::fmt::Debug for RtmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmConnection")
            .field("team", &self.state.team_id)
            .field("closed", &self.state.closed.get())
            .finish()
    }
}
