// ABOUTME: Slack event routing and request plumbing on top of the hookslack task runtime.
// ABOUTME: Everything here talks to the outside world only through host hooks.

pub mod api;
pub mod config;
pub mod envelope;
pub mod error;
pub mod http;
pub mod metrics;
pub mod process;
pub mod recorder;
pub mod request;
pub mod router;
pub mod rtm;
pub mod team;

pub use api::SlackApi;
pub use config::Config;
pub use envelope::{Envelope, Source};
pub use error::{SlackError, SlackErrorSink};
pub use http::{HttpReply, HttpRequest};
pub use recorder::Recorder;
pub use request::{OutboundRequest, Params};
pub use router::{DispatchOutcome, EntityRef, EventContext, EventRouter, QueueItem};
pub use rtm::{Frame, FrameError, FrameSource, RtmConnection};
pub use team::Team;

// Re-export the runtime so handlers need a single dependency
pub use hookslack_task;
