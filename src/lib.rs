// ABOUTME: Root library: tokio-backed host, default handlers, and recording replay
// ABOUTME: Re-exports the runtime and Slack plumbing crates for the binary and tests

pub mod handlers;
pub mod replay;
pub mod tokio_host;

pub use hookslack_core::config;
pub use hookslack_core::metrics;
pub use hookslack_core::{EventRouter, SlackApi, Team};
pub use hookslack_task::Runtime;
pub use tokio_host::{HostEvents, TokioHost};

use hookslack_core::config::Config;
use hookslack_core::Recorder;

/// Router with the default handlers, one team per configured workspace that
/// has a token, and the recorder when recording is enabled.
pub fn build_router(runtime: Runtime, config: &Config) -> EventRouter {
    let router = EventRouter::new(runtime, config.router.clone());
    handlers::register_default_handlers(&router);

    for (name, workspace) in &config.workspaces {
        match SlackApi::from_config(name, workspace, &config.network) {
            Some(api) => {
                router.register_team(Team::new(name, name).with_api(api));
            }
            None => tracing::warn!(workspace = %name, "Workspace has no api_token, skipping"),
        }
    }

    if config.recorder.enabled {
        tracing::info!(dir = %config.recorder.dir, "Recording routed events");
        router.set_recorder(Some(Recorder::new(&config.recorder.dir)));
    }
    router
}
