// ABOUTME: Feeds a recorded event directory back through a router.
// ABOUTME: Used to reproduce routing and handler behavior without talking to Slack.

use anyhow::Result;
use hookslack_core::recorder::load_recording;
use hookslack_core::{DispatchOutcome, Envelope, EventRouter, Team};
use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub dispatched: usize,
    pub unknown: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl ReplaySummary {
    fn count(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Dispatched(_) => self.dispatched += 1,
            DispatchOutcome::Unknown(_) => self.unknown += 1,
            DispatchOutcome::Ignored(_) => self.ignored += 1,
            DispatchOutcome::HandlerFailed(_) => self.failed += 1,
            _ => {}
        }
    }
}

/// Route `envelopes` in order, registering any team the router has not seen.
pub fn replay_envelopes(router: &EventRouter, envelopes: Vec<Envelope>) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for envelope in envelopes {
        if let Some(team) = envelope.team.as_deref() {
            if router.team(team).is_none() {
                router.register_team(Team::new(team, team));
            }
        }
        summary.events += 1;
        router.receive(envelope);
        loop {
            let outcome = router.handle_next();
            if outcome == DispatchOutcome::Idle {
                break;
            }
            summary.count(&outcome);
        }
    }
    tracing::info!(
        events = summary.events,
        dispatched = summary.dispatched,
        unknown = summary.unknown,
        failed = summary.failed,
        "Replay finished"
    );
    summary
}

/// Load the recording under `dir` and replay it.
pub fn replay_dir(router: &EventRouter, dir: &Path) -> Result<ReplaySummary> {
    let envelopes = load_recording(dir, router.runtime().now())?;
    tracing::info!(dir = %dir.display(), events = envelopes.len(), "Replaying recording");
    Ok(replay_envelopes(router, envelopes))
}
