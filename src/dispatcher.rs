use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use tracing::{debug, info, trace, warn};

use crate::messages::{AudioFrame, SessionEvent};
use crate::state::DuplexState;
use crate::stats::RuntimeStatsHandle;

const LOG_TRUNCATE_CHARS: usize = 200;

/// Side effect taken for one session event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatched {
    Enqueued,
    SkippedEmpty,
    Interrupted,
    Reported,
}

/// Routes session events: audio into the jitter buffer, server
/// interruptions onto the latch, everything else to the log.
#[derive(Clone)]
pub struct EventDispatcher {
    state: Arc<DuplexState>,
    stats: RuntimeStatsHandle,
}

impl EventDispatcher {
    pub fn new(state: Arc<DuplexState>, stats: RuntimeStatsHandle) -> Self {
        Self { state, stats }
    }

    pub fn handle(&self, event: SessionEvent) -> Result<Dispatched> {
        match event {
            SessionEvent::Audio {
                item_id,
                content_index,
                data,
            } => {
                let frame = AudioFrame::from_pcm_bytes(&data, item_id, content_index)
                    .context("decoding audio fragment")?;
                if frame.is_empty() {
                    self.stats.update(|s| s.empty_fragments += 1);
                    return Ok(Dispatched::SkippedEmpty);
                }
                trace!(
                    item_id = %frame.source_id,
                    content_index = frame.content_index,
                    samples = frame.len(),
                    "audio fragment queued"
                );
                self.state.queue().push(frame);
                self.stats.update(|s| s.frames_enqueued += 1);
                Ok(Dispatched::Enqueued)
            }
            SessionEvent::AudioEnd {
                item_id,
                content_index,
            } => {
                info!(%item_id, content_index, "audio ended");
                Ok(Dispatched::Reported)
            }
            SessionEvent::AudioInterrupted => {
                info!("audio interrupted");
                self.state.rearm_prebuffer();
                self.state.request_interrupt();
                self.stats.update(|s| s.server_interrupts += 1);
                Ok(Dispatched::Interrupted)
            }
            SessionEvent::Error { message } => {
                warn!(message = %truncate_for_log(&message, LOG_TRUNCATE_CHARS), "session error");
                Ok(Dispatched::Reported)
            }
            SessionEvent::AgentStart { agent } => {
                info!(%agent, "agent started");
                Ok(Dispatched::Reported)
            }
            SessionEvent::AgentEnd { agent } => {
                info!(%agent, "agent ended");
                Ok(Dispatched::Reported)
            }
            SessionEvent::Handoff { from, to } => {
                info!(%from, %to, "handoff");
                Ok(Dispatched::Reported)
            }
            SessionEvent::ToolStart { tool } => {
                info!(%tool, "tool started");
                Ok(Dispatched::Reported)
            }
            SessionEvent::ToolEnd { tool, output } => {
                info!(%tool, output = %truncate_for_log(&output, LOG_TRUNCATE_CHARS), "tool ended");
                Ok(Dispatched::Reported)
            }
            SessionEvent::HistoryUpdated | SessionEvent::HistoryAdded => {
                trace!("history changed");
                Ok(Dispatched::Reported)
            }
            SessionEvent::RawModelEvent { data } => {
                debug!(data = %truncate_for_log(&data, LOG_TRUNCATE_CHARS), "raw model event");
                Ok(Dispatched::Reported)
            }
            SessionEvent::Unknown { kind } => {
                debug!(%kind, "unknown event type");
                Ok(Dispatched::Reported)
            }
        }
    }

    /// Handles one event, isolating any failure to that event.
    pub fn dispatch(&self, event: SessionEvent) -> Option<Dispatched> {
        let kind = event.kind().to_owned();
        match self.handle(event) {
            Ok(outcome) => {
                self.stats.update(|s| s.events_dispatched += 1);
                Some(outcome)
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(%kind, error = %truncate_for_log(&error, LOG_TRUNCATE_CHARS), "error processing event");
                self.stats.update(|s| s.dispatch_errors += 1);
                None
            }
        }
    }

    /// Consumes events in arrival order until the session ends or
    /// `stop_rx` fires or disconnects.
    pub fn run(&self, events: &Receiver<SessionEvent>, stop_rx: &Receiver<()>) {
        debug!("event dispatcher started");
        loop {
            let event = crossbeam_channel::select! {
                recv(stop_rx) -> _ => break,
                recv(events) -> msg => match msg {
                    Ok(event) => event,
                    Err(_) => {
                        info!("session event stream ended");
                        break;
                    }
                },
            };
            self.dispatch(event);
        }
        debug!("event dispatcher stopped");
    }
}

fn truncate_for_log(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &s[..cut])),
        None => Cow::Borrowed(s),
    }
}
