//! SSE relay between the agent stream and the caller.
//!
//! The relay owns the delivery channel and is the only component that
//! emits terminal `done`/`error` events. It enforces the idle-stream
//! timeout, taps `tool_result` events for debounced file flushes, and
//! keeps consuming the agent stream if the caller disconnects so the
//! turn still completes and its artifacts flush.

use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::AgentEventStream;
use crate::events::{AgentEvent, RelayEvent};
use crate::registry::now_ms;

/// How one pump of the agent stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Agent emitted a terminal event; `failed` when it was `error`.
    Completed { failed: bool },
    /// Transport dropped or the stream closed before a terminal event.
    Disconnected(String),
    /// No event within the idle-stream timeout.
    IdleTimeout,
}

/// Sending half of a turn's event channel. Adds sequencing metadata and
/// guards the single-terminal-event contract.
pub struct TurnRelay {
    tx: mpsc::Sender<RelayEvent>,
    seq: u64,
    terminal_sent: bool,
    caller_gone: bool,
}

impl TurnRelay {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                seq: 0,
                terminal_sent: false,
                caller_gone: false,
            },
            rx,
        )
    }

    /// Emit one event to the caller. Events after a terminal event are
    /// dropped; a disconnected caller stops delivery but not the turn.
    pub async fn emit(&mut self, event: AgentEvent) {
        if self.terminal_sent {
            warn!(kind = event.kind(), "dropping event after terminal");
            return;
        }
        if event.is_terminal() {
            self.terminal_sent = true;
        }
        if self.caller_gone {
            return;
        }
        self.seq += 1;
        let relay_event = RelayEvent {
            seq: self.seq,
            timestamp: now_ms(),
            event,
        };
        if self.tx.send(relay_event).await.is_err() {
            debug!("caller disconnected; turn continues without delivery");
            self.caller_gone = true;
        }
    }

    pub async fn emit_error(&mut self, err: &crate::error::WorkspaceError) {
        self.emit(AgentEvent::error_from(err)).await;
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    pub fn caller_connected(&self) -> bool {
        !self.caller_gone
    }
}

/// Relay options for one pump.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// A live stream silent for this long counts as a disconnect.
    pub idle_stream_timeout: Duration,
}

/// Drive one agent event stream into the relay. `on_tool_result` fires
/// for every observed `tool_result`, off the delivery path.
pub async fn pump<F: FnMut()>(
    mut stream: AgentEventStream,
    relay: &mut TurnRelay,
    options: &RelayOptions,
    mut on_tool_result: F,
) -> StreamOutcome {
    loop {
        let next = tokio::time::timeout(options.idle_stream_timeout, stream.next()).await;
        match next {
            Err(_) => return StreamOutcome::IdleTimeout,
            Ok(None) => {
                return StreamOutcome::Disconnected(
                    "agent stream closed before a terminal event".to_string(),
                );
            }
            Ok(Some(Err(e))) => return StreamOutcome::Disconnected(e.to_string()),
            Ok(Some(Ok(event))) => {
                if matches!(event, AgentEvent::ToolResult(_)) {
                    on_tool_result();
                }
                let terminal = event.is_terminal();
                let failed = matches!(event, AgentEvent::Error(_));
                relay.emit(event).await;
                if terminal {
                    return StreamOutcome::Completed { failed };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkspaceError;
    use futures_util::stream;

    fn stream_of(events: Vec<Result<AgentEvent, WorkspaceError>>) -> AgentEventStream {
        Box::pin(stream::iter(events))
    }

    fn options() -> RelayOptions {
        RelayOptions {
            idle_stream_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_pump_relays_in_order_with_sequencing() {
        let (mut relay, mut rx) = TurnRelay::channel(16);
        let events = stream_of(vec![
            Ok(AgentEvent::from_sse("init", "{}")),
            Ok(AgentEvent::from_sse("assistant", r#"{"text":"hi"}"#)),
            Ok(AgentEvent::from_sse("done", "{}")),
        ]);

        let outcome = pump(events, &mut relay, &options(), || {}).await;
        assert_eq!(outcome, StreamOutcome::Completed { failed: false });

        let received: Vec<RelayEvent> = {
            let mut out = Vec::new();
            while let Ok(event) = rx.try_recv() {
                out.push(event);
            }
            out
        };
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].seq, 1);
        assert_eq!(received[2].seq, 3);
        assert_eq!(received[0].event.kind(), "init");
        assert_eq!(received[2].event.kind(), "done");
    }

    #[tokio::test]
    async fn test_pump_taps_tool_results() {
        let (mut relay, _rx) = TurnRelay::channel(16);
        let events = stream_of(vec![
            Ok(AgentEvent::from_sse("tool_call", "{}")),
            Ok(AgentEvent::from_sse("tool_result", "{}")),
            Ok(AgentEvent::from_sse("tool_result", "{}")),
            Ok(AgentEvent::from_sse("done", "{}")),
        ]);

        let mut taps = 0;
        pump(events, &mut relay, &options(), || taps += 1).await;
        assert_eq!(taps, 2);
    }

    #[tokio::test]
    async fn test_stream_end_without_done_is_disconnect() {
        let (mut relay, _rx) = TurnRelay::channel(16);
        let events = stream_of(vec![Ok(AgentEvent::from_sse("assistant", "{}"))]);
        let outcome = pump(events, &mut relay, &options(), || {}).await;
        assert!(matches!(outcome, StreamOutcome::Disconnected(_)));
        assert!(!relay.terminal_sent());
    }

    #[tokio::test]
    async fn test_transport_error_is_disconnect() {
        let (mut relay, _rx) = TurnRelay::channel(16);
        let events = stream_of(vec![
            Ok(AgentEvent::from_sse("thinking", "{}")),
            Err(WorkspaceError::AgentDisconnect("connection reset".into())),
        ]);
        let outcome = pump(events, &mut relay, &options(), || {}).await;
        assert_eq!(
            outcome,
            StreamOutcome::Disconnected("agent connection lost: connection reset".into())
        );
    }

    #[tokio::test]
    async fn test_idle_stream_times_out() {
        let (mut relay, _rx) = TurnRelay::channel(16);
        // A stream that never yields.
        let events: AgentEventStream = Box::pin(stream::pending());
        let outcome = pump(events, &mut relay, &options(), || {}).await;
        assert_eq!(outcome, StreamOutcome::IdleTimeout);
    }

    #[tokio::test]
    async fn test_no_events_after_terminal() {
        let (mut relay, mut rx) = TurnRelay::channel(16);
        relay.emit(AgentEvent::from_sse("done", "{}")).await;
        relay.emit(AgentEvent::from_sse("assistant", "{}")).await;
        relay
            .emit_error(&WorkspaceError::AgentDisconnect("late".into()))
            .await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event.kind().to_string());
        }
        assert_eq!(kinds, vec!["done"]);
    }

    #[tokio::test]
    async fn test_caller_disconnect_does_not_stop_pump() {
        let (mut relay, rx) = TurnRelay::channel(1);
        drop(rx);
        let events = stream_of(vec![
            Ok(AgentEvent::from_sse("assistant", "{}")),
            Ok(AgentEvent::from_sse("tool_result", "{}")),
            Ok(AgentEvent::from_sse("done", "{}")),
        ]);
        let mut taps = 0;
        let outcome = pump(events, &mut relay, &options(), || taps += 1).await;
        // The turn completed and side effects still fired.
        assert_eq!(outcome, StreamOutcome::Completed { failed: false });
        assert_eq!(taps, 1);
        assert!(!relay.caller_connected());
    }
}
