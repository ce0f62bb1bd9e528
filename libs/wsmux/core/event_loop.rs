//! Drives one established WebSocket stream through a [`Dispatcher`]
//!
//! The dispatcher never touches the socket. Frames it emits are buffered in a
//! [`LoopTransport`] and flushed to the sink at the top of every iteration;
//! write readiness is only polled while the dispatcher has asked for it.

use crate::core::close_status::{CloseOrigin, CloseStatus};
use crate::core::connection_state::ConnectionState;
use crate::core::dispatcher::Dispatcher;
use crate::core::keepalive::KeepAliveTracker;
use crate::core::message::{Message, MessageType};
use crate::core::options::KeepAlive;
use crate::traits::{EventHandler, FramePosition, Headers, Transport};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::error::{Error as WireError, ProtocolError};
use tokio_tungstenite::tungstenite::Message as WireMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Upper bound on flushing the sink once the loop is done
const SINK_CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Per-connection loop settings, frozen at connect/start
#[derive(Debug, Clone, Copy)]
pub(crate) struct DriveSettings {
    pub(crate) close_timeout: Duration,
    pub(crate) keepalive: Option<KeepAlive>,
}

/// Buffers dispatcher output until the loop flushes it
#[derive(Default)]
pub(crate) struct LoopTransport {
    writable: bool,
    outgoing: VecDeque<WireMessage>,
}

impl Transport for LoopTransport {
    fn request_writable(&mut self) {
        self.writable = true;
    }

    fn write(&mut self, message: Message) {
        self.outgoing.push_back(to_wire(message));
    }

    fn close(&mut self, status: &CloseStatus) {
        self.outgoing.push_back(WireMessage::Close(status.to_frame()));
    }
}

/// Run an established connection until it is closed and the peer is done
///
/// Returns once the dispatcher is Closed and either the transport ended, the
/// close handshake timed out, or a forced teardown was requested.
pub(crate) async fn drive<S, H>(
    ws: WebSocketStream<S>,
    dispatcher: &mut Dispatcher<H>,
    headers: Headers,
    settings: DriveSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    H: EventHandler,
{
    let link = Arc::clone(dispatcher.link());
    let conn = link.id();
    let (mut sink, mut stream) = ws.split();
    let mut transport = LoopTransport::default();

    let mut tracker = settings
        .keepalive
        .map(|k| KeepAliveTracker::new(k.timeout()));
    let mut ping_timer = settings.keepalive.map(|k| {
        let mut timer = interval_at(Instant::now() + k.interval(), k.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });
    let mut close_deadline: Option<Instant> = None;

    dispatcher.on_established(headers, &mut transport);

    'drive: loop {
        while let Some(frame) = transport.outgoing.pop_front() {
            if let Err(e) = sink.send(frame).await {
                debug!(conn, "Write failed: {}", e);
                dispatcher.on_transport_end(
                    CloseStatus::abnormal(e.to_string()).with_origin(CloseOrigin::Peer),
                );
                break 'drive;
            }
        }

        if dispatcher.is_closed() && close_deadline.is_none() {
            close_deadline = Some(Instant::now() + settings.close_timeout);
        }

        tokio::select! {
            _ = link.woken() => {
                if link.force_requested() {
                    warn!(conn, "Forced teardown");
                    dispatcher.on_transport_end(CloseStatus::abnormal("forced teardown"));
                    break 'drive;
                }
                dispatcher.on_wake(&mut transport);
            }

            ready = futures::future::poll_fn(|cx| sink.poll_ready_unpin(cx)),
                if transport.writable && !dispatcher.is_closed() =>
            {
                match ready {
                    Ok(()) => {
                        transport.writable = false;
                        dispatcher.on_writable(&mut transport);
                    }
                    Err(e) => {
                        debug!(conn, "Sink failed: {}", e);
                        dispatcher.on_transport_end(
                            CloseStatus::abnormal(e.to_string()).with_origin(CloseOrigin::Peer),
                        );
                        break 'drive;
                    }
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WireMessage::Text(text))) => {
                        dispatcher.on_frame(
                            FramePosition::Whole(MessageType::Text),
                            text.as_bytes(),
                            &mut transport,
                        );
                    }
                    Some(Ok(WireMessage::Binary(data))) => {
                        dispatcher.on_frame(
                            FramePosition::Whole(MessageType::Binary),
                            &data,
                            &mut transport,
                        );
                    }
                    Some(Ok(WireMessage::Ping(_))) => {
                        trace!(conn, "Ping received");
                    }
                    Some(Ok(WireMessage::Pong(_))) => {
                        if let Some(tracker) = tracker.as_mut() {
                            tracker.record_pong_received(std::time::Instant::now());
                        }
                    }
                    Some(Ok(WireMessage::Close(frame))) => {
                        dispatcher.on_peer_close(CloseStatus::from_peer_frame(frame.as_ref()));
                    }
                    Some(Ok(WireMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        match rejection_status(&e) {
                            Some(status) => {
                                dispatcher.on_inbound_rejected(status, &mut transport);
                                let flush = async {
                                    while let Some(frame) = transport.outgoing.pop_front() {
                                        if sink.send(frame).await.is_err() {
                                            break;
                                        }
                                    }
                                };
                                let _ = tokio::time::timeout(SINK_CLOSE_GRACE, flush).await;
                            }
                            None => {
                                debug!(conn, "Read failed: {}", e);
                                dispatcher.on_transport_end(
                                    CloseStatus::abnormal(e.to_string())
                                        .with_origin(CloseOrigin::Peer),
                                );
                            }
                        }
                        break 'drive;
                    }
                    None => {
                        dispatcher.on_transport_end(
                            CloseStatus::abnormal("connection closed by peer")
                                .with_origin(CloseOrigin::Peer),
                        );
                        break 'drive;
                    }
                }
            }

            _ = wait_until(close_deadline) => {
                debug!(conn, "Close handshake timed out");
                break 'drive;
            }

            _ = next_tick(&mut ping_timer) => {
                let now = std::time::Instant::now();
                if let Some(tracker) = tracker.as_mut() {
                    if !tracker.is_healthy(now) {
                        warn!(
                            conn,
                            since_last_pong = ?tracker.time_since_last_pong(now),
                            "Keepalive timeout"
                        );
                        dispatcher.on_transport_end(CloseStatus::abnormal("keepalive timeout"));
                        break 'drive;
                    }
                    if tracker.should_ping() && dispatcher.state() == ConnectionState::Established {
                        transport.outgoing.push_back(WireMessage::Ping(Vec::new()));
                        tracker.record_ping_sent(now);
                    }
                }
            }
        }
    }

    if !dispatcher.is_closed() {
        dispatcher.on_transport_end(CloseStatus::abnormal("event loop stopped"));
    }
    let _ = tokio::time::timeout(SINK_CLOSE_GRACE, sink.close()).await;
    debug!(conn, "Event loop finished");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Close status owed to the peer when the reader refused its data
///
/// Errors that leave nothing to answer map to `None`.
fn rejection_status(error: &WireError) -> Option<CloseStatus> {
    match error {
        WireError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => None,
        WireError::Protocol(e) => {
            Some(CloseStatus::new(CloseStatus::PROTOCOL_ERROR).with_reason(e.to_string()))
        }
        WireError::Utf8 => Some(
            CloseStatus::new(CloseStatus::UNSUPPORTED_DATA)
                .with_reason("invalid UTF-8 in text message"),
        ),
        WireError::Capacity(e) => {
            Some(CloseStatus::new(CloseStatus::TOO_LARGE).with_reason(e.to_string()))
        }
        _ => None,
    }
}

fn to_wire(message: Message) -> WireMessage {
    let (kind, payload) = message.into_parts();
    match kind {
        MessageType::Text => WireMessage::Text(
            String::from_utf8(payload)
                .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
        ),
        MessageType::Binary => WireMessage::Binary(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_transport_buffers_in_order() {
        let mut transport = LoopTransport::default();
        transport.request_writable();
        transport.write(Message::text("a"));
        transport.write(Message::binary(vec![1]));
        transport.close(&CloseStatus::normal());

        assert!(transport.writable);
        let frames: Vec<_> = transport.outgoing.into_iter().collect();
        assert_eq!(frames[0], WireMessage::Text("a".to_string()));
        assert_eq!(frames[1], WireMessage::Binary(vec![1]));
        assert!(matches!(frames[2], WireMessage::Close(Some(_))));
    }

    #[test]
    fn test_rejected_input_maps_to_close_codes() {
        let code = |e: WireError| rejection_status(&e).map(|s| s.code());

        assert_eq!(
            code(WireError::Protocol(ProtocolError::UnexpectedContinueFrame)),
            Some(CloseStatus::PROTOCOL_ERROR)
        );
        assert_eq!(
            code(WireError::Protocol(ProtocolError::UnmaskedFrameFromClient)),
            Some(CloseStatus::PROTOCOL_ERROR)
        );
        assert_eq!(code(WireError::Utf8), Some(CloseStatus::UNSUPPORTED_DATA));
        assert_eq!(
            code(WireError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            None
        );
        assert_eq!(code(WireError::ConnectionClosed), None);
    }

    #[test]
    fn test_reserved_close_code_sends_empty_close() {
        let mut transport = LoopTransport::default();
        transport.close(&CloseStatus::abnormal("x"));
        assert_eq!(transport.outgoing.pop_front(), Some(WireMessage::Close(None)));
    }
}
