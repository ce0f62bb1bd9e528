//! Connection state machine
//!
//! The dispatcher turns transport events into lifecycle transitions and
//! callback invocations. It runs only on the loop thread, is the sole consumer
//! of the outbound queue and the sole writer of the connection state.
//!
//! ```text
//! Idle --begin_connect--> Connecting --on_established--> Established
//!                             |                              |  \
//!                      on_connect_error              close req  peer close /
//!                             |                          |      transport end
//!                             v                          v        |
//!                           Closed <--close written-- Closing     |
//!                             ^-----------------------------------+
//! ```

use crate::core::close_status::{CloseOrigin, CloseStatus};
use crate::core::connection_state::ConnectionState;
use crate::core::link::Link;
use crate::core::message::{Message, MessageType};
use crate::traits::handler::guarded;
use crate::traits::{EventHandler, FramePosition, Headers, Transport};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Dispatcher<H: EventHandler> {
    link: Arc<Link>,
    handler: H,
    /// Message under reassembly
    partial: Option<Message>,
    /// Local close status waiting for write readiness
    pending_close: Option<CloseStatus>,
    close_fired: bool,
}

impl<H: EventHandler> Dispatcher<H> {
    pub(crate) fn new(link: Arc<Link>, handler: H) -> Self {
        Self {
            link,
            handler,
            partial: None,
            pending_close: None,
            close_fired: false,
        }
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.link.state.get()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Idle -> Connecting
    pub(crate) fn begin_connect(&mut self) {
        if self
            .link
            .state
            .compare_exchange(ConnectionState::Idle, ConnectionState::Connecting)
            .is_err()
        {
            warn!(conn = self.link.id(), state = %self.state(), "begin_connect outside Idle ignored");
        }
    }

    /// Connecting -> Established
    pub(crate) fn on_established(&mut self, headers: Headers, transport: &mut impl Transport) {
        if self.state() != ConnectionState::Connecting {
            warn!(conn = self.link.id(), state = %self.state(), "Handshake completion outside Connecting ignored");
            return;
        }
        self.link.set_headers(headers);
        self.link.state.set(ConnectionState::Established);
        debug!(conn = self.link.id(), "Connection established");

        let handler = &mut self.handler;
        guarded("on_establish", || handler.on_establish());

        // Anything requested while the handshake was in flight
        self.on_wake(transport);
    }

    /// Connecting -> Closed, reported through `on_error`
    pub(crate) fn on_connect_error(&mut self, message: &str) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.link.state.set(ConnectionState::Closed);
        let dropped = self.link.queue.clear();
        debug!(conn = self.link.id(), dropped, "Connection attempt failed: {}", message);

        let handler = &mut self.handler;
        guarded("on_error", || handler.on_error(message));
    }

    /// Connecting -> Closed without callbacks, for vetoed peers
    pub(crate) fn on_rejected(&mut self) {
        self.link.state.set(ConnectionState::Closed);
        self.link.queue.clear();
    }

    /// An application thread signalled the loop
    pub(crate) fn on_wake(&mut self, transport: &mut impl Transport) {
        if self.state() != ConnectionState::Established {
            return;
        }
        if let Some(status) = self.link.take_close_request() {
            debug!(conn = self.link.id(), "Local close requested: {}", status);
            self.begin_closing(status.with_origin(CloseOrigin::Local), transport);
            return;
        }
        if !self.link.queue.is_empty() {
            transport.request_writable();
        }
    }

    /// The transport can take one frame
    pub(crate) fn on_writable(&mut self, transport: &mut impl Transport) {
        if let Some(status) = self.pending_close.take() {
            transport.close(&status);
            let dropped = self.link.queue.clear();
            if dropped > 0 {
                debug!(conn = self.link.id(), dropped, "Discarded unsent messages on close");
            }
            self.finish(status);
            return;
        }

        if self.state() != ConnectionState::Established {
            return;
        }
        if let Some(message) = self.link.queue.pop() {
            self.link.stats.record_sent(message.len());
            transport.write(message);
            if !self.link.queue.is_empty() {
                transport.request_writable();
            }
        }
    }

    /// A data frame arrived
    pub(crate) fn on_frame(
        &mut self,
        position: FramePosition,
        payload: &[u8],
        transport: &mut impl Transport,
    ) {
        if !matches!(
            self.state(),
            ConnectionState::Established | ConnectionState::Closing
        ) || self.pending_close.is_some()
        {
            return;
        }

        let complete = match position {
            FramePosition::Whole(kind) => {
                if self.partial.is_some() {
                    return self.violation("new message while a fragmented one is pending", transport);
                }
                let mut message = Message::empty(kind);
                message.append(payload);
                message
            }
            FramePosition::First(kind) => {
                if self.partial.is_some() {
                    return self.violation("first fragment while another message is pending", transport);
                }
                let mut message = Message::empty(kind);
                message.append(payload);
                self.partial = Some(message);
                return;
            }
            FramePosition::Continuation => {
                match self.partial.as_mut() {
                    Some(message) => message.append(payload),
                    None => return self.violation("continuation without a first fragment", transport),
                }
                return;
            }
            FramePosition::Last => match self.partial.take() {
                Some(mut message) => {
                    message.append(payload);
                    message
                }
                None => return self.violation("final fragment without a first fragment", transport),
            },
        };

        if complete.message_type() == MessageType::Text && complete.validate().is_err() {
            warn!(conn = self.link.id(), "Text message is not valid UTF-8, closing");
            self.begin_closing(
                CloseStatus::new(CloseStatus::UNSUPPORTED_DATA).with_reason("invalid UTF-8 in text message"),
                transport,
            );
            return;
        }

        self.link.stats.record_received(complete.len());
        let handler = &mut self.handler;
        guarded("on_receive", || handler.on_receive(complete));
    }

    /// The peer sent a close frame
    ///
    /// The transport answers it; this only reports the peer's status.
    pub(crate) fn on_peer_close(&mut self, status: CloseStatus) {
        self.partial = None;
        self.pending_close = None;
        self.finish(status.with_origin(CloseOrigin::Peer));
    }

    /// The transport ended without a completed close handshake
    pub(crate) fn on_transport_end(&mut self, status: CloseStatus) {
        if self.state() == ConnectionState::Connecting {
            let reason = status.reason().unwrap_or("transport closed").to_string();
            self.on_connect_error(&reason);
            return;
        }
        self.partial = None;
        self.pending_close = None;
        self.finish(status);
    }

    /// The transport refused inbound data before it became a frame
    ///
    /// Writes the close frame at once; a close already pending is replaced.
    pub(crate) fn on_inbound_rejected(&mut self, status: CloseStatus, transport: &mut impl Transport) {
        if self.close_fired {
            return;
        }
        warn!(conn = self.link.id(), "Inbound data rejected: {}", status);
        self.partial = None;
        self.link.state.set(ConnectionState::Closing);
        self.pending_close = Some(status.with_origin(CloseOrigin::Local));
        self.on_writable(transport);
    }

    fn violation(&mut self, detail: &str, transport: &mut impl Transport) {
        warn!(conn = self.link.id(), "Protocol violation: {}", detail);
        self.partial = None;
        self.begin_closing(
            CloseStatus::new(CloseStatus::PROTOCOL_ERROR).with_reason(detail),
            transport,
        );
    }

    fn begin_closing(&mut self, status: CloseStatus, transport: &mut impl Transport) {
        if self.pending_close.is_some() || self.close_fired {
            return;
        }
        self.link.state.set(ConnectionState::Closing);
        self.pending_close = Some(status);
        transport.request_writable();
    }

    /// Enter Closed and fire `on_close` once
    fn finish(&mut self, status: CloseStatus) {
        self.link.state.set(ConnectionState::Closed);
        if self.close_fired {
            return;
        }
        self.close_fired = true;
        debug!(conn = self.link.id(), origin = ?status.origin(), "Connection closed: {}", status);

        let handler = &mut self.handler;
        guarded("on_close", || handler.on_close(&status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::PendingSendPolicy;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Error(String),
        Establish,
        Receive(Message),
        Close(u16, CloseOrigin),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl EventHandler for Recorder {
        fn on_error(&mut self, message: &str) {
            self.events.push(Event::Error(message.to_string()));
        }
        fn on_establish(&mut self) {
            self.events.push(Event::Establish);
        }
        fn on_receive(&mut self, message: Message) {
            self.events.push(Event::Receive(message));
        }
        fn on_close(&mut self, status: &CloseStatus) {
            self.events.push(Event::Close(status.code(), status.origin()));
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Written(Message),
        Closed(u16),
    }

    #[derive(Default)]
    struct RecordingTransport {
        writable: u32,
        ops: Vec<Op>,
    }

    impl Transport for RecordingTransport {
        fn request_writable(&mut self) {
            self.writable += 1;
        }
        fn write(&mut self, message: Message) {
            self.ops.push(Op::Written(message));
        }
        fn close(&mut self, status: &CloseStatus) {
            self.ops.push(Op::Closed(status.code()));
        }
    }

    impl RecordingTransport {
        /// Deliver every requested writable callback
        fn pump<H: EventHandler>(&mut self, dispatcher: &mut Dispatcher<H>) {
            while self.writable > 0 {
                self.writable -= 1;
                dispatcher.on_writable(self);
            }
        }
    }

    fn established() -> (Dispatcher<Recorder>, RecordingTransport) {
        let link = Arc::new(Link::new(1, PendingSendPolicy::Queue));
        let mut dispatcher = Dispatcher::new(link, Recorder::default());
        let mut transport = RecordingTransport::default();
        dispatcher.begin_connect();
        dispatcher.on_established(Headers::new(), &mut transport);
        (dispatcher, transport)
    }

    #[test]
    fn test_lifecycle_to_local_close() {
        let (mut d, mut t) = established();
        assert_eq!(d.state(), ConnectionState::Established);

        d.link().request_close(None);
        d.on_wake(&mut t);
        assert_eq!(d.state(), ConnectionState::Closing);

        t.pump(&mut d);
        assert_eq!(d.state(), ConnectionState::Closed);
        assert_eq!(t.ops, vec![Op::Closed(1000)]);
        assert_eq!(
            d.handler.events,
            vec![Event::Establish, Event::Close(1000, CloseOrigin::Local)]
        );
    }

    #[test]
    fn test_writes_in_fifo_order_one_per_writable() {
        let (mut d, mut t) = established();
        d.link().send(Message::text("ping")).unwrap();
        d.link().send(Message::text("pong")).unwrap();
        d.on_wake(&mut t);

        assert_eq!(t.writable, 1);
        d.on_writable(&mut t);
        assert_eq!(t.ops.len(), 1);
        assert_eq!(t.writable, 1, "re-armed while queue non-empty");
        t.pump(&mut d);

        assert_eq!(
            t.ops,
            vec![
                Op::Written(Message::text("ping")),
                Op::Written(Message::text("pong"))
            ]
        );
        assert_eq!(d.link().stats.snapshot().messages_sent, 2);
    }

    #[test]
    fn test_queued_before_established_flushes_after() {
        let link = Arc::new(Link::new(1, PendingSendPolicy::Queue));
        let mut d = Dispatcher::new(Arc::clone(&link), Recorder::default());
        let mut t = RecordingTransport::default();
        d.begin_connect();
        link.send(Message::text("early")).unwrap();

        d.on_established(Headers::new(), &mut t);
        t.pump(&mut d);
        assert_eq!(t.ops, vec![Op::Written(Message::text("early"))]);
    }

    #[test]
    fn test_no_data_after_close_begins() {
        let (mut d, mut t) = established();
        d.link().send(Message::text("a")).unwrap();
        d.link().request_close(Some(CloseStatus::going_away()));
        d.on_wake(&mut t);
        t.pump(&mut d);

        assert_eq!(t.ops, vec![Op::Closed(1001)]);
        assert!(d.link().queue.is_empty());
    }

    #[test]
    fn test_reassembly_fires_once() {
        let (mut d, mut t) = established();
        d.on_frame(FramePosition::First(MessageType::Text), b"hel", &mut t);
        d.on_frame(FramePosition::Continuation, b"lo ", &mut t);
        assert_eq!(d.handler.events.len(), 1);
        d.on_frame(FramePosition::Last, b"world", &mut t);

        assert_eq!(
            d.handler.events,
            vec![Event::Establish, Event::Receive(Message::text("hello world"))]
        );
        assert_eq!(d.link().stats.snapshot().bytes_received, 11);
    }

    #[test]
    fn test_whole_binary_frame_delivered() {
        let (mut d, mut t) = established();
        d.on_frame(FramePosition::Whole(MessageType::Binary), &[1, 2], &mut t);
        assert_eq!(
            d.handler.events.last(),
            Some(&Event::Receive(Message::binary(vec![1, 2])))
        );
    }

    #[test]
    fn test_continuation_without_first_closes_with_protocol_error() {
        let (mut d, mut t) = established();
        d.on_frame(FramePosition::Continuation, b"x", &mut t);
        assert_eq!(d.state(), ConnectionState::Closing);
        t.pump(&mut d);
        assert_eq!(t.ops, vec![Op::Closed(CloseStatus::PROTOCOL_ERROR)]);
        assert_eq!(
            d.handler.events.last(),
            Some(&Event::Close(1002, CloseOrigin::Local))
        );
    }

    #[test]
    fn test_split_invalid_utf8_closes_with_unsupported_data() {
        let (mut d, mut t) = established();
        d.on_frame(FramePosition::First(MessageType::Text), &[0xe2, 0x98], &mut t);
        d.on_frame(FramePosition::Last, &[0x28], &mut t);
        t.pump(&mut d);
        assert_eq!(t.ops, vec![Op::Closed(CloseStatus::UNSUPPORTED_DATA)]);
        assert!(!d
            .handler
            .events
            .iter()
            .any(|e| matches!(e, Event::Receive(_))));
    }

    #[test]
    fn test_inbound_rejection_writes_close_immediately() {
        let (mut d, mut t) = established();
        d.link().send(Message::text("unsent")).unwrap();
        d.on_inbound_rejected(
            CloseStatus::new(CloseStatus::UNSUPPORTED_DATA).with_reason("invalid UTF-8"),
            &mut t,
        );

        assert_eq!(d.state(), ConnectionState::Closed);
        assert_eq!(t.ops, vec![Op::Closed(CloseStatus::UNSUPPORTED_DATA)]);
        assert!(d.link().queue.is_empty());
        assert_eq!(
            d.handler.events.last(),
            Some(&Event::Close(1007, CloseOrigin::Local))
        );
    }

    #[test]
    fn test_inbound_rejection_overrides_pending_close() {
        let (mut d, mut t) = established();
        d.link().request_close(None);
        d.on_wake(&mut t);
        assert_eq!(d.state(), ConnectionState::Closing);

        d.on_inbound_rejected(CloseStatus::new(CloseStatus::PROTOCOL_ERROR), &mut t);
        t.pump(&mut d);
        assert_eq!(t.ops, vec![Op::Closed(1002)]);

        d.on_inbound_rejected(CloseStatus::new(CloseStatus::PROTOCOL_ERROR), &mut t);
        assert_eq!(t.ops.len(), 1, "nothing written once closed");
        let closes = d
            .handler
            .events
            .iter()
            .filter(|e| matches!(e, Event::Close(..)))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_peer_close_reports_remote_code_once() {
        let (mut d, _t) = established();
        d.on_peer_close(CloseStatus::new(4001).with_reason("bye"));
        d.on_transport_end(CloseStatus::abnormal("eof"));
        assert_eq!(
            d.handler.events,
            vec![Event::Establish, Event::Close(4001, CloseOrigin::Peer)]
        );
    }

    #[test]
    fn test_transport_end_is_abnormal() {
        let (mut d, _t) = established();
        d.on_transport_end(CloseStatus::abnormal("reset").with_origin(CloseOrigin::Peer));
        assert_eq!(
            d.handler.events.last(),
            Some(&Event::Close(CloseStatus::ABNORMAL, CloseOrigin::Peer))
        );
        assert!(d.is_closed());
    }

    #[test]
    fn test_connect_error_never_reaches_established() {
        let link = Arc::new(Link::new(1, PendingSendPolicy::Queue));
        let mut d = Dispatcher::new(link, Recorder::default());
        d.begin_connect();
        d.on_connect_error("refused");
        assert!(d.is_closed());
        assert_eq!(d.handler.events, vec![Event::Error("refused".to_string())]);

        let mut t = RecordingTransport::default();
        d.on_established(Headers::new(), &mut t);
        assert!(d.is_closed());
    }

    #[test]
    fn test_panicking_callback_does_not_break_dispatch() {
        struct Exploding(u32);
        impl EventHandler for Exploding {
            fn on_error(&mut self, _: &str) {}
            fn on_establish(&mut self) {}
            fn on_receive(&mut self, _: Message) {
                self.0 += 1;
                panic!("handler bug");
            }
            fn on_close(&mut self, _: &CloseStatus) {}
        }

        let link = Arc::new(Link::new(1, PendingSendPolicy::Queue));
        let mut d = Dispatcher::new(link, Exploding(0));
        let mut t = RecordingTransport::default();
        d.begin_connect();
        d.on_established(Headers::new(), &mut t);
        d.on_frame(FramePosition::Whole(MessageType::Text), b"a", &mut t);
        d.on_frame(FramePosition::Whole(MessageType::Text), b"b", &mut t);
        assert_eq!(d.handler.0, 2);
        assert_eq!(d.state(), ConnectionState::Established);
    }
}
