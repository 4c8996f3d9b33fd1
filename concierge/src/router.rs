//! Channel subscriptions and event fan-out.
//!
//! Several parts of an application may want the same channel. The router
//! keeps exactly one transport subscription per channel and fans each
//! decoded event out to every local handler, in registration order.
//!
//! A channel may also have one *primary* handler. Setting it replaces the
//! previous one, and it runs before the registered handlers.
//!
//! A channel has *users*: registered handlers, the primary, plus pins taken
//! by the session itself (joined rooms, the room list, the user queues). The
//! transport subscription is opened when the first user arrives and closed
//! when the last one leaves. The router never talks to the link; methods
//! that change transport subscriptions return the frames to send.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use concierge_proto::channel::Channel;
use concierge_proto::event::{EventType, ServerEvent};
use concierge_proto::frame::{Frame, headers};

/// Error a handler returns to report that it could not process an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// A channel event handler.
pub type Handler = Arc<dyn Fn(&Channel, &ServerEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Returned by [`SubscriptionRouter::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    channel: Channel,
    id: u64,
}

impl SubscriptionToken {
    /// The channel this token subscribes to.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }
}

/// What happened when an event was dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Handlers whose type filter excluded the event.
    pub skipped: usize,
}

struct Entry {
    id: u64,
    kinds: Option<Vec<EventType>>,
    handler: Handler,
}

impl Entry {
    fn accepts(&self, kind: EventType) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }
}

#[derive(Default)]
struct ChannelState {
    primary: Option<Handler>,
    handlers: Vec<Entry>,
    pins: u32,
    subscription_id: Option<String>,
}

impl ChannelState {
    fn has_users(&self) -> bool {
        self.primary.is_some() || !self.handlers.is_empty() || self.pins > 0
    }
}

/// Tracks channel users and transport subscription ids.
#[derive(Default)]
pub struct SubscriptionRouter {
    channels: HashMap<Channel, ChannelState>,
    by_subscription: HashMap<String, Channel>,
    next_handler: u64,
    next_subscription: u64,
    live: bool,
}

impl SubscriptionRouter {
    /// Create an empty router with no link.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event on `channel`.
    ///
    /// Returns the token and, when this is the channel's first user and the
    /// link is up, the `SUBSCRIBE` frame to send.
    pub fn subscribe(&mut self, channel: Channel, handler: Handler) -> (SubscriptionToken, Option<Frame>) {
        self.register(channel, None, handler)
    }

    /// Register `handler` for events of the given types only.
    pub fn subscribe_typed(
        &mut self,
        channel: Channel,
        kinds: &[EventType],
        handler: Handler,
    ) -> (SubscriptionToken, Option<Frame>) {
        self.register(channel, Some(kinds.to_vec()), handler)
    }

    fn register(
        &mut self,
        channel: Channel,
        kinds: Option<Vec<EventType>>,
        handler: Handler,
    ) -> (SubscriptionToken, Option<Frame>) {
        self.next_handler += 1;
        let id = self.next_handler;
        let frame = self.open_if_first(&channel);
        self.channels
            .entry(channel.clone())
            .or_default()
            .handlers
            .push(Entry { id, kinds, handler });
        (SubscriptionToken { channel, id }, frame)
    }

    /// Remove one handler. Returns `None` if the token was unknown; otherwise
    /// the `UNSUBSCRIBE` frame to send, if that was the channel's last user.
    pub fn unsubscribe(&mut self, token: &SubscriptionToken) -> Option<Option<Frame>> {
        let state = self.channels.get_mut(&token.channel)?;
        let before = state.handlers.len();
        state.handlers.retain(|e| e.id != token.id);
        if state.handlers.len() == before {
            return None;
        }
        Some(self.close_if_unused(&token.channel))
    }

    /// Install `handler` as the channel's primary, replacing any previous
    /// one. Returns the `SUBSCRIBE` frame when this opened the channel.
    pub fn set_primary(&mut self, channel: &Channel, handler: Handler) -> Option<Frame> {
        let frame = self.open_if_first(channel);
        if self
            .channels
            .entry(channel.clone())
            .or_default()
            .primary
            .replace(handler)
            .is_some()
        {
            tracing::debug!(%channel, "primary handler replaced");
        }
        frame
    }

    /// Remove the channel's primary. Returns `None` if there was none;
    /// otherwise the `UNSUBSCRIBE` frame to send, if it was the last user.
    pub fn clear_primary(&mut self, channel: &Channel) -> Option<Option<Frame>> {
        self.channels.get_mut(channel)?.primary.take()?;
        Some(self.close_if_unused(channel))
    }

    /// Whether `channel` has a primary handler.
    #[must_use]
    pub fn has_primary(&self, channel: &Channel) -> bool {
        self.channels.get(channel).is_some_and(|s| s.primary.is_some())
    }

    /// Take a session-owned pin on `channel`.
    pub fn retain(&mut self, channel: &Channel) -> Option<Frame> {
        let frame = self.open_if_first(channel);
        self.channels.entry(channel.clone()).or_default().pins += 1;
        frame
    }

    /// Drop a session-owned pin on `channel`.
    pub fn release(&mut self, channel: &Channel) -> Option<Frame> {
        let state = self.channels.get_mut(channel)?;
        state.pins = state.pins.saturating_sub(1);
        self.close_if_unused(channel)
    }

    /// Drop every handler and pin on `channel`.
    pub fn close_channel(&mut self, channel: &Channel) -> Option<Frame> {
        let state = self.channels.remove(channel)?;
        let id = state.subscription_id?;
        self.by_subscription.remove(&id);
        tracing::debug!(%channel, subscription = %id, "closing channel");
        Some(Frame::unsubscribe(&id))
    }

    fn open_if_first(&mut self, channel: &Channel) -> Option<Frame> {
        let already = self.channels.get(channel).is_some_and(ChannelState::has_users);
        if already || !self.live {
            return None;
        }
        Some(self.open(channel))
    }

    fn open(&mut self, channel: &Channel) -> Frame {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        self.by_subscription.insert(id.clone(), channel.clone());
        self.channels.entry(channel.clone()).or_default().subscription_id = Some(id.clone());
        tracing::debug!(%channel, subscription = %id, "subscribing");
        Frame::subscribe(&id, &channel.destination())
    }

    fn close_if_unused(&mut self, channel: &Channel) -> Option<Frame> {
        if self.channels.get(channel).is_some_and(ChannelState::has_users) {
            return None;
        }
        self.close_channel(channel)
    }

    /// The link came up: every channel with users is (re)subscribed.
    pub fn on_link_up(&mut self) -> Vec<Frame> {
        self.live = true;
        self.by_subscription.clear();
        let mut channels: Vec<Channel> = self
            .channels
            .iter()
            .filter(|(_, state)| state.has_users())
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels.iter().map(|channel| self.open(channel)).collect()
    }

    /// The link went down: transport subscriptions are gone, local users stay.
    pub fn on_link_down(&mut self) {
        self.live = false;
        self.by_subscription.clear();
        for state in self.channels.values_mut() {
            state.subscription_id = None;
        }
    }

    /// Which channel an inbound `MESSAGE` frame belongs to, by subscription
    /// id first and destination second.
    #[must_use]
    pub fn route(&self, frame: &Frame) -> Option<Channel> {
        frame
            .header(headers::SUBSCRIPTION)
            .and_then(|id| self.by_subscription.get(id).cloned())
            .or_else(|| frame.destination().and_then(Channel::parse))
    }

    /// Deliver `event` to the primary of `channel`, then to every handler in
    /// registration order.
    ///
    /// A handler that fails or panics is counted and logged; the rest still
    /// run.
    #[must_use]
    pub fn dispatch(&self, channel: &Channel, event: &ServerEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(state) = self.channels.get(channel) else {
            return report;
        };
        let kind = event.kind();
        if let Some(primary) = &state.primary {
            invoke(primary, channel, event, &mut report);
        }
        for entry in &state.handlers {
            if entry.accepts(kind) {
                invoke(&entry.handler, channel, event, &mut report);
            } else {
                report.skipped += 1;
            }
        }
        report
    }

    /// Number of handlers registered on `channel`.
    #[must_use]
    pub fn handler_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map_or(0, |s| s.handlers.len())
    }

    /// Whether `channel` currently has a transport subscription.
    #[must_use]
    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|s| s.subscription_id.is_some())
    }
}

fn invoke(handler: &Handler, channel: &Channel, event: &ServerEvent, report: &mut DispatchReport) {
    let kind = event.kind();
    match catch_unwind(AssertUnwindSafe(|| handler(channel, event))) {
        Ok(Ok(())) => report.delivered += 1,
        Ok(Err(e)) => {
            tracing::warn!(%channel, kind = kind.as_str(), err = %e, "handler failed");
            report.failed += 1;
        }
        Err(_) => {
            tracing::warn!(%channel, kind = kind.as_str(), "handler panicked");
            report.failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_proto::event::{EventBody, UnreadCounts};
    use concierge_proto::frame::Command;
    use concierge_proto::message::RoomCode;
    use parking_lot::Mutex;

    fn room(code: &str) -> Channel {
        Channel::Room(RoomCode::new(code))
    }

    fn event() -> ServerEvent {
        ServerEvent::new(EventBody::UnreadCounts(UnreadCounts::default()))
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        let log = Arc::clone(log);
        Arc::new(move |_, _| {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn first_user_opens_one_subscription() {
        let mut router = SubscriptionRouter::new();
        assert!(router.on_link_up().is_empty());
        let log = Arc::new(Mutex::new(Vec::new()));

        let (_a, frame_a) = router.subscribe(room("R1"), recording(&log, "a"));
        let (_b, frame_b) = router.subscribe(room("R1"), recording(&log, "b"));
        let frame_a = frame_a.unwrap();
        assert_eq!(frame_a.command, Command::Subscribe);
        assert_eq!(frame_a.destination(), Some("/topic/chat/R1"));
        assert!(frame_b.is_none());
        assert_eq!(router.handler_count(&room("R1")), 2);
    }

    #[test]
    fn last_handler_closes_subscription() {
        let mut router = SubscriptionRouter::new();
        router.on_link_up();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, _) = router.subscribe(room("R1"), recording(&log, "a"));
        let (b, _) = router.subscribe(room("R1"), recording(&log, "b"));

        assert_eq!(router.unsubscribe(&a), Some(None));
        assert!(router.is_subscribed(&room("R1")));
        let closing = router.unsubscribe(&b).flatten().unwrap();
        assert_eq!(closing.command, Command::Unsubscribe);
        assert!(!router.is_subscribed(&room("R1")));
        assert_eq!(router.unsubscribe(&b), None);
    }

    #[test]
    fn every_handler_sees_event_once_in_order() {
        let mut router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(room("R1"), recording(&log, "first"));
        router.subscribe(room("R1"), recording(&log, "second"));
        router.subscribe(room("R2"), recording(&log, "other"));

        let report = router.dispatch(&room("R1"), &event());
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn failing_handler_does_not_stop_others() {
        let mut router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(room("R1"), Arc::new(|_, _| Err(HandlerError("bad payload".into()))));
        router.subscribe(room("R1"), Arc::new(|_, _| panic!("handler bug")));
        router.subscribe(room("R1"), recording(&log, "last"));

        let report = router.dispatch(&room("R1"), &event());
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(*log.lock(), vec!["last"]);
    }

    #[test]
    fn typed_handlers_filter_by_kind() {
        let mut router = SubscriptionRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe_typed(Channel::Unread, &[EventType::ChatMessage], recording(&log, "chat"));
        router.subscribe_typed(Channel::Unread, &[EventType::UnreadCounts], recording(&log, "unread"));

        let report = router.dispatch(&Channel::Unread, &event());
        assert_eq!(report.skipped, 1);
        assert_eq!(*log.lock(), vec!["unread"]);
    }

    #[test]
    fn pins_keep_channel_open() {
        let mut router = SubscriptionRouter::new();
        router.on_link_up();
        assert!(router.retain(&room("R1")).is_some());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (token, frame) = router.subscribe(room("R1"), recording(&log, "ui"));
        assert!(frame.is_none());
        assert_eq!(router.unsubscribe(&token), Some(None));
        assert!(router.release(&room("R1")).is_some());
    }

    #[test]
    fn link_up_resubscribes_with_fresh_ids() {
        let mut router = SubscriptionRouter::new();
        router.retain(&Channel::RoomList);
        router.retain(&room("R1"));
        let first = router.on_link_up();
        assert_eq!(first.len(), 2);

        router.on_link_down();
        assert!(!router.is_subscribed(&room("R1")));
        let second = router.on_link_up();
        assert_eq!(second.len(), 2);
        let old: Vec<_> = first.iter().map(|f| f.header(headers::ID)).collect();
        let new: Vec<_> = second.iter().map(|f| f.header(headers::ID)).collect();
        assert_ne!(old, new);
    }

    #[test]
    fn routes_by_subscription_then_destination() {
        let mut router = SubscriptionRouter::new();
        router.on_link_up();
        let frame = router.retain(&room("R1")).unwrap();
        let id = frame.header(headers::ID).unwrap().to_string();

        let by_id = Frame::message(&id, "/elsewhere", "m-1", "{}");
        assert_eq!(router.route(&by_id), Some(room("R1")));

        let by_dest = Frame::message("unknown", "/user/queue/unread", "m-2", "{}");
        assert_eq!(router.route(&by_dest), Some(Channel::Unread));
    }

    #[test]
    fn primary_is_replaced_and_runs_first() {
        let mut router = SubscriptionRouter::new();
        router.on_link_up();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(room("R1"), recording(&log, "listener"));
        assert!(router.set_primary(&room("R1"), recording(&log, "old")).is_none());
        assert!(router.set_primary(&room("R1"), recording(&log, "view")).is_none());
        assert!(router.has_primary(&room("R1")));

        let report = router.dispatch(&room("R1"), &event());
        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock(), vec!["view", "listener"]);
    }

    #[test]
    fn primary_alone_holds_the_subscription() {
        let mut router = SubscriptionRouter::new();
        router.on_link_up();
        let log = Arc::new(Mutex::new(Vec::new()));
        let opening = router.set_primary(&room("R1"), recording(&log, "view")).unwrap();
        assert_eq!(opening.command, Command::Subscribe);

        let closing = router.clear_primary(&room("R1")).flatten().unwrap();
        assert_eq!(closing.command, Command::Unsubscribe);
        assert!(!router.has_primary(&room("R1")));
        assert_eq!(router.clear_primary(&room("R1")), None);
    }

    #[test]
    fn close_channel_drops_handlers() {
        let mut router = SubscriptionRouter::new();
        router.on_link_up();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(room("R1"), recording(&log, "a"));
        router.retain(&room("R1"));
        assert!(router.close_channel(&room("R1")).is_some());
        assert_eq!(router.handler_count(&room("R1")), 0);
        assert_eq!(router.dispatch(&room("R1"), &event()), DispatchReport::default());
    }
}
