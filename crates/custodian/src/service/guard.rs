use crate::collab::{Audience, EventDispatcher};
use serde_json::json;
use std::sync::Arc;

/// Held for the lifetime of one sign request. Dropping it, on any exit path including
/// cancellation of the owning future, tells the app the request is over.
pub struct InFlightRequest {
    events: Arc<dyn EventDispatcher>,
    end_event: &'static str,
}

impl InFlightRequest {
    pub fn acquire(events: &Arc<dyn EventDispatcher>, end_event: &'static str) -> Self {
        Self {
            events: Arc::clone(events),
            end_event,
        }
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        self.events
            .dispatch_event(Audience::App, self.end_event, json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ChannelEvents, EVENT_REQUEST_SIGN_END};

    #[test]
    fn end_event_fires_exactly_once_on_drop() -> eyre::Result<()> {
        let channel = ChannelEvents::new(4);
        let mut rx = channel.subscribe();
        let events: Arc<dyn EventDispatcher> = Arc::new(channel);
        {
            let _in_flight = InFlightRequest::acquire(&events, EVENT_REQUEST_SIGN_END);
            assert!(rx.try_recv().is_err(), "nothing before drop");
        }
        let ev = rx.try_recv()?;
        assert_eq!(ev.event, EVENT_REQUEST_SIGN_END);
        assert_eq!(ev.audience, Audience::App);
        assert!(rx.try_recv().is_err(), "exactly one event");
        Ok(())
    }
}
