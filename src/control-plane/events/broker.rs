use std::collections::HashMap;

use futures::{future, Stream, StreamExt};
use log::warn;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::{Channel, Event, ALL_CHANNELS};

/// Topic-per-channel broadcast fan-out. Publishing never blocks; slow
/// subscribers lag and drop.
pub struct EventBroker {
    channels: HashMap<Channel, broadcast::Sender<Event>>,
}

impl EventBroker {
    const CHANNEL_CAPACITY: usize = 256;

    pub fn new() -> EventBroker {
        let mut channels = HashMap::new();
        for channel in ALL_CHANNELS {
            let (tx, ..) = broadcast::channel(EventBroker::CHANNEL_CAPACITY);
            channels.insert(channel, tx);
        }
        EventBroker { channels }
    }

    pub fn publish(&self, event: Event) {
        if let Some(tx) = self.channels.get(&event.channel) {
            // send() only errors when there are no receivers, which is fine
            let _ = tx.send(event);
        }
    }

    /// Subscribe to one channel, keeping only events whose key passes the
    /// filter. Lagged subscribers skip messages with a warning.
    pub fn subscribe<F>(&self, channel: Channel, filter: F) -> impl Stream<Item = Event> + Unpin
    where
        F: Fn(&str) -> bool + Clone + Send + 'static,
    {
        let rx = self
            .channels
            .get(&channel)
            .expect("all channels are created in new()")
            .subscribe();

        Box::pin(
            BroadcastStream::new(rx)
                .filter_map(move |r| {
                    let filter = filter.clone();
                    async move {
                        match r {
                            Ok(event) => filter(&event.key).then_some(event),
                            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                                warn!("subscriber lagged, skipped {} events", skipped);
                                None
                            }
                        }
                    }
                })
                .map(future::ready)
                .buffered(20),
        )
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        EventBroker::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use futures::{pin_mut, FutureExt};
    use tokio_stream::StreamExt;

    use super::*;

    fn test_event(key: &str, content: &str) -> Event {
        Event {
            channel: Channel::ArkChat,
            key: key.to_owned(),
            timestamp: Utc::now(),
            content: content.to_owned(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        arkctrl::util::testing::logger_init();

        let broker = EventBroker::new();
        let s = broker.subscribe(Channel::ArkChat, |k| k == "C1-Isle");
        pin_mut!(s);

        broker.publish(test_event("C1-Isle", "hello"));

        let e = s.next().await.unwrap();
        assert_eq!(e.content, "hello");
    }

    #[tokio::test]
    async fn subscriber_filters_by_key() {
        arkctrl::util::testing::logger_init();

        let broker = EventBroker::new();
        let s = broker.subscribe(Channel::ArkChat, |k| k == "C1-Rag");

        broker.publish(test_event("C1-Isle", "not for us"));

        pin_mut!(s);
        assert_eq!(s.next().now_or_never(), None);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        arkctrl::util::testing::logger_init();

        let broker = EventBroker::new();
        let s = broker.subscribe(Channel::JobProgress, |_| true);

        broker.publish(test_event("C1-Isle", "chat traffic"));

        pin_mut!(s);
        assert_eq!(s.next().now_or_never(), None);
    }

    #[tokio::test]
    async fn events_published_before_subscribe_are_dropped() {
        arkctrl::util::testing::logger_init();

        let broker = EventBroker::new();
        broker.publish(test_event("C1-Isle", "early"));

        let s = broker.subscribe(Channel::ArkChat, |_| true);
        pin_mut!(s);
        assert_eq!(s.next().now_or_never(), None);
    }
}
