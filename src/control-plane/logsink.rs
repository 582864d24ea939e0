use std::sync::{Arc, OnceLock};

use chrono::Utc;
use log::{Level, Log, Metadata, Record};

use arkctrl::schema::PushMessage;

use crate::events::{broker::EventBroker, Channel, Event};

/// Global logger that writes through to env_logger and mirrors the process's
/// own records onto the `system-log-data` push channel. The broker does not
/// exist yet when logging starts, so it is attached once after startup;
/// records logged before that only reach env_logger.
pub struct SystemLogSink {
    inner: env_logger::Logger,
    broker: OnceLock<Arc<EventBroker>>,
}

impl SystemLogSink {
    pub fn init(default_filter: &str) -> &'static SystemLogSink {
        let inner = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(default_filter),
        )
        .build();
        let sink: &'static SystemLogSink = Box::leak(Box::new(SystemLogSink {
            inner,
            broker: OnceLock::new(),
        }));
        log::set_max_level(sink.inner.filter());
        // only fails if a logger is already installed (tests), records then
        // keep flowing to that one
        let _ = log::set_logger(sink);
        sink
    }

    pub fn attach_broker(&self, broker: Arc<EventBroker>) {
        let _ = self.broker.set(broker);
    }

    fn mirror(&self, record: &Record<'_>) {
        // debug and trace are far too chatty for a push channel
        if record.level() > Level::Info {
            return;
        }
        // the broker's own diagnostics must not feed back into the channel
        if record.target().starts_with("control_plane::events") {
            return;
        }
        let broker = match self.broker.get() {
            Some(broker) => broker,
            None => return,
        };
        if !self.inner.matches(record) {
            return;
        }

        let timestamp = Utc::now();
        let payload = PushMessage::SystemLogData {
            line: format!(
                "{:5} {} {}",
                record.level(),
                record.target(),
                record.args()
            ),
            timestamp,
        };
        if let Ok(content) = serde_json::to_string(&payload) {
            broker.publish(Event {
                channel: Channel::SystemLogData,
                key: "control-plane".to_owned(),
                timestamp,
                content,
            });
        }
    }
}

impl Log for SystemLogSink {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        self.inner.log(record);
        self.mirror(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use futures::{pin_mut, FutureExt};
    use tokio_stream::StreamExt;

    use super::*;

    fn test_sink() -> SystemLogSink {
        SystemLogSink {
            inner: env_logger::Builder::new()
                .parse_filters("info")
                .is_test(true)
                .build(),
            broker: OnceLock::new(),
        }
    }

    fn emit(sink: &SystemLogSink, level: Level, target: &str, args: std::fmt::Arguments<'_>) {
        sink.log(
            &Record::builder()
                .level(level)
                .target(target)
                .args(args)
                .build(),
        );
    }

    #[tokio::test]
    async fn info_records_are_mirrored_to_the_push_channel() {
        let sink = test_sink();
        let broker = Arc::new(EventBroker::new());
        sink.attach_broker(Arc::clone(&broker));

        let s = broker.subscribe(Channel::SystemLogData, |_| true);
        pin_mut!(s);

        emit(
            &sink,
            Level::Info,
            "control_plane::supervisor",
            format_args!("server 'C1-Isle' -> starting"),
        );

        let event = s.next().await.unwrap();
        assert!(event.content.contains("\"type\":\"system-log-data\""));
        assert!(event.content.contains("server 'C1-Isle' -> starting"));
    }

    #[tokio::test]
    async fn debug_records_and_broker_diagnostics_are_not_mirrored() {
        let sink = test_sink();
        let broker = Arc::new(EventBroker::new());
        sink.attach_broker(Arc::clone(&broker));

        let s = broker.subscribe(Channel::SystemLogData, |_| true);
        pin_mut!(s);

        emit(
            &sink,
            Level::Debug,
            "control_plane::chat",
            format_args!("chat poll empty"),
        );
        emit(
            &sink,
            Level::Warn,
            "control_plane::events::broker",
            format_args!("subscriber lagged, skipped 3 events"),
        );

        assert_eq!(s.next().now_or_never(), None);
    }

    #[tokio::test]
    async fn records_before_broker_attach_are_dropped_quietly() {
        let sink = test_sink();
        emit(
            &sink,
            Level::Info,
            "control_plane",
            format_args!("starting up"),
        );

        let broker = Arc::new(EventBroker::new());
        sink.attach_broker(Arc::clone(&broker));
        let s = broker.subscribe(Channel::SystemLogData, |_| true);
        pin_mut!(s);
        assert_eq!(s.next().now_or_never(), None);
    }
}
