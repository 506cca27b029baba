//! The multiplexer: ingest, snapshot, subscribe

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use tracing::debug;

use crate::buffer::RingBuffer;
use crate::{LogEvent, LogStream};

/// Default subscriber channel capacity
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Receiver half of a live log subscription; dropping it unsubscribes
pub type Subscription = async_channel::Receiver<LogEvent>;

/// Subscriber/snapshot filter
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    /// Only this service (all services when `None`)
    pub service: Option<String>,
    /// Only this stream
    pub stream: Option<LogStream>,
    /// Only lines matching this pattern
    pub grep: Option<Regex>,
}

impl LogFilter {
    /// Filter for a single service
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
            ..Self::default()
        }
    }

    fn matches(&self, event: &LogEvent) -> bool {
        if let Some(service) = &self.service {
            if &event.service_name != service {
                return false;
            }
        }
        // Synthetic events always pass the stream/grep filters so a
        // subscriber cannot filter away its own lag notice.
        if event.stream == LogStream::System {
            return true;
        }
        if let Some(stream) = self.stream {
            if event.stream != stream {
                return false;
            }
        }
        if let Some(grep) = &self.grep {
            if !grep.is_match(&event.line) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct ServiceBuffers {
    stdout: RingBuffer,
    stderr: RingBuffer,
}

struct Subscriber {
    filter: LogFilter,
    tx: async_channel::Sender<LogEvent>,
    lagged: bool,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<String, ServiceBuffers>,
    subscribers: Vec<Subscriber>,
}

/// Line-buffered log fan-out shared by every supervisor of a run
///
/// Ingest takes a plain mutex for a few pushes and try-sends; it never
/// blocks on subscriber consumption, so a supervisor's output pump can call
/// it from inside its line monitor callback.
#[derive(Default)]
pub struct LogMultiplexer {
    inner: Mutex<Inner>,
}

impl LogMultiplexer {
    /// Create an empty multiplexer
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one line and fan it out to matching subscribers
    pub fn ingest(&self, service: &str, stream: LogStream, line: &str) {
        let event = LogEvent::new(service, stream, line);
        let mut inner = self.inner.lock().expect("log mutex poisoned");

        if stream != LogStream::System {
            let buffers = inner.buffers.entry(service.to_string()).or_default();
            match stream {
                LogStream::Stdout => buffers.stdout.push(event.clone()),
                LogStream::Stderr => buffers.stderr.push(event.clone()),
                LogStream::System => unreachable!(),
            }
        }

        inner.subscribers.retain_mut(|sub| {
            if sub.lagged {
                // One-shot lag notice, then close.
                let notice = LogEvent::new(
                    sub.filter.service.clone().unwrap_or_default(),
                    LogStream::System,
                    "subscriber lagged behind, closing",
                );
                match sub.tx.try_send(notice) {
                    Ok(()) => {
                        sub.tx.close();
                        false
                    }
                    Err(async_channel::TrySendError::Full(_)) => true,
                    Err(async_channel::TrySendError::Closed(_)) => false,
                }
            } else if sub.filter.matches(&event) {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(async_channel::TrySendError::Full(_)) => {
                        debug!(service, "log subscriber lagged");
                        sub.lagged = true;
                        true
                    }
                    Err(async_channel::TrySendError::Closed(_)) => false,
                }
            } else {
                true
            }
        });
    }

    /// Point-in-time read of buffered lines
    pub fn snapshot(&self, filter: &LogFilter, tail: Option<usize>) -> Vec<LogEvent> {
        let inner = self.inner.lock().expect("log mutex poisoned");

        let mut events: Vec<LogEvent> = Vec::new();
        for (service, buffers) in &inner.buffers {
            if let Some(wanted) = &filter.service {
                if wanted != service {
                    continue;
                }
            }
            events.extend(buffers.stdout.iter().cloned());
            events.extend(buffers.stderr.iter().cloned());
        }

        events.retain(|e| filter.matches(e));
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        if let Some(tail) = tail {
            let skip = events.len().saturating_sub(tail);
            events.drain(..skip);
        }
        events
    }

    /// Subscribe with the default channel capacity
    pub fn subscribe(&self, filter: LogFilter, tail: Option<usize>) -> Subscription {
        self.subscribe_with_capacity(filter, tail, SUBSCRIBER_CAPACITY)
    }

    /// Subscribe with an explicit channel capacity
    ///
    /// The subscription starts with a replay of the buffered tail, then
    /// streams live events. A subscriber that stays full across ingests is
    /// lagged out (see module docs).
    pub fn subscribe_with_capacity(
        &self,
        filter: LogFilter,
        tail: Option<usize>,
        capacity: usize,
    ) -> Subscription {
        let (tx, rx) = async_channel::bounded(capacity.max(1));

        // Replay before registering so live events cannot interleave behind
        // older buffered ones.
        if let Some(tail) = tail {
            let replay = self.snapshot(&filter, Some(tail.min(capacity)));
            for event in replay {
                let _ = tx.try_send(event);
            }
        }

        let mut inner = self.inner.lock().expect("log mutex poisoned");
        inner.subscribers.push(Subscriber {
            filter,
            tx,
            lagged: false,
        });
        rx
    }

    /// Names of services with buffered output
    pub fn services(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("log mutex poisoned");
        let mut names: Vec<_> = inner.buffers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every subscription; queued events remain readable
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("log mutex poisoned");
        for sub in inner.subscribers.drain(..) {
            sub.tx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_tail_and_grep() {
        let mux = LogMultiplexer::new();
        for i in 0..10 {
            mux.ingest("web", LogStream::Stdout, &format!("request {}", i));
        }
        mux.ingest("web", LogStream::Stderr, "warning: slow");

        let all = mux.snapshot(&LogFilter::service("web"), None);
        assert_eq!(all.len(), 11);

        let tail = mux.snapshot(&LogFilter::service("web"), Some(3));
        assert_eq!(tail.len(), 3);

        let filter = LogFilter {
            service: Some("web".to_string()),
            stream: None,
            grep: Some(Regex::new("request [89]").unwrap()),
        };
        let grepped = mux.snapshot(&filter, None);
        assert_eq!(grepped.len(), 2);
    }

    #[test]
    fn test_stream_filter() {
        let mux = LogMultiplexer::new();
        mux.ingest("web", LogStream::Stdout, "out");
        mux.ingest("web", LogStream::Stderr, "err");

        let filter = LogFilter {
            service: Some("web".to_string()),
            stream: Some(LogStream::Stderr),
            grep: None,
        };
        let events = mux.snapshot(&filter, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].line, "err");
    }

    #[smol_potat::test]
    async fn test_subscribe_receives_in_order() {
        let mux = LogMultiplexer::new();
        let rx = mux.subscribe(LogFilter::service("web"), None);

        for i in 0..100 {
            mux.ingest("web", LogStream::Stdout, &format!("{}", i));
        }

        for i in 0..100 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.line, format!("{}", i));
        }
    }

    #[smol_potat::test]
    async fn test_subscribe_replays_tail_first() {
        let mux = LogMultiplexer::new();
        mux.ingest("web", LogStream::Stdout, "old-1");
        mux.ingest("web", LogStream::Stdout, "old-2");

        let rx = mux.subscribe(LogFilter::service("web"), Some(10));
        mux.ingest("web", LogStream::Stdout, "live");

        assert_eq!(rx.recv().await.unwrap().line, "old-1");
        assert_eq!(rx.recv().await.unwrap().line, "old-2");
        assert_eq!(rx.recv().await.unwrap().line, "live");
    }

    #[smol_potat::test]
    async fn test_lagged_subscriber_notified_and_closed() {
        let mux = LogMultiplexer::new();
        let rx = mux.subscribe_with_capacity(LogFilter::service("web"), None, 2);

        // Fill the channel, then overflow it.
        mux.ingest("web", LogStream::Stdout, "1");
        mux.ingest("web", LogStream::Stdout, "2");
        mux.ingest("web", LogStream::Stdout, "3");

        // Drain: the queued lines arrive, then the lag notice on the next
        // ingest, then the channel closes.
        assert_eq!(rx.recv().await.unwrap().line, "1");
        assert_eq!(rx.recv().await.unwrap().line, "2");
        mux.ingest("web", LogStream::Stdout, "4");

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.stream, LogStream::System);
        assert!(rx.recv().await.is_err());
    }

    #[smol_potat::test]
    async fn test_dropped_receiver_unsubscribes() {
        let mux = LogMultiplexer::new();
        let rx = mux.subscribe(LogFilter::default(), None);
        drop(rx);

        mux.ingest("web", LogStream::Stdout, "line");
        let inner = mux.inner.lock().unwrap();
        assert!(inner.subscribers.is_empty());
    }
}
