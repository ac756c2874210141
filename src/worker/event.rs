//! Events surfaced to Rust listeners and the registry that holds them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::codec::StructuredValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Error,
    Close,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Message, EventKind::Error, EventKind::Close];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EventKind::Message),
            "error" => Ok(EventKind::Error),
            "close" => Ok(EventKind::Close),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// An event handed to listeners of a [`Worker`](super::Worker).
///
/// `timestamp` is taken when the receiving side builds the event, not when
/// the peer sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub kind: EventKind,
    pub data: StructuredValue,
    /// Error text for `error` events
    pub message: Option<String>,
    pub timestamp: SystemTime,
}

impl MessageEvent {
    pub fn message(data: StructuredValue) -> Self {
        Self::new(EventKind::Message, data, None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, StructuredValue::Undefined, Some(message.into()))
    }

    pub fn close() -> Self {
        Self::new(EventKind::Close, StructuredValue::Undefined, None)
    }

    fn new(kind: EventKind, data: StructuredValue, message: Option<String>) -> Self {
        Self {
            kind,
            data,
            message,
            timestamp: SystemTime::now(),
        }
    }

    /// Milliseconds since the Unix epoch, the clock `Date.now()` uses.
    pub fn timestamp_millis(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

pub type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Identifies a listener added with `add_event_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    listener: Option<Listener>,
}

/// Ordered listener lists, one per event kind.
///
/// Position 0 of every list is the assignable handler slot (`onmessage`
/// and friends). It always exists, is skipped while empty and runs before
/// the listeners added after it.
pub struct ListenerRegistry {
    lists: HashMap<EventKind, Vec<Entry>>,
    next_id: u64,
}

const HANDLER_SLOT: ListenerId = ListenerId(0);

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        let lists = EventKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    vec![Entry {
                        id: HANDLER_SLOT,
                        listener: None,
                    }],
                )
            })
            .collect();
        Self { lists, next_id: 1 }
    }

    pub fn add(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.list_mut(kind).push(Entry {
            id,
            listener: Some(listener),
        });
        id
    }

    /// Remove a listener added with [`add`](Self::add). The handler slot
    /// cannot be removed this way; clear it with `set_handler(kind, None)`.
    pub fn remove(&mut self, kind: EventKind, id: ListenerId) -> bool {
        if id == HANDLER_SLOT {
            return false;
        }
        let list = self.list_mut(kind);
        match list.iter().position(|entry| entry.id == id) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn set_handler(&mut self, kind: EventKind, listener: Option<Listener>) {
        self.list_mut(kind)[0].listener = listener;
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.lists
            .get(&kind)
            .and_then(|list| list.first())
            .is_some_and(|entry| entry.listener.is_some())
    }

    /// Listeners to invoke for one event, in dispatch order.
    pub fn snapshot(&self, kind: EventKind) -> Vec<Listener> {
        self.lists
            .get(&kind)
            .map(|list| list.iter().filter_map(|e| e.listener.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.lists
            .get(&kind)
            .map(|list| list.iter().filter(|e| e.listener.is_some()).count())
            .unwrap_or(0)
    }

    fn list_mut(&mut self, kind: EventKind) -> &mut Vec<Entry> {
        self.lists.entry(kind).or_insert_with(|| {
            vec![Entry {
                id: HANDLER_SLOT,
                listener: None,
            }]
        })
    }
}
