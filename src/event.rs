use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const OPEN: &str = "open";
pub const CLOSE: &str = "close";
pub const TRACK: &str = "track";

/// Payload delivered to listeners registered with [crate::Connection::on].
#[derive(Debug, Clone)]
pub enum Event<R> {
    /// Message channel has been opened.
    Open,
    /// Message channel has been closed.
    Close,
    /// Remote peer started sending a media track.
    Track(R),
    /// Application message, the `data` part of the `{type, data}` envelope.
    Message(serde_json::Value),
}

/// Wire format of every application message sent over the message channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub type Listener<D> = Arc<dyn Fn(&D) + Send + Sync>;

/// Fans events out to listeners registered per event type, in registration order.
pub struct EventBus<D> {
    listeners: ArcSwap<HashMap<String, Vec<Listener<D>>>>,
}

impl<D> EventBus<D> {
    pub fn new() -> Self {
        EventBus {
            listeners: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn on<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        let listener: Listener<D> = Arc::new(listener);
        self.listeners.rcu(|old| {
            let mut listeners = HashMap::clone(old);
            listeners
                .entry(event_type.to_owned())
                .or_default()
                .push(listener.clone());
            listeners
        });
    }

    /// Calls all listeners of `event_type` registered at the moment of the call. Returns the
    /// number of listeners called.
    pub fn emit(&self, event_type: &str, data: &D) -> usize {
        let snapshot = self.listeners.load();
        match snapshot.get(event_type) {
            None => 0,
            Some(listeners) => {
                for listener in listeners {
                    listener(data);
                }
                listeners.len()
            }
        }
    }
}

impl<D> Default for EventBus<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> std::fmt::Debug for EventBus<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.load();
        let mut types: Vec<_> = listeners.keys().collect();
        types.sort();
        f.debug_struct("EventBus").field("types", &types).finish()
    }
}
