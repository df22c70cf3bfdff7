//! Contract of the transport session negotiated over the document store.
//!
//! Transport doesn't call back into the connection. Instead, everything it observes
//! (local candidates, incoming channels, tracks, channel state, messages) is pushed as a
//! [TransportEvent] into the sender it was started with.

use crate::error::Error;
use crate::room::{Candidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Bidirectional text message channel established alongside the transport session.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait Transport: Send + Sync + Sized + 'static {
    type Channel: MessageChannel + 'static;
    type LocalTrack: Send + 'static;
    type RemoteTrack: Clone + Send + Sync + 'static;
    type Sender: Send + Sync + 'static;

    /// Creates a message channel. It must be created before the offer in order to be included
    /// in it.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<Self::Channel>, Error>;

    async fn create_offer(&self) -> Result<SessionDescription, Error>;

    async fn create_answer(&self) -> Result<SessionDescription, Error>;

    /// Commits a local description. This is what starts local candidate discovery.
    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), Error>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), Error>;

    /// Must be called after the remote description has been set.
    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), Error>;

    async fn add_track(&self, track: Self::LocalTrack) -> Result<Self::Sender, Error>;

    async fn remove_track(&self, sender: &Self::Sender) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Notification produced by a [Transport].
pub enum TransportEvent<T: Transport> {
    /// Locally discovered candidate. `None` marks the end of candidate discovery.
    Candidate(Option<Candidate>),
    /// Message channel opened by the remote peer.
    Channel(Arc<T::Channel>),
    ChannelOpen,
    ChannelClose,
    Message(String),
    Track(T::RemoteTrack),
    /// Session parameters changed in a way that requires a new offer/answer round.
    NegotiationNeeded,
}

impl<T: Transport> std::fmt::Debug for TransportEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Candidate(c) => f.debug_tuple("Candidate").field(c).finish(),
            TransportEvent::Channel(c) => f.debug_tuple("Channel").field(&c.label()).finish(),
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelClose => f.write_str("ChannelClose"),
            TransportEvent::Message(m) => f.debug_tuple("Message").field(m).finish(),
            TransportEvent::Track(_) => f.write_str("Track"),
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
        }
    }
}

pub type TransportEvents<T> = UnboundedSender<TransportEvent<T>>;

pub type TransportEventReceiver<T> = UnboundedReceiver<TransportEvent<T>>;
