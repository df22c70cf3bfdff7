//! `pist` establishes [webrtc](https://webrtc.rs) peer connections without a signaling server.
//! Instead, both peers read and write a shared *room document* kept in a document store both of
//! them have access to (GitHub Gists by default):
//! - The creating peer publishes an offer together with its local candidates, then polls the
//!   room until an answer shows up.
//! - The joining peer picks the offer up, applies it and publishes an answer with its own local
//!   candidates.
//!
//! Once connected, peers exchange typed application messages (`{"type": .., "data": ..}`) over a
//! single data channel, and can renegotiate the session (ie. after adding a media track) using
//! the same room.
//!
//! Room documents use the same format as the `pist` JavaScript library, so both can be used on
//! either side of a connection.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pist::{Connection, Error, Event, Options, DEFAULT_ROOM_ID};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let token = std::env::var("GITHUB_TOKEN").expect("GITHUB_TOKEN not set");
//!     let connection = Connection::connect(&token, None, Options::default()).await?;
//!
//!     connection.on("hello", |e| {
//!         if let Event::Message(data) = e {
//!             println!("remote peer says: {}", data);
//!         }
//!     });
//!
//!     // the other peer calls `join_room(DEFAULT_ROOM_ID)`
//!     connection.create_room(DEFAULT_ROOM_ID).await?;
//!
//!     let mut state = connection.subscribe_state();
//!     while *state.borrow_and_update() != pist::State::Connected {
//!         state.changed().await.unwrap();
//!     }
//!     connection.send("hello", "world").await.ok();
//!
//!     connection.leave_room(DEFAULT_ROOM_ID).await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod data_channel;
pub mod error;
pub mod event;
pub mod gather;
pub mod gist;
#[cfg(test)]
mod mock;
pub mod peer_connection;
pub mod room;
pub mod store;
pub mod transport;

pub use connection::{Connection, Options, RegatherPolicy, State};
pub use data_channel::DataChannel;
pub use error::Error;
pub use event::Event;
pub use gist::GistStore;
pub use peer_connection::WebrtcTransport;
pub use room::{Candidate, Room, SessionDescription, DEFAULT_ROOM_ID};
pub use store::{DocumentStore, MemoryStore};
pub use transport::{MessageChannel, Transport, TransportEvent};
