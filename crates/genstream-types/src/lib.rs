//! Wire protocol shared by the session server and its clients
//!
//! A generation session is observed as an ordered stream of typed events. The
//! server stamps every event that goes through a session's event log with a
//! sequence id; clients remember the last id they saw and hand it back when
//! they resubscribe, which is all the server needs to replay the gap.
//!
//! ## Example
//!
//! ```rust
//! use genstream_types::{ClientMessage, Event, ServerMessage};
//!
//! let message = ClientMessage::parse(r#"{"type":"subscribe","sessionId":"S1","lastEventId":2}"#)
//!     .unwrap();
//! assert_eq!(
//!     message,
//!     ClientMessage::Subscribe {
//!         session_id: Some("S1".to_string()),
//!         last_event_id: Some(2),
//!     }
//! );
//!
//! let pong = ServerMessage::unbuffered(Event::Pong);
//! assert!(pong.id.is_none());
//! ```

pub mod error;
pub mod events;
pub mod types;

pub use error::*;
pub use events::*;
pub use types::*;
