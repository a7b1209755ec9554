//! Sans-IO protocol logic for the syncpod collaboration pod.
//!
//! Everything in this crate is pure: state machines take the current
//! time as a parameter and return actions for a driver to execute. The
//! production runtime (`syncpod-server`) and the deterministic test
//! harnesses both drive the same code.
//!
//! # Modules
//!
//! - [`env`]: time/randomness abstraction
//! - [`token`]: HMAC session-token verification
//! - [`presence`]: per-room presence table
//! - [`crdt`]: opaque CRDT document and kernel
//! - [`session`]: session state machine, rate limits, keepalive
//! - [`egress`]: bounded egress queue with presence coalescing
//! - [`room`]: room state and coordination logic
//! - [`backoff`]: retry policy for dependency errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod crdt;
pub mod egress;
pub mod env;
pub mod presence;
pub mod room;
pub mod session;
pub mod token;

pub use env::Environment;
pub use room::{Room, RoomAction, RoomConfig, RoomError, RoomId, SessionId};
pub use session::{Session, SessionAction, SessionConfig, SessionState};
