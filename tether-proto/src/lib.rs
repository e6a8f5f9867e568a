//! Wire protocol for tether host↔guest communication.
//!
//! A single vsock connection is split into independent streams by
//! [`Session`]. Every stream carries self-describing JSON [`Event`]s so the
//! receiver can read the `kind` discriminant before committing to a
//! concrete payload shape.

mod codec;
mod error;
mod message;
mod session;

pub use codec::{FrameHeader, FrameKind, MAX_FRAME, read_frame, write_frame};
pub use error::{Error, Result};
pub use message::{
    DnsEvent, DnsResponse, Endpoint, Event, HOST_PORT, InfoEvent, PortEvent, kind,
};
pub use session::{Session, Stream};
