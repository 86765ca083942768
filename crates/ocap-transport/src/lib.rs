//! Point-to-point transport plumbing: duplex stream ends, the label
//! multiplexer, request/response correlation, and the timeout helper.

mod duplex;
mod error;
mod mux;
mod resolver;
mod timeout;

pub use duplex::{DuplexEnd, DuplexReader, DuplexWriter, duplex_pair};
pub use error::TransportError;
pub use mux::{Envelope, Multiplexer, MuxChannel, MuxSender};
pub use resolver::MessageResolver;
pub use timeout::with_timeout;
