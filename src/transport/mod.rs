//! HTTP transport shared by network backends.

mod http;

pub use http::{HttpReply, HttpTransport, TransportConfig};
