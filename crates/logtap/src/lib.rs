//! logtap: an HTTP/HTTPS intercepting forward proxy for developer
//! observability.
//!
//! Clients point their HTTP proxy at logtap and trust its root certificate.
//! Plain HTTP is forwarded as-is; HTTPS destinations are intercepted via
//! CONNECT with a per-host leaf certificate minted on demand. Every exchange
//! is written, decoded, to its own log file.

pub mod ca;
pub mod config;
pub mod http1;
pub mod intercept;
pub mod proxy;
pub mod telemetry;

pub use config::Config;
pub use proxy::{Proxy, ProxyError};
