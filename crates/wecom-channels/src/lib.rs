//! Secure webhook callback core for the WeCom bridge.
//!
//! Inbound callbacks are verified, decrypted, routed and answered with an
//! encrypted reply. Long replies are served as "stream" sessions that the
//! platform polls and the outbound send path appends to.

pub mod crypto;
pub mod dispatcher;
pub mod outbound;
pub mod push;
pub mod replay;
pub mod server;
pub mod signature;
pub mod stream;
pub mod target;
