//! `roomstream` — long-poll channel client for room event streams.
//!
//! ARCHITECTURE
//! ============
//! `SessionRegistry::join` starts one lifecycle task per room. Each lifecycle
//! runs the two-step handshake, opens the length-prefixed stream, decodes it
//! with `frames::StreamFramer`, classifies frames, and publishes
//! `ChannelEvent`s on the registry's `EventBus`. Failures go through
//! `ReconnectPolicy`; a `CredentialRefresher` task renews the session's
//! credentials while a stream is open.

pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod refresh;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::ChannelConfig;
pub use error::ChannelError;
pub use event::{ChannelEvent, EventBus, SessionSnapshot};
pub use registry::SessionRegistry;
pub use transport::{ChannelTransport, HttpTransport};
