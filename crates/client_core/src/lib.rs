//! Client-side messaging engine: keeps channels and messages in sync with the
//! backend through request/response fetches and server-sent event streams.

pub mod config;
pub mod error;
pub mod event_stream;
pub mod events;
pub mod messenger;
pub mod presentation;
pub mod session;
pub mod storage;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod user_directory;

pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, ClientResult, ValidationError};
pub use events::MessengerEvent;
pub use messenger::Messenger;
pub use subscriptions::SubscriptionStatus;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod tests_support;
