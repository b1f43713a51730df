//! Transactional outbox relay.
//!
//! Rows written next to stock and order changes are delivered to the search
//! index by [`OutboxRelay`]. Search availability never blocks a checkout.

pub mod error;
pub mod index;
pub mod relay;

pub use error::{IndexError, RelayError, Result};
pub use index::{InMemorySearchIndex, SearchIndex};
pub use relay::{OutboxRelay, RelayConfig, RelayReport};
