pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod repository;

pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, InMemoryUnitOfWork};
pub use postgres::{PostgresStore, PostgresUnitOfWork};
pub use query::{OrderQuery, Page};
pub use repository::{
    AddressRepository, CartRepository, OrderRepository, OutboxRepository, PaymentRepository,
    ProcessStateRepository, StockRepository, Store, UnitOfWork,
};
