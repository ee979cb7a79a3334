//! Job persistence: the store boundary plus in-memory and Postgres backends.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{DispatchLimit, EnqueueLimit, JobStore};
