pub mod error;
pub mod events;
pub mod memory;
pub mod redb_store;
pub mod store;

pub use error::StoreError;
pub use events::AuditEvent;
pub use memory::InMemoryStore;
pub use redb_store::RedbStore;
pub use store::{InstanceWithRelations, StateStore};
