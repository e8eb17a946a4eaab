pub mod memstore;
pub mod pgstore;
pub mod store;

pub use memstore::MemStore;
pub use pgstore::PgStore;
pub use store::{with_backoff, RoomStore, StoreError};
