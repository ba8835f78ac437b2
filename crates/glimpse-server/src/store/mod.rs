pub mod audit;
pub mod db;
pub mod model;

pub use audit::{AuditEvent, AuditQuery};
pub use db::Store;
pub use model::{IdentityRecord, StoreStats};
