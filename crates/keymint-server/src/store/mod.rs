pub mod db;
pub mod model;
pub mod port;

pub use db::RedbStore;
pub use model::{License, Machine, Settings, UsageRecord};
pub use port::{BindOutcome, Persistence, UsageInsert};
