pub mod document;
pub mod error;
pub mod query;
pub mod schema;
pub mod store;
mod txn;

pub use document::IdStrategy;
pub use error::{JotDbError, Result};
pub use query::{Filter, Order, Query};
pub use store::{Collection, Cursor, Store, Update};
