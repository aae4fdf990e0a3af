pub mod chats;
pub mod context;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod updates;
pub mod users;

pub use database::Database;
pub use error::StoreError;
