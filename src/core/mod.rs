pub mod error;
pub mod record;

pub use error::{Result, SyncError};
pub use record::{CREATION_FIELD, IDENTITY_FIELD, MODIFIED_FIELD, Namespace, Record};
