//! The storage collaborator contract.
//!
//! Registry components never talk to a concrete backend; they hold a [`Driver`]
//! which exposes key/value blob operations scoped by bucket.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
