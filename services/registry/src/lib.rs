//! # Container registry
//!
//! Serves the container registry protocol (`/v2/`, plus the legacy `/v1/`
//! tag endpoints) for three kinds of repository:
//!
//! - **hosted** repositories store pushed content,
//! - **proxy** repositories fetch from an upstream registry and cache what
//!   they fetched,
//! - **group** repositories read through their members in order and route
//!   writes to them according to a write policy.
//!
//! Every repository is served by its own listener, managed by a
//! [`RegistryManager`]. Content lives in the `storage` crate, upstream access
//! goes through the `upstream` crate and concurrent cache fills are
//! serialised with `keylock`.
//!
//! ## Example
//!
//! ```no_run
//! use registry::{Repository, RegistryBuilder, RegistryManager};
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new()
//!     .storage(MemoryStorage::new().into())
//!     .repository(Repository::hosted("local", "local"))
//!     .build()?;
//!
//! let manager = RegistryManager::new(registry);
//! let handle = manager.start("local").await?;
//! println!("serving on {}", handle.addr);
//! # Ok(())
//! # }
//! ```

mod api;
pub mod auth;
mod blob;
pub mod config;
pub mod digest;
mod error;
pub mod group;
mod manager;
mod manifest;
pub mod plugin;
pub mod port;
pub mod proxy;
pub mod repository;
pub mod storage;
mod token;
pub mod upload;
pub mod validate;

pub use api::{Registry, RegistryBuilder};
pub use config::{ConfigError, RegistryConfig};
pub use digest::Digest;
pub use error::{RegistryError, RegistryResult};
pub use manager::{ListenerHandle, ManagerError, RegistryManager};
pub use repository::{Repository, RepositoryCatalog, RepositoryKind, WritePolicy};
