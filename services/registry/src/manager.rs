//! Per-repository listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::api::Registry;
use crate::port::{PortAllocator, PortError};
use crate::repository::CatalogError;

/// Errors starting or stopping listeners.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// No repository has this id.
    #[error("unknown repository {0}")]
    UnknownRepository(String),

    /// A listener is already serving this repository.
    #[error("repository {0} is already being served")]
    AlreadyRunning(String),

    /// No listener is serving this repository.
    #[error("repository {0} is not being served")]
    NotRunning(String),

    /// No port was available.
    #[error(transparent)]
    Port(#[from] PortError),

    /// The allocated port could not be recorded on the repository.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Binding the listener failed.
    #[error("binding listener: {0}")]
    Io(#[from] std::io::Error),
}

/// A running listener.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ListenerHandle {
    /// Repository served.
    pub repo_id: String,
    /// Bound port.
    pub port: u16,
    /// Bound address.
    pub addr: SocketAddr,
    /// The port was chosen from the search range and saved on the repository.
    pub persist_port: bool,
}

#[derive(Debug)]
struct Running {
    handle: ListenerHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Owns the listener of every served repository.
#[derive(Debug)]
pub struct RegistryManager {
    registry: Registry,
    ports: PortAllocator,
    listeners: Mutex<HashMap<String, Running>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryManager {
    /// A manager for `registry`'s repositories, using its port settings.
    pub fn new(registry: Registry) -> Self {
        let ports = PortAllocator::new(&registry.config().ports);
        Self {
            registry,
            ports,
            listeners: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// The registry being served.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serve a repository on its configured port, or on the first free port of
    /// the search range when it has none.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn start(&self, repo_id: &str) -> Result<ListenerHandle, ManagerError> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(repo_id) {
            return Err(ManagerError::AlreadyRunning(repo_id.to_owned()));
        }

        let repo = self
            .registry
            .catalog()
            .get(repo_id)
            .ok_or_else(|| ManagerError::UnknownRepository(repo_id.to_owned()))?;
        let allocation = self.ports.allocate(repo.port).await?;
        let listener = tokio::net::TcpListener::bind((self.ports.host(), allocation.port)).await?;
        let addr = listener.local_addr()?;

        if allocation.persist {
            let mut updated = (*repo).clone();
            updated.port = addr.port();
            self.registry.catalog().upsert(updated)?;
        }

        let (shutdown, signal) = oneshot::channel();
        let router = self.registry.router(repo_id);
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });

        let handle = ListenerHandle {
            repo_id: repo_id.to_owned(),
            port: addr.port(),
            addr,
            persist_port: allocation.persist,
        };
        tracing::info!(repo = %repo_id, %addr, "registry listening");
        listeners.insert(
            repo_id.to_owned(),
            Running {
                handle: handle.clone(),
                shutdown,
                task,
            },
        );
        Ok(handle)
    }

    /// Stop serving a repository, waiting for in-flight requests to finish.
    pub async fn stop(&self, repo_id: &str) -> Result<ListenerHandle, ManagerError> {
        let running = self
            .listeners
            .lock()
            .await
            .remove(repo_id)
            .ok_or_else(|| ManagerError::NotRunning(repo_id.to_owned()))?;
        Ok(Self::shutdown(running).await)
    }

    async fn shutdown(running: Running) -> ListenerHandle {
        let Running {
            handle,
            shutdown,
            task,
        } = running;
        let _ = shutdown.send(());
        match task.await {
            Ok(Ok(())) => tracing::info!(repo = %handle.repo_id, "registry stopped"),
            Ok(Err(error)) => tracing::warn!(repo = %handle.repo_id, %error, "listener failed"),
            Err(error) => tracing::warn!(repo = %handle.repo_id, %error, "listener task panicked"),
        }
        handle
    }

    /// Stop every listener and the staging sweeper.
    pub async fn stop_all(&self) -> Vec<ListenerHandle> {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }

        let running: Vec<Running> = self.listeners.lock().await.drain().map(|(_, r)| r).collect();
        let mut stopped = Vec::with_capacity(running.len());
        for running in running {
            stopped.push(Self::shutdown(running).await);
        }
        stopped.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
        stopped
    }

    /// Running listeners, by repository id.
    pub async fn handles(&self) -> Vec<ListenerHandle> {
        let mut handles: Vec<_> = self
            .listeners
            .lock()
            .await
            .values()
            .map(|running| running.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
        handles
    }

    /// Sweep expired upload sessions every `interval` until [`stop_all`](Self::stop_all).
    pub async fn spawn_sweeper(&self, interval: Duration) {
        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                match registry.sweep(chrono::Utc::now()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "swept expired uploads"),
                    Err(error) => tracing::warn!(%error, "upload sweep failed"),
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().await.replace(task) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::api::RegistryBuilder;
    use crate::config::{PortsConfig, RegistryConfig};
    use crate::repository::Repository;

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        listener.local_addr().unwrap().port()
    }

    fn registry(start: u16, end: u16, repos: Vec<Repository>) -> Registry {
        let config = RegistryConfig {
            ports: PortsConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                start,
                end,
            },
            ..Default::default()
        };
        let mut builder = RegistryBuilder::new()
            .config(config)
            .storage(storage::MemoryStorage::new().into());
        for repo in repos {
            builder = builder.repository(repo);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn start_serves_and_persists_port() {
        let port = free_port().await;
        let manager = RegistryManager::new(registry(
            port,
            port,
            vec![Repository::hosted("local", "local")],
        ));

        let handle = manager.start("local").await.unwrap();
        assert_eq!(handle.port, port);
        assert!(handle.persist_port);
        assert_eq!(manager.registry().catalog().get("local").unwrap().port, port);

        let mut stream = tokio::net::TcpStream::connect(handle.addr).await.unwrap();
        stream
            .write_all(b"GET /v2/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(
            response
                .to_ascii_lowercase()
                .contains("docker-distribution-api-version: registry/2.0")
        );

        assert!(matches!(
            manager.start("local").await,
            Err(ManagerError::AlreadyRunning(_))
        ));
        assert_eq!(manager.handles().await, vec![handle.clone()]);

        let stopped = manager.stop("local").await.unwrap();
        assert_eq!(stopped, handle);
        assert!(manager.handles().await.is_empty());
        assert!(matches!(
            manager.stop("local").await,
            Err(ManagerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn explicit_ports_are_not_persisted() {
        let port = free_port().await;
        let mut repo = Repository::hosted("local", "local");
        repo.port = port;
        let manager = RegistryManager::new(registry(1, 1, vec![repo]));

        let handle = manager.start("local").await.unwrap();
        assert_eq!(handle.port, port);
        assert!(!handle.persist_port);

        assert!(matches!(
            manager.start("missing").await,
            Err(ManagerError::UnknownRepository(_))
        ));
        assert_eq!(manager.stop_all().await.len(), 1);
    }
}
