//! Port selection for per-repository listeners.

use std::net::IpAddr;

use crate::config::PortsConfig;

/// No port could be allocated.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The explicitly requested port is taken.
    #[error("port {port} is already in use")]
    Busy {
        /// Requested port.
        port: u16,
        /// Bind failure.
        #[source]
        source: std::io::Error,
    },

    /// Every port in the search range is taken.
    #[error("no free port between {start} and {end}")]
    Exhausted {
        /// First port searched.
        start: u16,
        /// Last port searched.
        end: u16,
    },
}

/// A port chosen for a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The port.
    pub port: u16,
    /// The port was picked from the range and should be saved on the repository.
    pub persist: bool,
}

/// Finds bindable ports by probing.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    start: u16,
    end: u16,
}

impl PortAllocator {
    /// Search `config`'s range on its host.
    pub fn new(config: &PortsConfig) -> Self {
        Self {
            host: config.host,
            start: config.start,
            end: config.end,
        }
    }

    /// The address listeners bind to.
    pub fn host(&self) -> IpAddr {
        self.host
    }

    async fn try_bind(&self, port: u16) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind((self.host, port)).await?;
        drop(listener);
        Ok(())
    }

    /// Pick a port. `0` scans the range for the first free port; anything else
    /// must currently be free.
    pub async fn allocate(&self, requested: u16) -> Result<Allocation, PortError> {
        if requested != 0 {
            return match self.try_bind(requested).await {
                Ok(()) => Ok(Allocation {
                    port: requested,
                    persist: false,
                }),
                Err(source) => Err(PortError::Busy {
                    port: requested,
                    source,
                }),
            };
        }

        for port in self.start..=self.end {
            match self.try_bind(port).await {
                Ok(()) => {
                    tracing::debug!(port, "allocated port");
                    return Ok(Allocation {
                        port,
                        persist: true,
                    });
                }
                Err(err) => tracing::trace!(port, error = %err, "port unavailable"),
            }
        }

        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        listener.local_addr().unwrap().port()
    }

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(&PortsConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            start,
            end,
        })
    }

    #[tokio::test]
    async fn explicit_ports_are_checked() {
        let port = free_port().await;
        let allocation = allocator(1, 1).allocate(port).await.unwrap();
        assert_eq!(allocation, Allocation { port, persist: false });

        let held = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();
        let err = allocator(1, 1).allocate(port).await.unwrap_err();
        assert!(matches!(err, PortError::Busy { .. }));
        drop(held);
    }

    #[tokio::test]
    async fn scanning_skips_busy_ports() {
        let held = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = held.local_addr().unwrap().port();

        let err = allocator(port, port).allocate(0).await.unwrap_err();
        assert!(matches!(err, PortError::Exhausted { .. }));

        drop(held);
        let allocation = allocator(port, port).allocate(0).await.unwrap();
        assert_eq!(allocation, Allocation { port, persist: true });
    }
}
