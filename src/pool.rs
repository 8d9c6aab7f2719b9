//! Connection pool with lease-counted channel handout
//!
//! Owns the physical broker connections for one cluster descriptor and
//! hands out leased logical channels, multiplexing many leases per
//! connection. Broken connections are pruned and recreated on demand; a
//! connection is only eligible for closure once its lease count reaches
//! zero or it reports closed.

use crate::config::ClusterDescriptor;
use crate::error::{Result, TradewireError};
use crate::transport::{BrokerChannel, BrokerConnection, BrokerConnector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A leased logical channel bound to one pooled connection
pub struct ChannelLease {
    channel: Box<dyn BrokerChannel>,
    connection_id: u64,
}

impl ChannelLease {
    /// The leased channel
    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }
}

struct PooledConnection {
    id: u64,
    connection: Arc<dyn BrokerConnection>,
    leases: usize,
}

/// Pool of physical connections for one cluster
pub struct ConnectionPool {
    connector: Arc<dyn BrokerConnector>,
    descriptor: ClusterDescriptor,
    max_leases_per_connection: usize,
    connections: Mutex<Vec<PooledConnection>>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool for one cluster descriptor
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        descriptor: ClusterDescriptor,
        max_leases_per_connection: usize,
    ) -> Self {
        Self {
            connector,
            descriptor,
            max_leases_per_connection: max_leases_per_connection.max(1),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Lease a channel, reusing the most recently created open connection
    /// with spare capacity or opening a new one
    ///
    /// Connection-open errors are retried transparently against the next
    /// address candidate; only exhausting every candidate surfaces an error.
    pub async fn get_channel(&self) -> Result<ChannelLease> {
        let mut connections = self.connections.lock().await;

        for pooled in connections.iter_mut().rev() {
            if !pooled.connection.is_open() || pooled.leases >= self.max_leases_per_connection {
                continue;
            }
            let connection = pooled.connection.clone();
            match connection.open_channel().await {
                Ok(channel) => {
                    pooled.leases += 1;
                    return Ok(ChannelLease {
                        channel,
                        connection_id: pooled.id,
                    });
                }
                Err(e) => {
                    warn!("channel open on pooled connection {} failed: {}", pooled.id, e);
                }
            }
        }

        let mut last_error = None;
        for address in &self.descriptor.addresses {
            match self.connector.connect(&self.descriptor, address).await {
                Ok(connection) => match connection.open_channel().await {
                    Ok(channel) => {
                        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                        connections.push(PooledConnection {
                            id,
                            connection,
                            leases: 1,
                        });
                        debug!("opened connection {} to {}:{}", id, address.host, address.port);
                        return Ok(ChannelLease {
                            channel,
                            connection_id: id,
                        });
                    }
                    Err(e) => {
                        let _ = connection.close().await;
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    debug!(
                        "connection attempt to {}:{} failed: {}",
                        address.host, address.port, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TradewireError::connection("no broker address reachable")))
    }

    /// Return a lease, closing its channel and pruning connections that
    /// have no leases left or report closed
    pub async fn release(&self, lease: ChannelLease) {
        let _ = lease.channel.close().await;

        let mut connections = self.connections.lock().await;
        if let Some(pooled) = connections
            .iter_mut()
            .find(|pooled| pooled.id == lease.connection_id)
        {
            pooled.leases = pooled.leases.saturating_sub(1);
        }

        let mut pruned = Vec::new();
        let mut index = 0;
        while index < connections.len() {
            let pooled = &connections[index];
            if pooled.leases == 0 || !pooled.connection.is_open() {
                pruned.push(connections.remove(index));
            } else {
                index += 1;
            }
        }
        drop(connections);

        for pooled in pruned {
            debug!("pruning connection {} (leases {})", pooled.id, pooled.leases);
            let _ = pooled.connection.close().await;
        }
    }

    /// Number of live pooled connections
    pub async fn active_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Close every pooled connection regardless of lease counts
    pub async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        let drained: Vec<PooledConnection> = connections.drain(..).collect();
        drop(connections);
        for pooled in drained {
            let _ = pooled.connection.close().await;
        }
    }
}
