//! UPnP NAT traversal
//!
//! Maps the node's RPC and HTTP ports on the local gateway and reports the
//! gateway's external IP. igd-next is blocking, so every gateway operation
//! runs on the blocking pool.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Port mapping lease (1 hour)
const PORT_MAPPING_LEASE: u32 = 3600;

/// Renew well before the lease runs out
const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 60);

const MAPPING_DESCRIPTION: &str = "ledger-gossip";

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIpError(String),
    #[error("Failed to add port mapping: {0}")]
    PortMappingError(String),
    #[error("Invalid local address")]
    InvalidLocalAddress,
    #[error("UPnP task failed: {0}")]
    TaskFailed(String),
}

// =============================================================================
// UPnP Mapper
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Mapping {
    local_ip: Ipv4Addr,
    ports: [u16; 2],
}

/// Port mappings held on the gateway
#[derive(Debug, Default)]
pub struct UpnpMapper {
    mapping: RwLock<Option<Mapping>>,
}

impl UpnpMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `port` and `http_port` to this host; returns the gateway's
    /// external IP
    pub async fn map_ports(&self, port: u16, http_port: u16) -> Result<IpAddr, UpnpError> {
        log::info!("Searching for UPnP gateway...");
        let local_ip = get_local_ip().ok_or(UpnpError::InvalidLocalAddress)?;
        let ports = [port, http_port];

        let external = tokio::task::spawn_blocking(move || {
            let gateway = igd_next::search_gateway(Default::default())
                .map_err(|e| UpnpError::GatewayNotFound(e.to_string()))?;
            log::info!("Found UPnP gateway: {}", gateway.addr);

            let external = gateway
                .get_external_ip()
                .map_err(|e| UpnpError::ExternalIpError(e.to_string()))?;

            for port in ports {
                let local_addr = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
                gateway
                    .add_port(
                        igd_next::PortMappingProtocol::TCP,
                        port,
                        local_addr,
                        PORT_MAPPING_LEASE,
                        MAPPING_DESCRIPTION,
                    )
                    .map_err(|e| UpnpError::PortMappingError(e.to_string()))?;
                log::info!("Added UPnP port mapping: {}:{} -> {}", external, port, local_addr);
            }

            Ok::<IpAddr, UpnpError>(external)
        })
        .await
        .map_err(|e| UpnpError::TaskFailed(e.to_string()))??;

        *self.mapping.write().await = Some(Mapping { local_ip, ports });
        Ok(external)
    }

    pub async fn is_mapped(&self) -> bool {
        self.mapping.read().await.is_some()
    }

    /// Renew the mapping until shutdown, then remove it
    pub async fn run_renewal(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                    let Some(mapping) = *self.mapping.read().await else {
                        continue;
                    };
                    let renewed = tokio::task::spawn_blocking(move || {
                        let gateway = igd_next::search_gateway(Default::default()).ok()?;
                        for port in mapping.ports {
                            let local_addr =
                                SocketAddr::V4(SocketAddrV4::new(mapping.local_ip, port));
                            if let Err(e) = gateway.add_port(
                                igd_next::PortMappingProtocol::TCP,
                                port,
                                local_addr,
                                PORT_MAPPING_LEASE,
                                MAPPING_DESCRIPTION,
                            ) {
                                log::warn!("Failed to renew UPnP port mapping for {}: {}", port, e);
                                return None;
                            }
                        }
                        Some(())
                    })
                    .await;
                    if matches!(renewed, Ok(Some(()))) {
                        log::debug!("Renewed UPnP port mappings");
                    }
                }
            }
        }

        self.cleanup().await;
    }

    /// Remove the port mappings
    pub async fn cleanup(&self) {
        let Some(mapping) = self.mapping.write().await.take() else {
            return;
        };

        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(gateway) = igd_next::search_gateway(Default::default()) {
                for port in mapping.ports {
                    let _ = gateway.remove_port(igd_next::PortMappingProtocol::TCP, port);
                    log::info!("Removed UPnP port mapping for port {}", port);
                }
            }
        })
        .await;
    }
}

/// Local IP the default route would use. Nothing is sent.
pub fn get_local_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
