//! External address discovery
//!
//! Strategies run in order and the first success wins:
//! 1. an explicitly configured address
//! 2. a UPnP gateway (when enabled)
//! 3. STUN binding requests
//! 4. plain-text HTTP "what is my IP" services
//!
//! Failure of every strategy is not fatal. [`AddressDiscovery::resolve`]
//! falls back to the last known address, then to the routed local IP.

use crate::config::AddressConfig;
use crate::network::upnp::{get_local_ip, UpnpMapper};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};

// =============================================================================
// STUN constants
// =============================================================================

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const STUN_HEADER_LEN: usize = 20;

/// Address discovery errors
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid STUN response: {0}")]
    Stun(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Service returned '{0}', not an IP address")]
    InvalidAddress(String),
    #[error("Timed out")]
    Timeout,
    #[error("Every address discovery strategy failed")]
    Exhausted,
}

/// Where an address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSource {
    Configured,
    Upnp,
    Stun,
    Http,
    /// Routed local interface, used when nothing else worked
    Local,
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressSource::Configured => "configured",
            AddressSource::Upnp => "upnp",
            AddressSource::Stun => "stun",
            AddressSource::Http => "http",
            AddressSource::Local => "local",
        };
        f.write_str(name)
    }
}

/// This node's address as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExternalAddress {
    pub ip: IpAddr,
    /// Public port when the strategy reports one (STUN)
    pub port: Option<u16>,
    pub source: AddressSource,
}

pub struct AddressDiscovery {
    config: AddressConfig,
    upnp: Option<Arc<UpnpMapper>>,
    http: reqwest::Client,
    ports: (u16, u16),
    last_known: RwLock<Option<ExternalAddress>>,
}

impl AddressDiscovery {
    /// `port`/`http_port` are the bound listener ports, mapped when UPnP is on
    pub fn new(config: AddressConfig, port: u16, http_port: u16) -> Result<Self, AddressError> {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout())
            .build()?;
        let upnp = config.enable_upnp.then(|| Arc::new(UpnpMapper::new()));

        Ok(Self {
            config,
            upnp,
            http,
            ports: (port, http_port),
            last_known: RwLock::new(None),
        })
    }

    pub fn upnp(&self) -> Option<Arc<UpnpMapper>> {
        self.upnp.clone()
    }

    pub fn recheck_interval(&self) -> std::time::Duration {
        self.config.recheck_interval()
    }

    pub async fn last_known(&self) -> Option<ExternalAddress> {
        *self.last_known.read().await
    }

    /// Run the strategies in order; first success wins
    pub async fn discover_external_address(&self) -> Result<ExternalAddress, AddressError> {
        if let Some(ip) = self.config.external_address {
            return Ok(ExternalAddress {
                ip,
                port: None,
                source: AddressSource::Configured,
            });
        }

        if let Some(upnp) = &self.upnp {
            match upnp.map_ports(self.ports.0, self.ports.1).await {
                Ok(ip) => {
                    return Ok(ExternalAddress {
                        ip,
                        port: Some(self.ports.0),
                        source: AddressSource::Upnp,
                    })
                }
                Err(e) => log::debug!("UPnP failed: {}", e),
            }
        }

        for server in &self.config.stun_servers {
            match stun_query(server, self.config.probe_timeout()).await {
                Ok(mapped) => {
                    log::debug!("STUN server {} reports {}", server, mapped);
                    return Ok(ExternalAddress {
                        ip: mapped.ip(),
                        port: Some(mapped.port()),
                        source: AddressSource::Stun,
                    });
                }
                Err(e) => log::debug!("STUN query to {} failed: {}", server, e),
            }
        }

        for service in &self.config.http_services {
            match self.http_query(service).await {
                Ok(ip) => {
                    log::debug!("{} reports {}", service, ip);
                    return Ok(ExternalAddress {
                        ip,
                        port: None,
                        source: AddressSource::Http,
                    });
                }
                Err(e) => log::debug!("Address service {} failed: {}", service, e),
            }
        }

        Err(AddressError::Exhausted)
    }

    /// Best address available: discovered, else last known, else local
    pub async fn resolve(&self) -> ExternalAddress {
        match self.discover_external_address().await {
            Ok(address) => {
                log::info!("External address {} (via {})", address.ip, address.source);
                *self.last_known.write().await = Some(address);
                address
            }
            Err(e) => {
                if let Some(known) = self.last_known().await {
                    log::warn!("{}; keeping {}", e, known.ip);
                    return known;
                }
                let ip = get_local_ip()
                    .map(IpAddr::V4)
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
                log::warn!("{}; advertising local address {}", e, ip);
                ExternalAddress {
                    ip,
                    port: None,
                    source: AddressSource::Local,
                }
            }
        }
    }

    /// Re-run discovery. Returns the new address only when the IP changed.
    pub async fn recheck(&self) -> Option<ExternalAddress> {
        let address = match self.discover_external_address().await {
            Ok(address) => address,
            Err(e) => {
                log::warn!("Address re-check failed: {}", e);
                return None;
            }
        };

        let mut last = self.last_known.write().await;
        let changed = last.map(|known| known.ip != address.ip).unwrap_or(true);
        *last = Some(address);
        if changed {
            log::info!("External address is now {} (via {})", address.ip, address.source);
            Some(address)
        } else {
            None
        }
    }

    async fn http_query(&self, url: &str) -> Result<IpAddr, AddressError> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let trimmed = body.trim();
        trimmed
            .parse()
            .map_err(|_| AddressError::InvalidAddress(trimmed.chars().take(64).collect()))
    }
}

// =============================================================================
// STUN
// =============================================================================

/// Binding request with the given transaction id
pub fn build_stun_request(transaction_id: &[u8; 12]) -> [u8; STUN_HEADER_LEN] {
    let mut msg = [0u8; STUN_HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    msg[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

/// Mapped address from a binding success response. XOR-MAPPED-ADDRESS wins
/// over MAPPED-ADDRESS when both are present.
pub fn parse_stun_response(
    data: &[u8],
    transaction_id: &[u8; 12],
) -> Result<SocketAddr, AddressError> {
    if data.len() < STUN_HEADER_LEN {
        return Err(AddressError::Stun("short message".to_string()));
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(AddressError::Stun(format!("message type {:#06x}", msg_type)));
    }
    if data[4..8] != STUN_MAGIC_COOKIE.to_be_bytes() {
        return Err(AddressError::Stun("bad magic cookie".to_string()));
    }
    if &data[8..20] != transaction_id {
        return Err(AddressError::Stun("transaction id mismatch".to_string()));
    }

    let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (STUN_HEADER_LEN + body_len).min(data.len());

    let mut mapped = None;
    let mut pos = STUN_HEADER_LEN;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let value_start = pos + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            return Err(AddressError::Stun("truncated attribute".to_string()));
        }
        let value = &data[value_start..value_end];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                return decode_address(value, Some(&data[4..20]));
            }
            ATTR_MAPPED_ADDRESS => {
                mapped = Some(decode_address(value, None)?);
            }
            _ => {}
        }

        // Attributes are padded to 4 bytes
        pos = value_start + attr_len.div_ceil(4) * 4;
    }

    mapped.ok_or_else(|| AddressError::Stun("no mapped address".to_string()))
}

/// Decode a (XOR-)MAPPED-ADDRESS value. `xor_key` is cookie + transaction id.
fn decode_address(value: &[u8], xor_key: Option<&[u8]>) -> Result<SocketAddr, AddressError> {
    if value.len() < 4 {
        return Err(AddressError::Stun("short address attribute".to_string()));
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if let Some(key) = xor_key {
        port ^= u16::from_be_bytes([key[0], key[1]]);
    }

    let ip = match (family, value.len()) {
        (0x01, 8) => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if let Some(key) = xor_key {
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (0x02, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(key) = xor_key {
                for (b, k) in octets.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => {
            return Err(AddressError::Stun(format!(
                "address family {} with {} bytes",
                family,
                value.len()
            )))
        }
    };

    Ok(SocketAddr::new(ip, port))
}

/// Send one binding request and wait for the matching answer
pub async fn stun_query(
    server: &str,
    wait: std::time::Duration,
) -> Result<SocketAddr, AddressError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill(&mut transaction_id);

    let deadline = Instant::now() + wait;
    timeout(wait, socket.send_to(&build_stun_request(&transaction_id), server))
        .await
        .map_err(|_| AddressError::Timeout)??;

    let mut buf = [0u8; 512];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (len, _) = timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| AddressError::Timeout)??;

        match parse_stun_response(&buf[..len], &transaction_id) {
            Ok(addr) => return Ok(addr),
            // Stray datagram; keep waiting for ours
            Err(e) => log::debug!("Ignoring STUN datagram from {}: {}", server, e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TXN: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    /// Binding success carrying one attribute
    fn response(txn: &[u8; 12], attr_type: u16, value: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(txn);
        msg.extend_from_slice(&attr_type.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(value);
        msg
    }

    fn xor_mapped_v4(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&(port ^ (STUN_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        for (b, k) in ip.octets().iter().zip(cookie.iter()) {
            value.push(b ^ k);
        }
        value
    }

    #[test]
    fn test_build_request() {
        let msg = build_stun_request(&TXN);
        assert_eq!(&msg[0..2], &[0x00, 0x01]);
        assert_eq!(&msg[2..4], &[0, 0]);
        assert_eq!(&msg[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&msg[8..], &TXN);
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let ip = Ipv4Addr::new(203, 0, 113, 7);
        let data = response(&TXN, ATTR_XOR_MAPPED_ADDRESS, &xor_mapped_v4(ip, 54321));
        let addr = parse_stun_response(&data, &TXN).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(ip), 54321));
    }

    #[test]
    fn test_parse_plain_mapped_address() {
        let value = [0, 0x01, 0x1f, 0x90, 198, 51, 100, 20];
        let data = response(&TXN, ATTR_MAPPED_ADDRESS, &value);
        let addr = parse_stun_response(&data, &TXN).unwrap();
        assert_eq!(addr, "198.51.100.20:8080".parse().unwrap());
    }

    #[test]
    fn test_parse_rejects_foreign_transaction() {
        let data = response(&[9; 12], ATTR_MAPPED_ADDRESS, &[0, 1, 0, 80, 1, 1, 1, 1]);
        assert!(matches!(
            parse_stun_response(&data, &TXN),
            Err(AddressError::Stun(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(parse_stun_response(&[0x01, 0x01, 0, 0], &TXN).is_err());
        let mut data = response(&TXN, ATTR_MAPPED_ADDRESS, &[0, 1, 0, 80, 1, 1, 1, 1]);
        data.truncate(data.len() - 2);
        assert!(parse_stun_response(&data, &TXN).is_err());
    }

    fn config() -> AddressConfig {
        AddressConfig {
            stun_servers: Vec::new(),
            http_services: Vec::new(),
            probe_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_configured_address_wins() {
        let discovery = AddressDiscovery::new(
            AddressConfig {
                external_address: Some("192.0.2.44".parse().unwrap()),
                stun_servers: vec!["127.0.0.1:1".to_string()],
                ..config()
            },
            7400,
            7401,
        )
        .unwrap();

        let address = discovery.discover_external_address().await.unwrap();
        assert_eq!(address.source, AddressSource::Configured);
        assert_eq!(address.ip.to_string(), "192.0.2.44");
    }

    /// UDP server answering each binding request with a fixed mapping
    async fn fake_stun_server(ip: Ipv4Addr, port: u16) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if len < STUN_HEADER_LEN {
                    continue;
                }
                let mut txn = [0u8; 12];
                txn.copy_from_slice(&buf[8..20]);
                let reply = response(&txn, ATTR_XOR_MAPPED_ADDRESS, &xor_mapped_v4(ip, port));
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_stun_strategy() {
        let server = fake_stun_server(Ipv4Addr::new(203, 0, 113, 9), 40000).await;
        let discovery = AddressDiscovery::new(
            AddressConfig {
                stun_servers: vec![server],
                ..config()
            },
            7400,
            7401,
        )
        .unwrap();

        let address = discovery.discover_external_address().await.unwrap();
        assert_eq!(address.source, AddressSource::Stun);
        assert_eq!(address.ip.to_string(), "203.0.113.9");
        assert_eq!(address.port, Some(40000));
    }

    async fn fake_ip_service(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route("/", axum::routing::get(move || async move { body }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_http_fallback_after_silent_stun() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service = fake_ip_service("198.51.100.77\n").await;

        let discovery = AddressDiscovery::new(
            AddressConfig {
                stun_servers: vec![silent.local_addr().unwrap().to_string()],
                http_services: vec![service],
                ..config()
            },
            7400,
            7401,
        )
        .unwrap();

        let address = discovery.discover_external_address().await.unwrap();
        assert_eq!(address.source, AddressSource::Http);
        assert_eq!(address.ip.to_string(), "198.51.100.77");
    }

    #[tokio::test]
    async fn test_garbage_service_response_skipped() {
        let bad = fake_ip_service("<html>nope</html>").await;
        let good = fake_ip_service("2001:db8::5").await;
        let discovery = AddressDiscovery::new(
            AddressConfig {
                http_services: vec![bad, good],
                ..config()
            },
            7400,
            7401,
        )
        .unwrap();

        let address = discovery.discover_external_address().await.unwrap();
        assert_eq!(address.ip.to_string(), "2001:db8::5");
    }

    #[tokio::test]
    async fn test_all_strategies_fail_falls_back() {
        let discovery = AddressDiscovery::new(config(), 7400, 7401).unwrap();
        assert!(matches!(
            discovery.discover_external_address().await,
            Err(AddressError::Exhausted)
        ));

        let address = discovery.resolve().await;
        assert_eq!(address.source, AddressSource::Local);
        assert!(discovery.recheck().await.is_none());
    }

    #[tokio::test]
    async fn test_recheck_reports_changes_only() {
        let server = fake_stun_server(Ipv4Addr::new(203, 0, 113, 9), 40000).await;
        let discovery = AddressDiscovery::new(
            AddressConfig {
                stun_servers: vec![server],
                ..config()
            },
            7400,
            7401,
        )
        .unwrap();

        assert!(discovery.recheck().await.is_some());
        assert!(discovery.recheck().await.is_none());
        assert_eq!(
            discovery.last_known().await.map(|a| a.ip.to_string()),
            Some("203.0.113.9".to_string())
        );
    }
}
