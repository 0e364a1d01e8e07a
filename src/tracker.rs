//! Tracker announce transports
//!
//! [`TrackerTransport`] is the contract the announcer drives; the default
//! implementation speaks HTTP (BEP 3, compact peers per BEP 23) and UDP
//! (BEP 15), dispatching on the URL scheme.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::bencode::BencodeValue;
use crate::error::{EngineError, ProtocolErrorKind, Result, TransportErrorKind};
use crate::types::{InfoHash, PeerId};

/// Magic constant opening every UDP tracker exchange.
const UDP_PROTOCOL_ID: i64 = 0x41727101980;

/// Announce event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Regular reannounce
    None,
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn http_value(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    fn udp_value(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Parameters of one announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
}

/// What a tracker answered.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Requested reannounce interval, unclamped
    pub interval: Duration,
    /// Seeder count, when reported
    pub complete: Option<u32>,
    /// Leecher count, when reported
    pub incomplete: Option<u32>,
    /// Discovered peers
    pub peers: Vec<SocketAddr>,
}

/// Announce transport: one call per tracker round trip.
#[async_trait]
pub trait TrackerTransport: Send + Sync {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse>;
}

/// HTTP + UDP tracker client.
pub struct TrackerClient {
    http: reqwest::Client,
    timeout: Duration,
}

fn tracker_err(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::TrackerError, message)
}

impl TrackerClient {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| {
                EngineError::transport(TransportErrorKind::Other, format!("tracker client: {}", e))
            })?;
        Ok(Self { http, timeout })
    }

    async fn announce_http(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut url = tracker_url.to_string();
        url.push(if url.contains('?') { '&' } else { '?' });

        url.push_str("info_hash=");
        for byte in &request.info_hash {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str("&peer_id=");
        for byte in &request.peer_id {
            url.push_str(&format!("%{:02X}", byte));
        }
        url.push_str(&format!(
            "&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            request.port, request.uploaded, request.downloaded, request.left, request.numwant
        ));
        let event = request.event.http_value();
        if !event.is_empty() {
            url.push_str(&format!("&event={}", event));
        }

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(tracker_err(format!(
                "tracker returned {}",
                response.status()
            )));
        }
        let body = response.bytes().await?;
        parse_http_response(&body)
    }

    async fn announce_udp(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let rest = tracker_url
            .strip_prefix("udp://")
            .ok_or_else(|| tracker_err("invalid udp tracker URL"))?;
        let host_port = rest.split('/').next().unwrap_or(rest);

        let addr = tokio::net::lookup_host(host_port)
            .await
            .map_err(|e| {
                EngineError::transport(TransportErrorKind::DnsResolution, e.to_string())
            })?
            .next()
            .ok_or_else(|| {
                EngineError::transport(TransportErrorKind::DnsResolution, "no tracker address")
            })?;

        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        let connection_id = self.udp_connect(&socket).await?;
        self.udp_announce(&socket, connection_id, request).await
    }

    async fn udp_connect(&self, socket: &UdpSocket) -> Result<i64> {
        let transaction_id: i32 = rand::rng().random();

        let mut packet = Vec::with_capacity(16);
        packet.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // action: connect
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        socket.send(&packet).await?;

        let mut response = [0u8; 16];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                EngineError::transport(TransportErrorKind::Timeout, "udp connect timeout")
            })??;
        if len < 16 {
            return Err(tracker_err("udp connect response too short"));
        }

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let reply_transaction = i32::from_be_bytes(response[4..8].try_into().unwrap());
        if action != 0 {
            return Err(tracker_err(format!("udp connect action {}", action)));
        }
        if reply_transaction != transaction_id {
            return Err(tracker_err("udp transaction id mismatch"));
        }
        Ok(i64::from_be_bytes(response[8..16].try_into().unwrap()))
    }

    async fn udp_announce(
        &self,
        socket: &UdpSocket,
        connection_id: i64,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let transaction_id: i32 = rand::rng().random();

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&1u32.to_be_bytes()); // action: announce
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(&request.info_hash);
        packet.extend_from_slice(&request.peer_id);
        packet.extend_from_slice(&request.downloaded.to_be_bytes());
        packet.extend_from_slice(&request.left.to_be_bytes());
        packet.extend_from_slice(&request.uploaded.to_be_bytes());
        packet.extend_from_slice(&request.event.udp_value().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // ip: default
        let key: u32 = rand::rng().random();
        packet.extend_from_slice(&key.to_be_bytes());
        packet.extend_from_slice(&(request.numwant as i32).to_be_bytes());
        packet.extend_from_slice(&request.port.to_be_bytes());
        socket.send(&packet).await?;

        let mut response = [0u8; 1500];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| {
                EngineError::transport(TransportErrorKind::Timeout, "udp announce timeout")
            })??;
        if len < 20 {
            return Err(tracker_err("udp announce response too short"));
        }

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let reply_transaction = i32::from_be_bytes(response[4..8].try_into().unwrap());
        if reply_transaction != transaction_id {
            return Err(tracker_err("udp transaction id mismatch"));
        }
        if action == 3 {
            let message = String::from_utf8_lossy(&response[8..len]).into_owned();
            return Err(tracker_err(format!("tracker error: {}", message)));
        }
        if action != 1 {
            return Err(tracker_err(format!("udp announce action {}", action)));
        }

        let interval = u32::from_be_bytes(response[8..12].try_into().unwrap());
        let incomplete = u32::from_be_bytes(response[12..16].try_into().unwrap());
        let complete = u32::from_be_bytes(response[16..20].try_into().unwrap());
        let peers = parse_compact_v4(&response[20..len])?;

        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval as u64),
            complete: Some(complete),
            incomplete: Some(incomplete),
            peers,
        })
    }
}

#[async_trait]
impl TrackerTransport for TrackerClient {
    async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.announce_http(url, request).await
        } else if url.starts_with("udp://") {
            self.announce_udp(url, request).await
        } else {
            Err(tracker_err(format!("unsupported tracker scheme: {}", url)))
        }
    }
}

fn parse_http_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = crate::bencode::decode(body)
        .map_err(|_| tracker_err("tracker response is not valid bencode"))?;
    if value.as_dict().is_none() {
        return Err(tracker_err("tracker response is not a dictionary"));
    }

    if let Some(reason) = value.get("failure reason").and_then(|v| v.as_str()) {
        return Err(tracker_err(format!("tracker error: {}", reason)));
    }

    let interval = value
        .get("interval")
        .and_then(|v| v.as_uint())
        .ok_or_else(|| tracker_err("tracker response missing 'interval'"))?;

    let complete = value
        .get("complete")
        .and_then(|v| v.as_uint())
        .map(|v| v as u32);
    let incomplete = value
        .get("incomplete")
        .and_then(|v| v.as_uint())
        .map(|v| v as u32);

    let mut peers = match value.get("peers") {
        Some(BencodeValue::Bytes(data)) => parse_compact_v4(data)?,
        Some(BencodeValue::List(list)) => parse_peer_dicts(list)?,
        Some(_) => return Err(tracker_err("invalid 'peers' format")),
        None => Vec::new(),
    };
    if let Some(data) = value.get("peers6").and_then(|v| v.as_bytes()) {
        peers.extend(parse_compact_v6(data)?);
    }

    Ok(AnnounceResponse {
        interval: Duration::from_secs(interval),
        complete,
        incomplete,
        peers,
    })
}

/// Compact IPv4 peers: 6 bytes each (BEP 23).
fn parse_compact_v4(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(tracker_err("compact peer list not a multiple of 6"));
    }
    Ok(data
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .filter(|addr| addr.port() != 0)
        .collect())
}

/// Compact IPv6 peers: 18 bytes each (BEP 7).
fn parse_compact_v6(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 18 != 0 {
        return Err(tracker_err("compact peers6 list not a multiple of 18"));
    }
    Ok(data
        .chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .filter(|addr| addr.port() != 0)
        .collect())
}

/// Non-compact dictionary peer entries.
fn parse_peer_dicts(list: &[BencodeValue]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::new();
    for entry in list {
        let ip = entry
            .get("ip")
            .and_then(|v| v.as_str())
            .ok_or_else(|| tracker_err("peer entry missing 'ip'"))?;
        let port = entry
            .get("port")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| tracker_err("peer entry missing 'port'"))? as u16;
        if let Ok(ip) = ip.parse() {
            peers.push(SocketAddr::new(ip, port));
        }
    }
    Ok(peers)
}

/// Generate an Azureus-style peer id.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-RT0100-");
    rand::rng().fill(&mut id[8..]);
    id
}
