//! UDP discovery decoder.
//! Passive listeners on the three announcement ports plus an active broadcast
//! solicitation, decrypted with the shared broadcast key.

use crate::crypto::{self, TuyaCipher};
use crate::error::{Result, TuyaError};
use crate::protocol::{self, CommandType, PREFIX_6699, TuyaMessage, Version};
use async_stream::stream;
use futures_core::stream::Stream;
use log::{debug, info, warn};
use serde_json::{Value, json};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Announcement ports watched by default.
pub const DISCOVERY_PORTS: &[u16] = &[6666, 6667, 7000];

/// v3.5 devices announce themselves when poked on this port.
const SOLICIT_PORT: u16 = 7000;

const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// A device heard on the LAN.
#[derive(Debug, Clone)]
pub struct DeviceAnnouncement {
    /// Gateway id (`gwId`)
    pub id: String,
    /// LAN address, from the announcement body or the datagram source
    pub ip: String,
    /// Protocol version, when the announcement names one
    pub version: Option<Version>,
    pub product_key: Option<String>,
    pub mac: Option<String>,
    pub name: Option<String>,
}

/// Passive UDP scanner for device announcements.
///
/// `scan` accumulates announcements for the configured window, suppressing
/// duplicates from the same source address; `scan_stream` yields them as
/// they arrive.
#[derive(Clone)]
pub struct Scanner {
    /// Scan window
    pub timeout: Duration,
    /// Local address to bind
    pub bind_addr: String,
    /// UDP ports to watch
    pub ports: Vec<u16>,
    /// Whether to send the active solicitation broadcast
    pub solicit: bool,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_SCAN_WINDOW,
            bind_addr: "0.0.0.0".to_string(),
            ports: DISCOVERY_PORTS.to_vec(),
            solicit: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_solicit(mut self, solicit: bool) -> Self {
        self.solicit = solicit;
        self
    }

    /// Listens for the scan window and returns every distinct device heard.
    pub async fn scan(&self) -> Result<Vec<DeviceAnnouncement>> {
        let (tx, mut rx) = mpsc::channel(64);
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run(tx).await });

        let mut found = Vec::new();
        while let Some(announcement) = rx.recv().await {
            found.push(announcement);
        }
        handle.await.map_err(|e| TuyaError::Io(e.to_string()))??;
        info!("scan finished, {} device(s) found", found.len());
        Ok(found)
    }

    /// Streams announcements as they arrive; ends when the window closes.
    pub fn scan_stream(&self) -> impl Stream<Item = DeviceAnnouncement> + Send + 'static {
        let worker = self.clone();
        stream! {
            let (tx, mut rx) = mpsc::channel(64);
            let handle = tokio::spawn(async move { worker.run(tx).await });
            while let Some(announcement) = rx.recv().await {
                yield announcement;
            }
            if let Ok(Err(e)) = handle.await {
                warn!("scan failed: {}", e);
            }
        }
    }

    async fn run(&self, tx: mpsc::Sender<DeviceAnnouncement>) -> Result<()> {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push(Arc::new(s)),
                Err(e) => warn!("failed to listen on udp port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(TuyaError::Io("no discovery port could be bound".into()));
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(100);
        let cancel = CancellationToken::new();
        for socket in &sockets {
            let raw_tx = raw_tx.clone();
            let socket = socket.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = socket.recv_from(&mut buf) => match res {
                            Ok((len, addr)) => {
                                if raw_tx.send((buf[..len].to_vec(), addr)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        },
                    }
                }
            });
        }
        drop(raw_tx);

        if self.solicit {
            if let Err(e) = send_solicitation(&sockets[0]).await {
                warn!("discovery solicitation failed: {}", e);
            }
        }

        let deadline = Instant::now() + self.timeout;
        let mut seen: HashSet<IpAddr> = HashSet::new();
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                recv = raw_rx.recv() => {
                    let Some((data, addr)) = recv else { break };
                    debug!("udp datagram from {}: {} bytes", addr, data.len());
                    if seen.contains(&addr.ip()) {
                        debug!("suppressing duplicate announcement from {}", addr.ip());
                        continue;
                    }
                    if let Some(announcement) = parse_datagram(&data, addr.ip()) {
                        info!(
                            "discovered device {} at {} (version {:?})",
                            announcement.id, announcement.ip, announcement.version
                        );
                        seen.insert(addr.ip());
                        if tx.send(announcement).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        cancel.cancel();
        Ok(())
    }

    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| TuyaError::Configuration(format!("bad bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

/// The active solicitation: a 6699 frame carrying `{"from":"app","t":<secs>}`
/// under the broadcast key, sent to 255.255.255.255:7000.
fn build_solicitation() -> Result<Vec<u8>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let msg = TuyaMessage {
        seqno: 0,
        cmd: CommandType::ReqDevInfo as u32,
        payload: serde_json::to_vec(&json!({"from": "app", "t": now}))?,
        prefix: PREFIX_6699,
        ..Default::default()
    };
    protocol::pack_message(&msg, Some(&crypto::udp_key()[..]))
}

async fn send_solicitation(socket: &UdpSocket) -> Result<()> {
    let packet = build_solicitation()?;
    let target: SocketAddr = format!("255.255.255.255:{}", SOLICIT_PORT)
        .parse()
        .expect("broadcast address parses");
    let sent = socket.send_to(&packet, target).await?;
    debug!("sent discovery solicitation ({} bytes)", sent);
    Ok(())
}

fn parse_datagram(data: &[u8], src: IpAddr) -> Option<DeviceAnnouncement> {
    let value = decode_datagram(data)?;
    parse_announcement(&value, src)
}

/// Decodes one datagram into the announcement JSON.
///
/// Framed datagrams are unpacked (GCM under the broadcast key for 6699,
/// CRC or HMAC trailer for 55AA) and their payload taken verbatim when it is
/// already JSON, ECB-decrypted otherwise. Unframed datagrams are either bare
/// JSON (3.1 firmware) or a raw ECB blob.
fn decode_datagram(data: &[u8]) -> Option<Value> {
    let cipher = TuyaCipher::new(crypto::udp_key());

    if data.first() == Some(&b'{') {
        if let Ok(value) = serde_json::from_slice(trim_nuls(data)) {
            return Some(value);
        }
    }

    if let Ok(header) = protocol::parse_header(data) {
        if header.prefix == PREFIX_6699 {
            if let Ok(msg) =
                protocol::unpack_message(data, Some(&crypto::udp_key()[..]), Some(header), None)
            {
                return json_from_payload(&msg.payload, &cipher);
            }
        } else {
            // The trailer may be either kind; prefer whichever verifies.
            let msg = protocol::unpack_message(data, Some(&crypto::udp_key()[..]), Some(header.clone()), None)
                .ok()
                .filter(|m| m.crc_good)
                .or_else(|| {
                    protocol::unpack_message(data, None, Some(header), None)
                        .ok()
                        .filter(|m| m.crc_good)
                });
            if let Some(msg) = msg {
                return json_from_payload(&msg.payload, &cipher);
            }
        }
        debug!("framed datagram failed trailer checks");
    }

    cipher
        .decrypt_ecb(data, false)
        .ok()
        .and_then(|plain| serde_json::from_slice(trim_nuls(&plain)).ok())
}

fn json_from_payload(payload: &[u8], cipher: &TuyaCipher) -> Option<Value> {
    let payload = trim_nuls(payload);
    if payload.first() == Some(&b'{') {
        if let Ok(value) = serde_json::from_slice(payload) {
            return Some(value);
        }
    }
    let plain = cipher.decrypt_ecb(payload, false).ok()?;
    serde_json::from_slice(trim_nuls(&plain)).ok()
}

fn trim_nuls(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

fn parse_announcement(value: &Value, src: IpAddr) -> Option<DeviceAnnouncement> {
    let id = value
        .get("gwId")
        .or_else(|| value.get("devId"))
        .or_else(|| value.get("id"))
        .and_then(|v| v.as_str())?;

    let field = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    Some(DeviceAnnouncement {
        id: id.to_string(),
        ip: field("ip").unwrap_or_else(|| src.to_string()),
        version: value
            .get("version")
            .and_then(|v| v.as_str())
            .and_then(|s| Version::from_str(s).ok()),
        product_key: field("productKey"),
        mac: field("mac"),
        name: field("name"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PREFIX_55AA;

    fn src() -> IpAddr {
        "192.168.1.50".parse().unwrap()
    }

    fn announcement_json() -> Value {
        json!({
            "ip": "192.168.1.50",
            "gwId": "bf1234567890abcd",
            "active": 2,
            "ability": 0,
            "mode": 0,
            "encrypt": true,
            "productKey": "keydeadbeef",
            "version": "3.3"
        })
    }

    #[test]
    fn decodes_ecb_framed_announcement() {
        // Port 6667 style: 55AA frame, CRC trailer, ECB payload under the broadcast key.
        let cipher = TuyaCipher::new(crypto::udp_key());
        let body = serde_json::to_vec(&announcement_json()).unwrap();
        let msg = TuyaMessage {
            seqno: 0,
            cmd: CommandType::UdpNew as u32,
            retcode: Some(0),
            payload: cipher.encrypt_ecb(&body, true).unwrap(),
            prefix: PREFIX_55AA,
            ..Default::default()
        };
        let datagram = protocol::pack_message(&msg, None).unwrap();

        let parsed = parse_datagram(&datagram, src()).unwrap();
        assert_eq!(parsed.id, "bf1234567890abcd");
        assert_eq!(parsed.ip, "192.168.1.50");
        assert_eq!(parsed.version, Some(Version::V3_3));
        assert_eq!(parsed.product_key.as_deref(), Some("keydeadbeef"));
    }

    #[test]
    fn decodes_6699_gcm_announcement() {
        // v3.5 announcement on port 6666/7000: GCM under the broadcast key.
        let mut body = serde_json::to_vec(&json!({
            "gwId": "bf35dev",
            "version": "3.5",
            "productKey": "pk35"
        }))
        .unwrap();
        body.extend_from_slice(&[0, 0, 0]); // trailing NULs appear in the wild
        let msg = TuyaMessage {
            seqno: 1,
            cmd: CommandType::BroadcastLpv34 as u32,
            payload: body,
            prefix: PREFIX_6699,
            ..Default::default()
        };
        let datagram = protocol::pack_message(&msg, Some(&crypto::udp_key()[..])).unwrap();

        let parsed = parse_datagram(&datagram, src()).unwrap();
        assert_eq!(parsed.id, "bf35dev");
        assert_eq!(parsed.version, Some(Version::V3_5));
        // No ip in the body, so the datagram source is used.
        assert_eq!(parsed.ip, "192.168.1.50");
    }

    #[test]
    fn decodes_bare_json_and_bare_ecb_datagrams() {
        let body = serde_json::to_vec(&announcement_json()).unwrap();
        assert!(parse_datagram(&body, src()).is_some());

        let cipher = TuyaCipher::new(crypto::udp_key());
        let blob = cipher.encrypt_ecb(&body, true).unwrap();
        assert!(parse_datagram(&blob, src()).is_some());
    }

    #[test]
    fn garbage_datagram_is_ignored() {
        assert!(parse_datagram(&[0xAB; 40], src()).is_none());
        assert!(parse_datagram(b"", src()).is_none());
    }

    #[test]
    fn trailing_nuls_are_stripped() {
        assert_eq!(trim_nuls(b"{}\0\0\0"), b"{}");
        assert_eq!(trim_nuls(b"\0\0"), b"");
    }

    #[test]
    fn solicitation_is_a_6699_frame_with_from_app() {
        let packet = build_solicitation().unwrap();
        let msg = protocol::unpack_message(&packet, Some(&crypto::udp_key()[..]), None, Some(true))
            .unwrap();
        assert_eq!(msg.cmd, CommandType::ReqDevInfo as u32);
        let v: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(v["from"], "app");
        assert!(v["t"].is_u64());
    }

    #[tokio::test]
    async fn scan_stream_yields_announcements_until_window_closes() {
        use futures_util::StreamExt;

        let port = 36668;
        let scanner = Scanner::new()
            .with_ports(vec![port])
            .with_timeout(Duration::from_millis(400))
            .with_solicit(false);

        tokio::spawn(async move {
            let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let body = serde_json::to_vec(&json!({
                "ip": "127.0.0.1",
                "gwId": "stream-test-device",
                "version": "3.1"
            }))
            .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.send_to(&body, ("127.0.0.1", port)).await.unwrap();
        });

        let stream = scanner.scan_stream();
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        assert_eq!(first.id, "stream-test-device");
        assert_eq!(first.version, Some(Version::V3_1));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn scan_dedupes_by_source_address() {
        let port = 36667;
        let scanner = Scanner::new()
            .with_ports(vec![port])
            .with_timeout(Duration::from_millis(500))
            .with_solicit(false);

        let sender = tokio::spawn(async move {
            let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let cipher = TuyaCipher::new(crypto::udp_key());
            let body = serde_json::to_vec(&json!({
                "ip": "127.0.0.1",
                "gwId": "dup-test-device",
                "version": "3.3"
            }))
            .unwrap();
            let msg = TuyaMessage {
                seqno: 0,
                cmd: CommandType::UdpNew as u32,
                retcode: Some(0),
                payload: cipher.encrypt_ecb(&body, true).unwrap(),
                prefix: PREFIX_55AA,
                ..Default::default()
            };
            let datagram = protocol::pack_message(&msg, None).unwrap();
            for _ in 0..3 {
                socket
                    .send_to(&datagram, ("127.0.0.1", port))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let found = scanner.scan().await.unwrap();
        sender.await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "dup-test-device");
    }
}
