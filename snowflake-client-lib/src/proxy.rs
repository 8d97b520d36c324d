//! SOCKS5 UDP ASSOCIATE support for WebRTC's traffic.
//!
//! The WebRTC stack has no proxy dialer of its own; what it does have is
//! a UDP mux seam that accepts any datagram socket. This module performs
//! the RFC 1928 handshake (verifying the proxy actually grants UDP), then
//! exposes the relay as such a socket: every outgoing datagram is wrapped
//! in the SOCKS UDP header, every incoming one unwrapped. The TCP control
//! connection is held open for the lifetime of the association; the relay
//! dies with it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, info};
use url::Url;
use webrtc::util::{Conn, Error as UtilError};

use crate::error::{ClientError, Result};

const SOCKS_VERSION: u8 = 0x05;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Longest datagram we expect from the relay: MTU-sized payload plus the
/// largest UDP header.
const RECV_BUF_LEN: usize = 2048;

/// A UDP socket whose datagrams travel through a SOCKS5 relay.
pub struct Socks5UdpConn {
    control: Mutex<Option<TcpStream>>,
    socket: UdpSocket,
    default_target: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

/// Performs the SOCKS5 handshake against `proxy` and requests a UDP
/// association. Failure here means the proxy does not (or will not)
/// relay UDP, which disqualifies it for WebRTC.
pub async fn connect_udp(proxy: &Url) -> Result<Socks5UdpConn> {
    let host = proxy
        .host_str()
        .ok_or_else(|| ClientError::Proxy("proxy URL has no host".to_string()))?;
    let port = proxy.port().unwrap_or(1080);

    let mut control = TcpStream::connect((host, port))
        .await
        .map_err(|e| ClientError::Proxy(format!("connecting to proxy: {e}")))?;

    negotiate_method(&mut control, proxy).await?;

    // UDP ASSOCIATE. We do not know our relay-facing address yet, so the
    // request carries the all-zero placeholder the RFC allows.
    let request = [
        SOCKS_VERSION,
        CMD_UDP_ASSOCIATE,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    control
        .write_all(&request)
        .await
        .map_err(|e| ClientError::Proxy(format!("sending UDP ASSOCIATE: {e}")))?;

    let mut head = [0u8; 4];
    control
        .read_exact(&mut head)
        .await
        .map_err(|e| ClientError::Proxy(format!("reading UDP ASSOCIATE reply: {e}")))?;
    if head[0] != SOCKS_VERSION {
        return Err(ClientError::Proxy(format!(
            "proxy replied with version {:#04x}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(ClientError::Proxy(format!(
            "proxy does not support UDP (reply code {:#04x})",
            head[1]
        )));
    }
    let mut relay_addr = read_bound_address(&mut control, head[3]).await?;

    // Servers bound to the wildcard report 0.0.0.0; the relay then lives
    // on the proxy's own address.
    if relay_addr.ip().is_unspecified() {
        let peer = control
            .peer_addr()
            .map_err(|e| ClientError::Proxy(format!("proxy peer address: {e}")))?;
        relay_addr.set_ip(peer.ip());
    }

    let bind_addr: SocketAddr = match relay_addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ClientError::Proxy(format!("binding relay socket: {e}")))?;
    socket
        .connect(relay_addr)
        .await
        .map_err(|e| ClientError::Proxy(format!("connecting relay socket: {e}")))?;

    info!(%relay_addr, "UDP association established through SOCKS5 proxy");
    Ok(Socks5UdpConn {
        control: Mutex::new(Some(control)),
        socket,
        default_target: Mutex::new(None),
        closed: AtomicBool::new(false),
    })
}

async fn negotiate_method(control: &mut TcpStream, proxy: &Url) -> Result<()> {
    let username = proxy.username();
    let password = proxy.password();
    let with_auth = !username.is_empty() || password.is_some();

    let greeting: &[u8] = if with_auth {
        &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NO_AUTH]
    };
    control
        .write_all(greeting)
        .await
        .map_err(|e| ClientError::Proxy(format!("sending greeting: {e}")))?;

    let mut reply = [0u8; 2];
    control
        .read_exact(&mut reply)
        .await
        .map_err(|e| ClientError::Proxy(format!("reading greeting reply: {e}")))?;
    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USERNAME_PASSWORD if with_auth => {
            authenticate(control, username, password.unwrap_or_default()).await
        }
        METHOD_NO_ACCEPTABLE => Err(ClientError::Proxy(
            "proxy accepted none of our authentication methods".to_string(),
        )),
        other => Err(ClientError::Proxy(format!(
            "proxy selected unsupported method {other:#04x}"
        ))),
    }
}

/// RFC 1929 username/password subnegotiation.
async fn authenticate(control: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    if username.len() > 255 || password.len() > 255 {
        return Err(ClientError::Proxy(
            "proxy credentials exceed 255 bytes".to_string(),
        ));
    }
    let mut msg = Vec::with_capacity(3 + username.len() + password.len());
    msg.push(0x01);
    msg.push(username.len() as u8);
    msg.extend_from_slice(username.as_bytes());
    msg.push(password.len() as u8);
    msg.extend_from_slice(password.as_bytes());
    control
        .write_all(&msg)
        .await
        .map_err(|e| ClientError::Proxy(format!("sending credentials: {e}")))?;

    let mut reply = [0u8; 2];
    control
        .read_exact(&mut reply)
        .await
        .map_err(|e| ClientError::Proxy(format!("reading auth reply: {e}")))?;
    if reply[1] != 0x00 {
        return Err(ClientError::Proxy("proxy rejected credentials".to_string()));
    }
    Ok(())
}

async fn read_bound_address(control: &mut TcpStream, atyp: u8) -> Result<SocketAddr> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            control
                .read_exact(&mut buf)
                .await
                .map_err(|e| ClientError::Proxy(format!("reading bound address: {e}")))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            Ok((ip, u16::from_be_bytes([buf[4], buf[5]])).into())
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            control
                .read_exact(&mut buf)
                .await
                .map_err(|e| ClientError::Proxy(format!("reading bound address: {e}")))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            Ok((ip, u16::from_be_bytes([buf[16], buf[17]])).into())
        }
        ATYP_DOMAIN => {
            let len = control
                .read_u8()
                .await
                .map_err(|e| ClientError::Proxy(format!("reading bound address: {e}")))?;
            let mut name = vec![0u8; len as usize];
            control
                .read_exact(&mut name)
                .await
                .map_err(|e| ClientError::Proxy(format!("reading bound address: {e}")))?;
            let port = control
                .read_u16()
                .await
                .map_err(|e| ClientError::Proxy(format!("reading bound address: {e}")))?;
            let name = String::from_utf8(name)
                .map_err(|_| ClientError::Proxy("bound hostname is not UTF-8".to_string()))?;
            let resolved = lookup_host((name.as_str(), port))
                .await
                .map_err(|e| ClientError::Proxy(format!("resolving bound hostname: {e}")))?
                .next()
                .ok_or_else(|| {
                    ClientError::Proxy(format!("bound hostname {name:?} resolves to nothing"))
                });
            resolved
        }
        other => Err(ClientError::Proxy(format!(
            "proxy replied with unknown address type {other:#04x}"
        ))),
    }
}

/// Wraps `payload` in the RFC 1928 §7 UDP request header.
pub(crate) fn encode_udp_datagram(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(22 + payload.len());
    pkt.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV, FRAG
    match target {
        SocketAddr::V4(a) => {
            pkt.push(ATYP_IPV4);
            pkt.extend_from_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            pkt.push(ATYP_IPV6);
            pkt.extend_from_slice(&a.ip().octets());
        }
    }
    pkt.extend_from_slice(&target.port().to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// Splits a relayed datagram into its source address and payload.
/// Fragmented datagrams (FRAG != 0) are not supported and are rejected.
pub(crate) fn decode_udp_datagram(pkt: &[u8]) -> std::io::Result<(SocketAddr, &[u8])> {
    use std::io::{Error, ErrorKind};
    if pkt.len() < 4 {
        return Err(Error::new(ErrorKind::InvalidData, "short SOCKS UDP header"));
    }
    if pkt[2] != 0x00 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "fragmented SOCKS UDP datagram",
        ));
    }
    match pkt[3] {
        ATYP_IPV4 => {
            if pkt.len() < 10 {
                return Err(Error::new(ErrorKind::InvalidData, "short SOCKS UDP header"));
            }
            let ip = Ipv4Addr::new(pkt[4], pkt[5], pkt[6], pkt[7]);
            let port = u16::from_be_bytes([pkt[8], pkt[9]]);
            Ok(((ip, port).into(), &pkt[10..]))
        }
        ATYP_IPV6 => {
            if pkt.len() < 22 {
                return Err(Error::new(ErrorKind::InvalidData, "short SOCKS UDP header"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&pkt[4..20]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([pkt[20], pkt[21]]);
            Ok(((ip, port).into(), &pkt[22..]))
        }
        other => Err(Error::new(
            ErrorKind::InvalidData,
            format!("unsupported SOCKS UDP address type {other:#04x}"),
        )),
    }
}

impl Socks5UdpConn {
    fn ensure_open(&self) -> std::result::Result<(), UtilError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(UtilError::Other("SOCKS5 relay is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Conn for Socks5UdpConn {
    async fn connect(&self, addr: SocketAddr) -> std::result::Result<(), UtilError> {
        self.ensure_open()?;
        *self
            .default_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(addr);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, UtilError> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), UtilError> {
        let mut pkt = vec![0u8; RECV_BUF_LEN];
        loop {
            self.ensure_open()?;
            let n = self
                .socket
                .recv(&mut pkt)
                .await
                .map_err(|e| UtilError::Other(format!("relay recv: {e}")))?;
            match decode_udp_datagram(&pkt[..n]) {
                Ok((source, payload)) => {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok((len, source));
                }
                Err(e) => {
                    debug!(error = %e, "dropping malformed relay datagram");
                }
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, UtilError> {
        let target = self
            .default_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or_else(|| UtilError::Other("relay socket has no target".to_string()))?;
        self.send_to(buf, target).await
    }

    async fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> std::result::Result<usize, UtilError> {
        self.ensure_open()?;
        let pkt = encode_udp_datagram(target, buf);
        self.socket
            .send(&pkt)
            .await
            .map_err(|e| UtilError::Other(format!("relay send: {e}")))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> std::result::Result<SocketAddr, UtilError> {
        self.socket
            .local_addr()
            .map_err(|e| UtilError::Other(format!("relay local address: {e}")))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        *self
            .default_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn close(&self) -> std::result::Result<(), UtilError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the control connection tears down the association.
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}
