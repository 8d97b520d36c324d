//! One snowflake: a WebRTC peer connection with a single ordered,
//! reliable data channel carrying the tunnelled bytes.
//!
//! ICE runs non-trickle: the offer only leaves once gathering completes,
//! because the broker exchange is one-shot. The data channel's callbacks
//! are adapted into ordinary blocking-style I/O through a bounded pipe
//! (inbound) and `RTCDataChannel::send` (outbound). A peer that stops
//! producing inbound bytes is presumed dead and closed; outbound writes
//! deliberately do not count, since a proxy that swallows traffic would
//! otherwise keep a dead session alive indefinitely.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::broker::BrokerChannel;
use crate::error::{ClientError, Result};
use crate::nat::NatPolicy;
use crate::proxy;
use crate::sdp::{is_filtered_address, SessionDescription};

/// How long to wait for the data channel to open after the answer is
/// applied.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(20);

/// Inbound silence beyond this is treated as peer death.
pub const SNOWFLAKE_TIMEOUT: Duration = Duration::from_secs(30);

const STALE_CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Messages buffered between the data-channel callback and `recv`.
/// A full pipe blocks the callback, pushing backpressure into SCTP.
const PIPE_CAPACITY: usize = 64;

/// Out-of-band notifications about a peer's fate.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Failed { reason: String },
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// WebRTC-level knobs a peer needs from the configuration.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
    pub keep_local_addresses: bool,
    pub communication_proxy: Option<Url>,
}

struct PeerShared {
    id: String,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    cancel: CancellationToken,
    closed: AtomicBool,
    last_receive: Arc<StdMutex<Instant>>,
    events: Option<EventSender>,
}

impl PeerShared {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn touch(&self) {
        *self
            .last_receive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_receive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Once-only teardown: wake the pipe, then close channel and
    /// connection. Safe to race from the stale checker, the remote-close
    /// callback, and the public `close`.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.dc.close().await {
            debug!(id = %self.id, error = %e, "closing data channel");
        }
        if let Err(e) = self.pc.close().await {
            debug!(id = %self.id, error = %e, "closing peer connection");
        }
        info!(id = %self.id, "peer closed");
    }
}

struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

/// A connected snowflake peer. All methods are safe to call
/// concurrently; `recv` callers are serialized on the pipe.
pub struct WebRtcPeer {
    shared: Arc<PeerShared>,
    reader: AsyncMutex<PipeReader>,
}

impl WebRtcPeer {
    /// Dials one peer: gathers ICE, negotiates through the broker, and
    /// waits for the data channel to open. On success the returned peer
    /// is ready for `send`/`recv`.
    pub async fn connect(
        config: &PeerConfig,
        broker: &BrokerChannel,
        policy: &NatPolicy,
        events: Option<EventSender>,
    ) -> Result<Self> {
        let id = format!("snowflake-{:08x}", rand::random::<u32>());
        info!(%id, "dialing a new snowflake");

        let mut settings = SettingEngine::default();
        if config.keep_local_addresses {
            settings.set_include_loopback_candidate(true);
        } else {
            settings.set_ip_filter(Box::new(|ip: IpAddr| !is_filtered_address(ip)));
            settings.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        }
        if let Some(proxy_url) = &config.communication_proxy {
            // Verifies UDP ASSOCIATE support as a side effect; a proxy
            // without it cannot carry WebRTC at all.
            let relay = proxy::connect_udp(proxy_url).await?;
            let mux = UDPMuxDefault::new(UDPMuxParams::new(relay));
            settings.set_udp_network(UDPNetwork::Muxed(mux));
        }

        let api = APIBuilder::new().with_setting_engine(settings).build();
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer { urls: config.ice_servers.clone(), ..Default::default() }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration { ice_servers, ..Default::default() })
                .await?,
        );

        // The channel must exist before the offer so the offer carries an
        // m=application section.
        let dc = pc
            .create_data_channel(
                &id,
                Some(RTCDataChannelInit { ordered: Some(true), ..Default::default() }),
            )
            .await?;

        let cancel = CancellationToken::new();
        let last_receive = Arc::new(StdMutex::new(Instant::now()));
        let (pipe_tx, pipe_rx) = mpsc::channel::<Bytes>(PIPE_CAPACITY);
        let (open_tx, open_rx) = oneshot::channel::<()>();

        {
            let open_tx = StdMutex::new(Some(open_tx));
            let events = events.clone();
            let id = id.clone();
            dc.on_open(Box::new(move || {
                info!(%id, "data channel open");
                if let Some(tx) = open_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    let _ = tx.send(());
                }
                if let Some(tx) = &events {
                    let _ = tx.send(ConnectionEvent::Connected);
                }
                Box::pin(async {})
            }));
        }
        {
            let cancel = cancel.clone();
            let id = id.clone();
            dc.on_close(Box::new(move || {
                info!(%id, "data channel closed by remote");
                cancel.cancel();
                Box::pin(async {})
            }));
        }
        {
            let events = events.clone();
            let id = id.clone();
            dc.on_error(Box::new(move |e| {
                // No teardown here; staleness or the close callback will
                // collect the peer if the error was fatal.
                warn!(%id, error = %e, "data channel error");
                if let Some(tx) = &events {
                    let _ = tx.send(ConnectionEvent::Failed { reason: e.to_string() });
                }
                Box::pin(async {})
            }));
        }
        {
            let last_receive = last_receive.clone();
            let id = id.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = pipe_tx.clone();
                let last_receive = last_receive.clone();
                let id = id.clone();
                Box::pin(async move {
                    if msg.data.is_empty() {
                        debug!(%id, "ignoring empty message");
                        return;
                    }
                    *last_receive
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Instant::now();
                    if tx.send(msg.data).await.is_err() {
                        debug!(%id, "pipe closed, dropping inbound bytes");
                    }
                })
            }));
        }
        {
            let id = id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                debug!(%id, ?state, "peer connection state changed");
                Box::pin(async {})
            }));
        }

        let shared = Arc::new(PeerShared {
            id,
            pc,
            dc,
            cancel,
            closed: AtomicBool::new(false),
            last_receive,
            events,
        });
        let peer = WebRtcPeer {
            shared: shared.clone(),
            reader: AsyncMutex::new(PipeReader { rx: pipe_rx, pending: Bytes::new() }),
        };

        if let Err(e) = Self::negotiate(&shared, broker, policy, open_rx).await {
            shared.close().await;
            return Err(e);
        }

        shared.touch();
        Self::spawn_monitors(&shared);
        Ok(peer)
    }

    async fn negotiate(
        shared: &PeerShared,
        broker: &BrokerChannel,
        policy: &NatPolicy,
        open_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        let pc = &shared.pc;

        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        let _ = gather_complete.recv().await;
        let local = pc.local_description().await.ok_or_else(|| {
            ClientError::Negotiation("no local description after ICE gathering".to_string())
        })?;
        let offer = SessionDescription::from_rtc(&local)?;

        let observed = broker.get_nat_type();
        let nat_to_send = policy.nat_type_to_send(observed);
        let answer = broker.negotiate(&offer, nat_to_send).await?;
        pc.set_remote_description(answer.to_rtc()?).await?;

        tokio::select! {
            opened = open_rx => match opened {
                Ok(()) => {
                    policy.success(observed, nat_to_send);
                    Ok(())
                }
                Err(_) => {
                    policy.failure(observed, nat_to_send);
                    let reason = "data channel closed before opening".to_string();
                    shared.emit(ConnectionEvent::Failed { reason: reason.clone() });
                    Err(ClientError::Negotiation(reason))
                }
            },
            _ = tokio::time::sleep(DATA_CHANNEL_TIMEOUT) => {
                warn!(id = %shared.id, "timed out waiting for the data channel to open");
                policy.failure(observed, nat_to_send);
                let reason = "timed out waiting for the data channel to open".to_string();
                shared.emit(ConnectionEvent::Failed { reason: reason.clone() });
                Err(ClientError::Negotiation(reason))
            }
        }
    }

    fn spawn_monitors(shared: &Arc<PeerShared>) {
        // Remote close and error paths only cancel the token; this task
        // turns that into a full teardown without the callbacks having to
        // hold the connection (which would cycle).
        let s = shared.clone();
        tokio::spawn(async move {
            s.cancel.cancelled().await;
            s.close().await;
        });

        let s = shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_CHECK_PERIOD);
            loop {
                tokio::select! {
                    _ = s.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let idle = s.idle_for();
                        if idle > SNOWFLAKE_TIMEOUT {
                            warn!(id = %s.id, ?idle, "no inbound traffic, peer is stale");
                            s.emit(ConnectionEvent::Failed {
                                reason: "peer went stale".to_string(),
                            });
                            s.close().await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Reads tunnelled bytes. Blocks until the proxy delivers something
    /// or the peer closes, in which case the error is broken-pipe.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        if reader.pending.is_empty() {
            let chunk = tokio::select! {
                chunk = reader.rx.recv() => chunk,
                _ = self.shared.cancel.cancelled() => None,
            };
            match chunk {
                Some(chunk) => reader.pending = chunk,
                None => return Err(io::ErrorKind::BrokenPipe.into()),
            }
        }
        let n = buf.len().min(reader.pending.len());
        buf[..n].copy_from_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        Ok(n)
    }

    /// Writes tunnelled bytes to the data channel in order.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.shared
            .dc
            .send(&Bytes::copy_from_slice(buf))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    /// Idempotent teardown: pipe, then data channel, then connection.
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Non-blocking observation of terminal state.
    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// The per-peer random identifier, also the data channel's label.
    pub fn id(&self) -> &str {
        &self.shared.id
    }
}
