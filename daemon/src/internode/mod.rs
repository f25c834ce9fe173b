//! Inter-node RPC over TCP: length-prefixed JSON frames, one long-lived
//! channel per peer, request/response correlation through a pending map.
//! A send failure reopens the channel and retries once; anything further
//! surfaces as Unreachable and the peer drops out of the current flow.

mod handler;

pub use handler::dispatch;

use crate::config::{InternodeConfig, PeerEntry};
use crate::core::CoreContext;
use casualchain_common::{
    error::{ErrorKind, ModuleError, Result},
    internode::{AckResult, EmptyBody, Packet, RequestKind},
    time::TimestampMillis,
};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{mpsc, oneshot, Mutex, RwLock},
};

/// Generous ceiling: a 15 MiB payload plus envelope still fits.
const MAX_FRAME_BYTES: u32 = 32 * 1024 * 1024;

/// Outbound queue depth per peer channel.
const CHANNEL_DEPTH: usize = 64;

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let raw = serde_json::to_vec(packet)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if raw.len() as u32 > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    writer.write_u32(raw.len() as u32).await?;
    writer.write_all(&raw).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Packet> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub struct InternodeModule {
    self_name: String,
    peers: Vec<PeerEntry>,
    default_timeout: Duration,
    retry_budget: u32,
    /// Open outbound channels, keyed by peer name.
    channels: RwLock<HashMap<String, mpsc::Sender<Packet>>>,
    /// packetId -> waiter for the matching response.
    pending: Arc<DashMap<String, oneshot::Sender<Packet>>>,
}

impl InternodeModule {
    pub fn new(config: &InternodeConfig) -> Self {
        Self {
            self_name: config.self_name.clone(),
            peers: config.nodes.clone(),
            default_timeout: Duration::from_millis(config.timeout_ms),
            retry_budget: config.retry_budget,
            channels: RwLock::new(HashMap::new()),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// Peers this node is allowed to contact.
    pub fn allowed_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.allow_outgoing)
            .map(|p| p.name.clone())
            .collect()
    }

    fn peer_entry(&self, name: &str) -> Result<&PeerEntry> {
        self.peers
            .iter()
            .find(|p| p.name == name && p.allow_outgoing)
            .ok_or_else(|| {
                ModuleError::not_found("internode", "peer_entry", format!("unknown peer {}", name))
            })
    }

    /// Route a response frame to its waiter. Unknown correlation ids are
    /// dropped with a notice.
    fn route_result(pending: &DashMap<String, oneshot::Sender<Packet>>, packet: Packet) {
        if packet.prev_id.is_empty() {
            debug!("dropping response without prevId from {}", packet.sender);
            return;
        }
        match pending.remove(&packet.prev_id) {
            Some((_, waiter)) => {
                let _ = waiter.send(packet);
            }
            None => {
                info!(
                    "dropping response to unknown prevId {} from {}",
                    packet.prev_id, packet.sender
                );
            }
        }
    }

    /// Fetch the open channel to a peer, dialing a fresh connection when
    /// none is alive.
    async fn channel_to(&self, name: &str) -> Result<mpsc::Sender<Packet>> {
        {
            let channels = self.channels.read().await;
            if let Some(sender) = channels.get(name) {
                if !sender.is_closed() {
                    return Ok(sender.clone());
                }
            }
        }

        let entry = self.peer_entry(name)?;
        let addr = format!("{}:{}", entry.host, entry.port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            ModuleError::unreachable("internode", "channel_to", format!("{}: {}", addr, e)).at("Connect")
        })?;
        trace!("opened channel to {} ({})", name, addr);
        let (read_half, write_half) = stream.into_split();

        let (sender, receiver) = mpsc::channel::<Packet>(CHANNEL_DEPTH);
        tokio::spawn(Self::run_writer(write_half, receiver, name.to_string()));
        tokio::spawn(Self::run_reader(read_half, self.pending.clone(), name.to_string()));

        self.channels
            .write()
            .await
            .insert(name.to_string(), sender.clone());
        Ok(sender)
    }

    async fn run_writer(
        mut write_half: OwnedWriteHalf,
        mut receiver: mpsc::Receiver<Packet>,
        peer: String,
    ) {
        while let Some(packet) = receiver.recv().await {
            if let Err(e) = write_frame(&mut write_half, &packet).await {
                warn!("channel to {} broke on write: {}", peer, e);
                break;
            }
        }
        trace!("writer for {} finished", peer);
    }

    async fn run_reader(
        mut read_half: OwnedReadHalf,
        pending: Arc<DashMap<String, oneshot::Sender<Packet>>>,
        peer: String,
    ) {
        loop {
            match read_frame(&mut read_half).await {
                Ok(packet) => Self::route_result(&pending, packet),
                Err(e) => {
                    trace!("channel to {} closed: {}", peer, e);
                    break;
                }
            }
        }
    }

    async fn drop_channel(&self, name: &str) {
        self.channels.write().await.remove(name);
    }

    /// One send attempt: enqueue the request and wait for its response.
    async fn send_and_wait(
        &self,
        peer: &str,
        packet: &Packet,
        timeout: Duration,
    ) -> Result<Packet> {
        let (waiter, receiver) = oneshot::channel();
        self.pending.insert(packet.packet_id.clone(), waiter);

        let sent = match self.channel_to(peer).await {
            Ok(sender) => sender
                .send(packet.clone())
                .await
                .map_err(|e| {
                    ModuleError::unreachable("internode", "send_and_wait", e.to_string()).at("Send")
                }),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.pending.remove(&packet.packet_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.remove(&packet.packet_id);
                Err(ModuleError::unreachable(
                    "internode",
                    "send_and_wait",
                    format!("channel to {} dropped", peer),
                )
                .at("Send"))
            }
            Err(_) => {
                self.pending.remove(&packet.packet_id);
                Err(ModuleError::unreachable(
                    "internode",
                    "send_and_wait",
                    format!("{} did not answer within {:?}", peer, timeout),
                )
                .at("Timeout"))
            }
        }
    }

    /// Issue a request and decode the typed response. A send-level failure
    /// reopens the channel once before giving up.
    pub async fn call_with_timeout<B: Serialize, R: DeserializeOwned>(
        &self,
        peer: &str,
        kind: RequestKind,
        body: &B,
        timeout: Duration,
    ) -> Result<R> {
        let packet = Packet::request(&self.self_name, peer, kind, body)?;

        let response = match self.send_and_wait(peer, &packet, timeout).await {
            Ok(response) => response,
            Err(e) if e.kind == ErrorKind::Unreachable && e.position != "Timeout" => {
                debug!("retrying {} to {} on a fresh channel", kind, peer);
                self.drop_channel(peer).await;
                self.send_and_wait(peer, &packet, timeout).await?
            }
            Err(e) => return Err(e),
        };

        match response.payload.payload_type {
            casualchain_common::internode::PayloadType::ResultSuccess => response.decode_body(),
            casualchain_common::internode::PayloadType::ResultFailure => {
                Err(response.decode_failure())
            }
            casualchain_common::internode::PayloadType::Request => Err(ModuleError::internal(
                "internode",
                "call",
                "peer answered with a request packet",
            )),
        }
    }

    pub async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        peer: &str,
        kind: RequestKind,
        body: &B,
    ) -> Result<R> {
        self.call_with_timeout(peer, kind, body, self.default_timeout)
            .await
    }

    /// Fire-and-forget request (`packetId == ""`).
    pub async fn notify<B: Serialize>(
        &self,
        peer: &str,
        kind: RequestKind,
        body: &B,
    ) -> Result<()> {
        let packet = Packet::notification(&self.self_name, peer, kind, body)?;
        let sender = match self.channel_to(peer).await {
            Ok(sender) => sender,
            Err(_) => {
                self.drop_channel(peer).await;
                self.channel_to(peer).await?
            }
        };
        sender.send(packet).await.map_err(|e| {
            ModuleError::unreachable("internode", "notify", e.to_string()).at("Send")
        })
    }

    pub async fn ping(&self, peer: &str) -> Result<()> {
        self.call::<EmptyBody, AckResult>(peer, RequestKind::Ping, &EmptyBody::default())
            .await
            .map(|_| ())
    }

    /// Startup gate: ping every allowed peer once per second until all
    /// answer or the retry budget runs out.
    pub async fn wait_for_nodes(&self) -> Result<()> {
        let mut remaining = self.allowed_peers();
        if remaining.is_empty() {
            return Ok(());
        }
        for round in 0..self.retry_budget {
            let pings = remaining.iter().map(|peer| async move {
                (peer.clone(), self.ping(peer).await)
            });
            let mut still_down = Vec::new();
            for (peer, outcome) in futures::future::join_all(pings).await {
                match outcome {
                    Ok(()) => debug!("peer {} answered the startup ping", peer),
                    Err(_) => still_down.push(peer),
                }
            }
            remaining = still_down;
            if remaining.is_empty() {
                info!("all peers reachable after {} rounds", round + 1);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(ModuleError::unreachable(
            "internode",
            "wait_for_nodes",
            format!("peers still unreachable: {}", remaining.join(", ")),
        ))
    }

    /// Accept loop for the inbound side of the duplex channels. Runs until
    /// the listener errors or the task is aborted at shutdown.
    pub async fn run_server(self: Arc<Self>, ctx: Arc<CoreContext>, listener: TcpListener) {
        info!("internode listener on {:?}", listener.local_addr().ok());
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    trace!("inbound channel from {}", addr);
                    tokio::spawn(Self::handle_connection(ctx.clone(), stream));
                }
                Err(e) => {
                    warn!("internode accept failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_connection(ctx: Arc<CoreContext>, stream: TcpStream) {
        let (mut read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        loop {
            let packet = match read_frame(&mut read_half).await {
                Ok(packet) => packet,
                Err(_) => break,
            };
            if packet.is_request() {
                let ctx = ctx.clone();
                let writer = writer.clone();
                tokio::spawn(async move {
                    let wants_response = packet.expects_response();
                    let response = dispatch(&ctx, packet).await;
                    if wants_response {
                        let mut writer = writer.lock().await;
                        if let Err(e) = write_frame(&mut *writer, &response).await {
                            warn!("failed to answer {}: {}", response.receiver, e);
                        }
                    }
                });
            } else {
                // duplex peers may route responses over either connection
                Self::route_result(&ctx.internode.pending, packet);
            }
        }
    }

    /// Close all channels; in-flight waiters resolve as Unreachable.
    pub async fn shutdown(&self) {
        self.channels.write().await.clear();
        self.pending.clear();
        info!("internode channels closed");
    }

    pub fn default_timeout_ms(&self) -> TimestampMillis {
        self.default_timeout.as_millis() as TimestampMillis
    }
}
