//! CoAP adapter.
//!
//! Resources live under `/{root}/{topic}`. `GET` reads the retained value and, with `Observe: 0`,
//! keeps sending every later write to the observer as notifications carrying the token of the
//! original request. Notifications are non-confirmable, except that once `confirm_interval` has
//! passed since the last acknowledged one the next goes out confirmable and is retransmitted up
//! to `max_retransmit` times, starting at `ack_timeout` and doubling. An observation ends when the
//! peer deregisters (`Observe: 1`), answers a notification with a reset, leaves a confirmable one
//! unacknowledged, a notification cannot be sent, or the server stops. `PUT` and `POST` write the
//! retained value and answer 2.04 with the resource location in `Location-Path`.
//!
//! Requests are remembered per `(peer, message id)` for `exchange_lifetime`, a retransmitted
//! request gets the cached response instead of being processed again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthRequest;
use crate::conf;
use crate::context::GatewayContext;
use crate::error::GatewayError;
use crate::gateway::Service;
use crate::observe::{Canceller, Observation};
use crate::resource::Written;
use crate::types::Protocol;
use crate::Result;

const OBSERVE_REGISTER: u32 = 0;
const OBSERVE_DEREGISTER: u32 = 1;
//Observe sequence numbers are 24 bit
const OBSERVE_MAX: u32 = 0xFF_FFFF;
const NO_MID: u32 = u32::MAX;

type ObserverKey = (SocketAddr, Vec<u8>);

struct Observer {
    id: u64,
    canceller: Canceller,
    //message id of the last notification sent, matched against resets
    last_mid: Arc<AtomicU32>,
}

struct Exchange {
    at: Instant,
    response: Option<Bytes>,
}

/// What to do once the response went out.
enum Followup {
    Nothing,
    Updated(Written),
    Observe(Observation, Vec<u8>),
}

struct Shared {
    scx: GatewayContext,
    cfg: conf::Coap,
    socket: UdpSocket,
    observers: DashMap<ObserverKey, Observer>,
    exchanges: DashMap<(SocketAddr, u16), Exchange>,
    //confirmable notifications waiting for an ACK (true) or RST (false)
    pending: DashMap<(SocketAddr, u16), oneshot::Sender<bool>>,
    next_mid: AtomicU16,
    next_observer_id: AtomicU64,
    shutdown: CancellationToken,
}

struct Running {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

pub struct CoapServer {
    scx: GatewayContext,
    running: Mutex<Option<Running>>,
}

impl CoapServer {
    #[inline]
    pub fn new(scx: GatewayContext) -> Self {
        Self { scx, running: Mutex::new(None) }
    }

    /// Number of live observations.
    #[inline]
    pub fn observers(&self) -> usize {
        self.running.lock().as_ref().map(|r| r.shared.observers.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Service for CoapServer {
    fn name(&self) -> &str {
        "coap"
    }

    async fn start(&self) -> Result<()> {
        let cfg = self.scx.settings.coap.clone();
        let socket = UdpSocket::bind(cfg.laddr)
            .await
            .map_err(|e| anyhow!("coap bind {:?} error, {}", cfg.laddr, e))?;
        log::info!("coap listening on {:?}, root: /{}", socket.local_addr()?, cfg.root);
        let shared = Arc::new(Shared {
            scx: self.scx.clone(),
            cfg,
            socket,
            observers: DashMap::default(),
            exchanges: DashMap::default(),
            pending: DashMap::default(),
            next_mid: AtomicU16::new((crate::utils::timestamp_millis() & 0xFFFF) as u16),
            next_observer_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        let task = tokio::spawn(shared.clone().serve());
        if let Some(old) = self.running.lock().replace(Running { shared, task }) {
            old.shared.shutdown.cancel();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(Running { shared, task }) = running {
            shared.shutdown.cancel();
            if let Err(e) = task.await {
                log::warn!("coap server task error, {:?}", e);
            }
            let cancellers = shared.observers.iter().map(|o| o.canceller.clone()).collect::<Vec<_>>();
            shared.observers.clear();
            for canceller in cancellers {
                canceller.cancel().await;
            }
            log::info!("coap server stopped");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.shared.socket.local_addr().ok())
    }
}

impl Shared {
    async fn serve(self: Arc<Self>) {
        let mut buf = vec![0u8; self.cfg.max_datagram_size.as_usize()];
        let period = (self.cfg.exchange_lifetime / 4).max(Duration::from_secs(1));
        let mut purge = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = purge.tick() => self.purge_exchanges(),
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, peer)) => self.dispatch(peer, &buf[..n]).await,
                    Err(e) => log::debug!("coap recv error, {:?}", e),
                },
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, peer: SocketAddr, data: &[u8]) {
        let packet = match Packet::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("malformed coap message from {}, {:?}", peer, e);
                return;
            }
        };
        let mid = packet.header.message_id;
        match (packet.header.get_type(), packet.header.code) {
            (MessageType::Reset, _) => self.on_reset(peer, mid),
            (MessageType::Acknowledgement, MessageClass::Empty) => self.on_ack(peer, mid),
            (_, MessageClass::Request(_)) => {
                if self.is_duplicate(peer, mid).await {
                    return;
                }
                let shared = self.clone();
                tokio::spawn(async move { shared.handle_request(peer, packet).await });
            }
            (MessageType::Confirmable, MessageClass::Empty) => {
                //ping
                let mut pong = Packet::new();
                pong.header.set_type(MessageType::Reset);
                pong.header.message_id = mid;
                self.send(&pong, peer).await;
            }
            _ => {}
        }
    }

    async fn is_duplicate(&self, peer: SocketAddr, mid: u16) -> bool {
        let cached = match self.exchanges.entry((peer, mid)) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().response.clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Exchange { at: Instant::now(), response: None });
                return false;
            }
        };
        log::debug!("duplicate coap request from {}, mid: {}", peer, mid);
        if let Some(response) = cached {
            if let Err(e) = self.socket.send_to(&response, peer).await {
                log::debug!("coap resend to {} error, {:?}", peer, e);
            }
        }
        true
    }

    fn purge_exchanges(&self) {
        let lifetime = self.cfg.exchange_lifetime;
        self.exchanges.retain(|_, x| x.at.elapsed() < lifetime);
    }

    fn on_ack(&self, peer: SocketAddr, mid: u16) {
        if let Some((_, tx)) = self.pending.remove(&(peer, mid)) {
            let _ = tx.send(true);
        }
    }

    fn on_reset(&self, peer: SocketAddr, mid: u16) {
        if let Some((_, tx)) = self.pending.remove(&(peer, mid)) {
            let _ = tx.send(false);
        }
        let found = self
            .observers
            .iter()
            .find(|o| o.key().0 == peer && o.last_mid.load(Ordering::SeqCst) == mid as u32)
            .map(|o| o.key().clone());
        if let Some((_, observer)) = found.and_then(|key| self.observers.remove(&key)) {
            log::debug!("coap observer {} reset notification {}", peer, mid);
            tokio::spawn(async move { observer.canceller.cancel().await });
        }
    }

    #[inline]
    fn next_mid(&self) -> u16 {
        self.next_mid.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, packet: &Packet, peer: SocketAddr) -> bool {
        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("coap encode error, {:?}", e);
                return false;
            }
        };
        match self.socket.send_to(&bytes, peer).await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("coap send to {} error, {:?}", peer, e);
                false
            }
        }
    }

    /// Sends a confirmable message until it is acknowledged, `false` once it is reset or given up on.
    async fn confirm(&self, packet: &Packet, peer: SocketAddr) -> bool {
        let mid = packet.header.message_id;
        let (tx, mut acked) = oneshot::channel();
        self.pending.insert((peer, mid), tx);
        let _pending = scopeguard::guard(&self.pending, move |pending| {
            pending.remove(&(peer, mid));
        });

        let mut wait = self.cfg.ack_timeout;
        for attempt in 0..=self.cfg.max_retransmit {
            if attempt > 0 {
                log::debug!("coap retransmit {} to {}, attempt {}", mid, peer, attempt);
            }
            if !self.send(packet, peer).await {
                return false;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                res = &mut acked => return res.unwrap_or(false),
                _ = tokio::time::sleep(wait) => wait *= 2,
            }
        }
        log::debug!("coap message {} to {} was never acknowledged", mid, peer);
        false
    }

    async fn handle_request(self: Arc<Self>, peer: SocketAddr, req: Packet) {
        let mid = req.header.message_id;
        let mut resp = Packet::new();
        resp.set_token(req.get_token().to_vec());
        if req.header.get_type() == MessageType::Confirmable {
            resp.header.set_type(MessageType::Acknowledgement);
            resp.header.message_id = mid;
        } else {
            resp.header.set_type(MessageType::NonConfirmable);
            resp.header.message_id = self.next_mid();
        }

        let followup = match self.process(peer, &req, &mut resp).await {
            Ok(followup) => followup,
            Err(e) => {
                if e.is_fault() {
                    log::warn!("coap request from {} failed, {}", peer, e);
                } else {
                    log::debug!("coap request from {} refused, {}", peer, e);
                }
                let (class, detail) = e.coap_code();
                resp.header.code = MessageClass::from((class << 5) | detail);
                resp.payload.clear();
                Followup::Nothing
            }
        };

        let sent = match resp.to_bytes() {
            Ok(bytes) => {
                let bytes = Bytes::from(bytes);
                if let Some(mut x) = self.exchanges.get_mut(&(peer, mid)) {
                    x.response = Some(bytes.clone());
                }
                match self.socket.send_to(&bytes, peer).await {
                    Ok(_) => true,
                    Err(e) => {
                        log::debug!("coap reply to {} error, {:?}", peer, e);
                        false
                    }
                }
            }
            Err(e) => {
                log::warn!("coap encode error, {:?}", e);
                false
            }
        };

        match followup {
            Followup::Nothing => {}
            Followup::Updated(written) => {
                written.updated();
            }
            Followup::Observe(observation, token) => {
                if sent {
                    self.observe(peer, token, observation).await;
                } else {
                    observation.cancel().await;
                }
            }
        }
    }

    async fn process(
        &self,
        peer: SocketAddr,
        req: &Packet,
        resp: &mut Packet,
    ) -> Result<Followup, GatewayError> {
        let path = uri_path(req);
        let topic = match resource_topic(&self.cfg.root, &path) {
            Some(topic) => topic.to_owned(),
            None => return Err(GatewayError::NotFound),
        };

        let (username, password) = credentials(req);
        let auth_req = AuthRequest::new(Protocol::Coap, method_name(req.header.code), path)
            .remote_addr(peer)
            .credentials(username, password);
        let subject = self.scx.auth.authenticate(&auth_req).await?;

        match req.header.code {
            MessageClass::Request(RequestType::Get) => {
                self.scx.auth.authorize_read(&subject, &topic).await?;
                let token = req.get_token().to_vec();
                let observe = observe_value(req);
                if observe == Some(OBSERVE_DEREGISTER) {
                    self.deregister(peer, &token).await;
                }
                let res = self.scx.resources.get(&topic, observe == Some(OBSERVE_REGISTER)).await?;
                resp.header.code = MessageClass::Response(ResponseType::Content);
                resp.payload = res.retain.payload.to_vec();
                match res.observation {
                    Some(observation) => {
                        resp.add_option(CoapOption::Observe, encode_uint(1));
                        Ok(Followup::Observe(observation, token))
                    }
                    None => Ok(Followup::Nothing),
                }
            }
            MessageClass::Request(RequestType::Put) | MessageClass::Request(RequestType::Post) => {
                let payload = Bytes::from(req.payload.clone());
                self.scx.auth.authorize_write(&subject, &topic, &payload).await?;
                let written = self.scx.resources.put(&topic, payload, Protocol::Coap).await?;
                resp.header.code = MessageClass::Response(ResponseType::Changed);
                resp.add_option(CoapOption::LocationPath, self.cfg.root.as_bytes().to_vec());
                for segment in topic.split('/') {
                    resp.add_option(CoapOption::LocationPath, segment.as_bytes().to_vec());
                }
                Ok(Followup::Updated(written))
            }
            _ => Err(GatewayError::MethodNotAllowed),
        }
    }

    async fn deregister(&self, peer: SocketAddr, token: &[u8]) {
        if let Some((_, observer)) = self.observers.remove(&(peer, token.to_vec())) {
            log::debug!("coap observer {} deregistered", peer);
            observer.canceller.cancel().await;
        }
    }

    async fn observe(self: &Arc<Self>, peer: SocketAddr, token: Vec<u8>, mut observation: Observation) {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let last_mid = Arc::new(AtomicU32::new(NO_MID));
        let observer = Observer { id, canceller: observation.canceller(), last_mid: last_mid.clone() };
        if let Some(replaced) = self.observers.insert((peer, token.clone()), observer) {
            replaced.canceller.cancel().await;
        }
        log::debug!("coap observer {} on {:?}", peer, observation.topic_filter());

        let shared = self.clone();
        tokio::spawn(async move {
            let mut seq = 1;
            let mut confirmed_at = Instant::now();
            loop {
                let msg = tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    msg = observation.next() => msg,
                };
                let Some(msg) = msg else { break };

                seq = (seq + 1) & OBSERVE_MAX;
                let mid = shared.next_mid();
                let confirmable = confirmed_at.elapsed() >= shared.cfg.confirm_interval;
                let mut notification = Packet::new();
                notification.header.set_type(if confirmable {
                    MessageType::Confirmable
                } else {
                    MessageType::NonConfirmable
                });
                notification.header.message_id = mid;
                notification.header.code = MessageClass::Response(ResponseType::Content);
                notification.set_token(token.clone());
                notification.add_option(CoapOption::Observe, encode_uint(seq));
                notification.payload = msg.payload.to_vec();
                last_mid.store(mid as u32, Ordering::SeqCst);
                if !confirmable {
                    if !shared.send(&notification, peer).await {
                        break;
                    }
                } else if shared.confirm(&notification, peer).await {
                    confirmed_at = Instant::now();
                } else {
                    break;
                }
            }
            if observation.cancel().await {
                log::debug!("coap observation of {} on {:?} ended", peer, observation.topic_filter());
            }
            shared.observers.remove_if(&(peer, token), |_, o| o.id == id);
        });
    }
}

fn uri_path(req: &Packet) -> String {
    let segments = req
        .get_option(CoapOption::UriPath)
        .map(|segs| segs.iter().map(|s| String::from_utf8_lossy(s).into_owned()).collect::<Vec<_>>())
        .unwrap_or_default();
    format!("/{}", segments.join("/"))
}

/// `/{root}/{topic}` with a non-empty topic.
#[inline]
fn resource_topic<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix('/')?.strip_prefix(root)?.strip_prefix('/').filter(|t| !t.is_empty())
}

/// `u=` and `p=` query parameters.
fn credentials(req: &Packet) -> (Option<String>, Option<Bytes>) {
    let mut username = None;
    let mut password = None;
    if let Some(queries) = req.get_option(CoapOption::UriQuery) {
        for q in queries.iter() {
            if let Some(u) = q.strip_prefix(b"u=") {
                username = Some(String::from_utf8_lossy(u).into_owned());
            } else if let Some(p) = q.strip_prefix(b"p=") {
                password = Some(Bytes::copy_from_slice(p));
            }
        }
    }
    (username, password)
}

fn observe_value(req: &Packet) -> Option<u32> {
    req.get_option(CoapOption::Observe).and_then(|vals| vals.iter().next()).and_then(|v| decode_uint(v))
}

fn method_name(code: MessageClass) -> &'static str {
    match code {
        MessageClass::Request(RequestType::Get) => "GET",
        MessageClass::Request(RequestType::Post) => "POST",
        MessageClass::Request(RequestType::Put) => "PUT",
        MessageClass::Request(RequestType::Delete) => "DELETE",
        _ => "UNKNOWN",
    }
}

#[inline]
fn encode_uint(v: u32) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let zeros = bytes.iter().take_while(|b| **b == 0).count();
    bytes[zeros..].to_vec()
}

#[inline]
fn decode_uint(v: &[u8]) -> Option<u32> {
    if v.len() > 4 {
        return None;
    }
    Some(v.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}
