//! MQTT adapter.
//!
//! A small MQTT 3.1.1 front end over the shared broker. `CONNECT` goes through the auth pipeline,
//! `SUBSCRIBE` first delivers every retained value under the filter and then the live stream,
//! `PUBLISH` with the retain flag writes the retained store exactly like a CoAP or HTTP `PUT` does.
//! Publishes without the retain flag are only routed to subscribers.
//!
//! Messages are delivered to subscribers at QoS 0. Inbound QoS 1 and 2 publishes are acknowledged
//! once the write went through, a write that fails closes the connection.
//!
//! Sessions run over any byte stream: [`MqttServer`] feeds them plain TCP connections, the HTTP
//! listener feeds them upgraded websocket connections through [`Sessions::spawn`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytestring::ByteString;
use futures::{future, Future, SinkExt, StreamExt};
use parking_lot::Mutex;
use rmqtt_codec::types::Publish;
use rmqtt_codec::v3::{Codec, Connect, ConnectAck, ConnectAckReason, Packet, QoS, SubscribeReturnCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::auth::AuthRequest;
use crate::conf;
use crate::context::GatewayContext;
use crate::error::GatewayError;
use crate::gateway::Service;
use crate::observe::Canceller;
use crate::types::{HashMap, Message, Protocol, Retain, Subject, TopicFilter};
use crate::utils::Counter;
use crate::Result;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type MqttStream<T> = Framed<T, Codec>;

/// A byte stream a session can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// The MQTT sessions of one listener.
pub struct Sessions {
    scx: GatewayContext,
    cfg: conf::Mqtt,
    connections: Counter,
    tracker: TaskTracker,
    token: CancellationToken,
}

struct Running {
    shared: Arc<Sessions>,
    laddr: SocketAddr,
    task: JoinHandle<()>,
}

pub struct MqttServer {
    scx: GatewayContext,
    running: Mutex<Option<Running>>,
}

impl MqttServer {
    #[inline]
    pub fn new(scx: GatewayContext) -> Self {
        Self { scx, running: Mutex::new(None) }
    }

    /// Connected clients, and the most seen at once since start.
    #[inline]
    pub fn connections(&self) -> (isize, isize) {
        self.running.lock().as_ref().map(|r| r.shared.connections()).unwrap_or_default()
    }
}

#[async_trait]
impl Service for MqttServer {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn start(&self) -> Result<()> {
        let cfg = self.scx.settings.mqtt.clone();
        let listener = TcpListener::bind(cfg.laddr)
            .await
            .map_err(|e| anyhow!("mqtt bind {:?} error, {}", cfg.laddr, e))?;
        let laddr = listener.local_addr()?;
        log::info!("mqtt listening on {:?}", laddr);
        let shared = Sessions::new(self.scx.clone());
        let task = tokio::spawn(shared.clone().serve(listener));
        if let Some(old) = self.running.lock().replace(Running { shared, laddr, task }) {
            old.shared.token.cancel();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(Running { shared, task, .. }) = running {
            shared.token.cancel();
            if let Err(e) = task.await {
                log::warn!("mqtt accept task error, {:?}", e);
            }
            shared.shutdown().await;
            log::info!("mqtt server stopped");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.laddr)
    }
}

impl Sessions {
    pub fn new(scx: GatewayContext) -> Arc<Self> {
        let cfg = scx.settings.mqtt.clone();
        Arc::new(Self {
            scx,
            cfg,
            connections: Counter::new(),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        })
    }

    /// Runs an MQTT session over `io` until the peer leaves or [`Sessions::shutdown`] is called.
    #[inline]
    pub fn spawn<T: Io>(self: &Arc<Self>, io: T, peer: SocketAddr) {
        self.spawn_pending(future::ready(Ok(io)), peer)
    }

    /// Like [`Sessions::spawn`], for a stream that is still being set up, a websocket upgrade for one.
    pub fn spawn_pending<T, F>(self: &Arc<Self>, pending: F, peer: SocketAddr)
    where
        T: Io,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if self.token.is_cancelled() {
            log::debug!("{} mqtt connection dropped, sessions are shut down", peer);
            return;
        }
        let this = self.clone();
        self.tracker.spawn(async move {
            let io = tokio::select! {
                _ = this.token.cancelled() => return,
                io = pending => match io {
                    Ok(io) => io,
                    Err(e) => {
                        log::debug!("{} mqtt stream setup error, {}", peer, e);
                        return;
                    }
                },
            };
            this.process(io, peer).await
        });
    }

    /// Connected clients, and the most seen at once.
    #[inline]
    pub fn connections(&self) -> (isize, isize) {
        (self.connections.count(), self.connections.max())
    }

    /// Closes every session and waits until their subscriptions are released.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn(stream, peer),
                    Err(e) => {
                        log::warn!("mqtt accept error, {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    async fn process<T: Io>(self: Arc<Self>, io: T, peer: SocketAddr) {
        self.connections.inc();
        let _guard = scopeguard::guard(self.clone(), |s| s.connections.dec());

        let mut sink = Framed::new(io, Codec::new(self.cfg.max_packet_size.as_u32()));
        let (connect, subject) = match self.handshake(&mut sink, peer).await {
            Ok(c) => c,
            Err((reason, e)) => {
                log::info!("{} mqtt connection refused, reason: {:?}, {}", peer, reason, e);
                if let Some(return_code) = reason {
                    let ack = ConnectAck { session_present: false, return_code };
                    if let Err(e) = sink.send(Packet::ConnectAck(ack)).await {
                        log::debug!("{} send CONNACK error, {:?}", peer, e);
                    }
                }
                return;
            }
        };

        let ack = ConnectAck { session_present: false, return_code: ConnectAckReason::ConnectionAccepted };
        if let Err(e) = sink.send(Packet::ConnectAck(ack)).await {
            log::debug!("{} send CONNACK error, {:?}", peer, e);
            return;
        }
        log::debug!("{} mqtt connected, client_id: {}", peer, connect.client_id);

        let keep_alive = if connect.keep_alive > 0 && self.cfg.keepalive_backoff > 0.0 {
            Some(Duration::from_secs_f32(connect.keep_alive as f32 / self.cfg.keepalive_backoff))
        } else {
            None
        };
        let (session, rx) = Session::new(self.clone(), peer, connect.client_id, subject, keep_alive);
        session.run(sink, rx).await;
    }

    async fn handshake<T: Io>(
        &self,
        sink: &mut MqttStream<T>,
        peer: SocketAddr,
    ) -> std::result::Result<(Box<Connect>, Subject), (Option<ConnectAckReason>, anyhow::Error)> {
        let mut connect = match timeout(HANDSHAKE_TIMEOUT, sink.next()).await {
            Ok(Some(Ok((Packet::Connect(c), _)))) => c,
            Ok(Some(Ok((p, _)))) => return Err((None, anyhow!("first packet is not CONNECT, {:?}", p))),
            Ok(Some(Err(e))) => return Err((None, anyhow!("decode error, {:?}", e))),
            Ok(None) => return Err((None, anyhow!("closed by peer"))),
            Err(_) => return Err((None, anyhow!("handshake timeout"))),
        };

        if connect.client_id.is_empty() {
            if !connect.clean_session {
                return Err((
                    Some(ConnectAckReason::IdentifierRejected),
                    anyhow!("empty client id requires a clean session"),
                ));
            }
            connect.client_id = ByteString::from(Uuid::new_v4().as_simple().to_string());
        }

        let mut req = AuthRequest::new(Protocol::Mqtt, "CONNECT", "")
            .remote_addr(peer)
            .credentials(connect.username.as_ref().map(|u| u.to_string()), connect.password.clone());
        req.client_id = Some(connect.client_id.to_string());

        match self.scx.auth.authenticate(&req).await {
            Ok(subject) => Ok((connect, subject)),
            Err(e) => {
                let reason = match e {
                    GatewayError::Unauthenticated => ConnectAckReason::BadUserNameOrPassword,
                    GatewayError::Unauthorized => ConnectAckReason::NotAuthorized,
                    _ => ConnectAckReason::ServiceUnavailable,
                };
                Err((Some(reason), anyhow::Error::new(e)))
            }
        }
    }
}

struct Session {
    shared: Arc<Sessions>,
    peer: SocketAddr,
    client_id: ByteString,
    subject: Subject,
    keep_alive: Option<Duration>,
    subscriptions: HashMap<TopicFilter, Canceller>,
    tx: mpsc::Sender<Message>,
}

impl Session {
    fn new(
        shared: Arc<Sessions>,
        peer: SocketAddr,
        client_id: ByteString,
        subject: Subject,
        keep_alive: Option<Duration>,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session =
            Session { shared, peer, client_id, subject, keep_alive, subscriptions: HashMap::default(), tx };
        (session, rx)
    }

    async fn run<T: Io>(mut self, mut sink: MqttStream<T>, mut rx: mpsc::Receiver<Message>) {
        let mut deadline = self.keep_alive.map(|k| Instant::now() + k);
        let reason: String = loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => break "server stopped".into(),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    break "keep alive timeout".into()
                }
                Some(msg) = rx.recv() => {
                    if let Err(e) = sink.send(publish_packet(msg, false)).await {
                        break format!("send error, {:?}", e);
                    }
                }
                packet = sink.next() => match packet {
                    None => break "closed by peer".into(),
                    Some(Err(e)) => break format!("decode error, {:?}", e),
                    Some(Ok((packet, _))) => {
                        deadline = self.keep_alive.map(|k| Instant::now() + k);
                        match self.handle(&mut sink, packet).await {
                            Ok(true) => {}
                            Ok(false) => break "disconnect".into(),
                            Err(e) => break e.to_string(),
                        }
                    }
                }
            }
        };
        log::debug!("{} mqtt session {} closed, {}", self.peer, self.client_id, reason);

        for (_, canceller) in self.subscriptions.drain() {
            canceller.cancel().await;
        }
        if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, sink.close()).await {
            log::debug!("{} mqtt close error, {:?}", self.peer, e);
        }
    }

    /// Returns `false` once the client disconnected cleanly.
    async fn handle<T: Io>(&mut self, sink: &mut MqttStream<T>, packet: Packet) -> Result<bool> {
        match packet {
            Packet::Publish(publish) => self.publish(sink, *publish).await?,
            Packet::PublishRelease { packet_id } => sink.send(Packet::PublishComplete { packet_id }).await?,
            Packet::Subscribe { packet_id, topic_filters } => {
                let mut status = Vec::with_capacity(topic_filters.len());
                let mut retaineds = Vec::new();
                for (topic_filter, _) in topic_filters {
                    match self.subscribe(&topic_filter).await {
                        Ok(mut rs) => {
                            status.push(SubscribeReturnCode::Success(QoS::AtMostOnce));
                            retaineds.append(&mut rs);
                        }
                        Err(e) => {
                            log::debug!("{} subscribe {} refused, {}", self.peer, topic_filter, e);
                            status.push(SubscribeReturnCode::Failure);
                        }
                    }
                }
                sink.send(Packet::SubscribeAck { packet_id, status }).await?;
                for retain in retaineds {
                    sink.send(publish_packet(Message::from(retain), true)).await?;
                }
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                for topic_filter in topic_filters {
                    if let Some(canceller) = self.subscriptions.remove(&topic_filter) {
                        canceller.cancel().await;
                    }
                }
                sink.send(Packet::UnsubscribeAck { packet_id }).await?;
            }
            Packet::PingRequest => sink.send(Packet::PingResponse).await?,
            Packet::Disconnect => return Ok(false),
            //deliveries are QoS 0, nothing to acknowledge
            Packet::PublishAck { .. } | Packet::PublishReceived { .. } | Packet::PublishComplete { .. } => {}
            p => return Err(anyhow!("unexpected packet, {:?}", p)),
        }
        Ok(true)
    }

    /// A retained write is announced even when its acknowledgement can no longer be delivered.
    async fn publish<T: Io>(&mut self, sink: &mut MqttStream<T>, publish: Publish) -> Result<()> {
        let Publish { topic, payload, retain, qos, packet_id, .. } = publish;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(anyhow!("invalid publish topic {:?}", topic));
        }
        self.shared
            .scx
            .auth
            .authorize_write(&self.subject, &topic, &payload)
            .await
            .map_err(|e| anyhow!("publish to {:?} refused, {}", topic, e))?;

        let resources = &self.shared.scx.resources;
        let written = if retain {
            Some(resources.put(&topic, payload, Protocol::Mqtt).await?)
        } else {
            resources.publish(&topic, payload, Protocol::Mqtt).await?;
            None
        };

        let acked = match (qos, packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => sink.send(Packet::PublishAck { packet_id }).await,
            (QoS::ExactlyOnce, Some(packet_id)) => sink.send(Packet::PublishReceived { packet_id }).await,
            _ => Ok(()),
        };
        if let Some(written) = written {
            written.updated();
        }
        Ok(acked?)
    }

    async fn subscribe(
        &mut self,
        topic_filter: &TopicFilter,
    ) -> std::result::Result<Vec<Retain>, GatewayError> {
        self.shared.scx.auth.authorize_read(&self.subject, topic_filter).await?;
        let (retaineds, mut observation) = self.shared.scx.resources.observe(topic_filter).await?;

        if let Some(old) = self.subscriptions.insert(topic_filter.clone(), observation.canceller()) {
            old.cancel().await;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = observation.next().await {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            observation.cancel().await;
        });
        Ok(retaineds)
    }
}

#[inline]
fn publish_packet(msg: Message, retain: bool) -> Packet {
    Packet::Publish(Box::new(Publish {
        dup: false,
        retain,
        qos: QoS::AtMostOnce,
        topic: msg.topic,
        packet_id: None,
        payload: msg.payload,
        properties: None,
        delay_interval: None,
        create_time: None,
    }))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use tokio::net::TcpStream;

    use super::*;
    use crate::auth::tests::TestAuth;
    use crate::conf::Settings;

    fn context() -> GatewayContext {
        let mut inner = conf::Inner::default();
        inner.mqtt.laddr = ([127, 0, 0, 1], 0).into();
        let scx =
            GatewayContext::new(Settings::from(inner)).authenticator(Arc::new(TestAuth)).build().unwrap();
        scx.events.open();
        scx
    }

    async fn started() -> (GatewayContext, MqttServer) {
        let scx = context();
        let server = MqttServer::new(scx.clone());
        server.start().await.unwrap();
        (scx, server)
    }

    struct Client {
        sink: MqttStream<TcpStream>,
    }

    impl Client {
        async fn open(server: &MqttServer) -> Self {
            let stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
            Client { sink: Framed::new(stream, Codec::new(1024 * 1024)) }
        }

        async fn connect(
            server: &MqttServer,
            client_id: &str,
            username: Option<&str>,
        ) -> (Self, ConnectAckReason) {
            let mut c = Self::open(server).await;
            let mut connect = Connect::default().client_id(client_id);
            connect.username = username.map(ByteString::from);
            c.send(Packet::Connect(Box::new(connect))).await;
            match c.recv().await {
                Some(Packet::ConnectAck(ack)) => (c, ack.return_code),
                p => panic!("expected CONNACK, got {:?}", p),
            }
        }

        async fn send(&mut self, p: Packet) {
            self.sink.send(p).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Packet> {
            timeout(Duration::from_secs(5), self.sink.next()).await.unwrap().map(|r| r.unwrap().0)
        }

        async fn publish(&mut self, topic: &str, payload: &'static [u8], retain: bool, qos: QoS, id: u16) {
            self.send(Packet::Publish(Box::new(publish(topic, payload, retain, qos, id)))).await;
        }

        async fn subscribe(&mut self, filters: &[&str]) -> Vec<SubscribeReturnCode> {
            let topic_filters = filters.iter().map(|f| (ByteString::from(*f), QoS::AtMostOnce)).collect();
            self.send(Packet::Subscribe { packet_id: pid(1), topic_filters }).await;
            match self.recv().await {
                Some(Packet::SubscribeAck { status, .. }) => status,
                p => panic!("expected SUBACK, got {:?}", p),
            }
        }

        async fn recv_publish(&mut self) -> Publish {
            match self.recv().await {
                Some(Packet::Publish(p)) => *p,
                p => panic!("expected PUBLISH, got {:?}", p),
            }
        }
    }

    fn pid(id: u16) -> NonZeroU16 {
        NonZeroU16::new(id).unwrap()
    }

    fn publish(topic: &str, payload: &'static [u8], retain: bool, qos: QoS, id: u16) -> Publish {
        Publish {
            dup: false,
            retain,
            qos,
            topic: ByteString::from(topic),
            packet_id: NonZeroU16::new(id),
            payload: Bytes::from_static(payload),
            properties: None,
            delay_interval: None,
            create_time: None,
        }
    }

    #[tokio::test]
    async fn connect_and_ping() {
        let (_, server) = started().await;
        let (mut c, code) = Client::connect(&server, "c1", Some("alice")).await;
        assert_eq!(code, ConnectAckReason::ConnectionAccepted);
        assert_eq!(server.connections(), (1, 1));
        c.send(Packet::PingRequest).await;
        assert_eq!(c.recv().await, Some(Packet::PingResponse));
        c.send(Packet::Disconnect).await;
        assert_eq!(c.recv().await, None);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bad_credentials_are_refused() {
        let (_, server) = started().await;
        let (mut c, code) = Client::connect(&server, "c1", Some("intruder")).await;
        assert_eq!(code, ConnectAckReason::BadUserNameOrPassword);
        assert_eq!(c.recv().await, None);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn first_packet_must_be_connect() {
        let (_, server) = started().await;
        let mut c = Client::open(&server).await;
        c.send(Packet::PingRequest).await;
        assert_eq!(c.recv().await, None);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn retained_then_live() {
        let (scx, server) = started().await;
        let mut updates = scx.events.subscribe().unwrap();
        let _ = scx.resources.put("hello", Bytes::from_static(b"abcdef"), Protocol::Http).await.unwrap();

        let (mut sub, _) = Client::connect(&server, "sub", None).await;
        let status = sub.subscribe(&["hello", "unauthorizedGet"]).await;
        assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtMostOnce), SubscribeReturnCode::Failure]);
        let p = sub.recv_publish().await;
        assert!(p.retain);
        assert_eq!((p.topic.as_ref(), p.payload.as_ref()), ("hello", &b"abcdef"[..]));

        let (mut publ, _) = Client::connect(&server, "pub", None).await;
        publ.publish("hello", b"world", true, QoS::AtLeastOnce, 7).await;
        assert_eq!(publ.recv().await, Some(Packet::PublishAck { packet_id: pid(7) }));

        let p = sub.recv_publish().await;
        assert!(!p.retain);
        assert_eq!(p.payload, Bytes::from_static(b"world"));

        let update = updates.recv().await.unwrap();
        assert_eq!((update.topic.as_ref(), update.origin), ("hello", Protocol::Mqtt));
        let res = scx.resources.get("hello", false).await.unwrap();
        assert_eq!(res.retain.payload, Bytes::from_static(b"world"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn plain_publish_is_not_retained() {
        let (scx, server) = started().await;
        let (mut sub, _) = Client::connect(&server, "sub", None).await;
        assert_eq!(sub.subscribe(&["sensors/+"]).await, vec![SubscribeReturnCode::Success(QoS::AtMostOnce)]);

        let (mut publ, _) = Client::connect(&server, "pub", None).await;
        publ.publish("sensors/t1", b"21.5", false, QoS::ExactlyOnce, 3).await;
        assert_eq!(publ.recv().await, Some(Packet::PublishReceived { packet_id: pid(3) }));
        publ.send(Packet::PublishRelease { packet_id: pid(3) }).await;
        assert_eq!(publ.recv().await, Some(Packet::PublishComplete { packet_id: pid(3) }));

        let p = sub.recv_publish().await;
        assert_eq!((p.topic.as_ref(), p.payload.as_ref()), ("sensors/t1", &b"21.5"[..]));
        assert!(matches!(scx.resources.get("sensors/t1", false).await, Err(GatewayError::NotFound)));
        assert_eq!(scx.events.emitted(), 0);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn refused_publish_closes_the_connection() {
        let (scx, server) = started().await;
        let (mut c, _) = Client::connect(&server, "c1", None).await;
        c.publish("unauthorizedPut", b"x", true, QoS::AtLeastOnce, 1).await;
        assert_eq!(c.recv().await, None);
        assert!(matches!(scx.resources.get("unauthorizedPut", false).await, Err(GatewayError::NotFound)));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_and_stop_release_observations() {
        let (scx, server) = started().await;
        let (mut c, _) = Client::connect(&server, "c1", None).await;
        let _ = c.subscribe(&["a", "b"]).await;
        assert_eq!(scx.broker.subscriptions().await, 2);

        c.send(Packet::Unsubscribe { packet_id: pid(2), topic_filters: vec![ByteString::from("a")] }).await;
        assert_eq!(c.recv().await, Some(Packet::UnsubscribeAck { packet_id: pid(2) }));
        assert_eq!(scx.broker.subscriptions().await, 1);

        server.stop().await.unwrap();
        assert_eq!(scx.broker.subscriptions().await, 0);
        assert_eq!(c.recv().await, None);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn retained_write_is_announced_when_the_ack_is_lost() {
        let scx = context();
        let (client, io) = tokio::io::duplex(64);
        drop(client);
        let mut sink = Framed::new(io, Codec::new(1024));
        let subject = Subject::new(serde_json::json!({"name": "tester"}));
        let peer = ([127, 0, 0, 1], 1883).into();
        let (mut session, _rx) = Session::new(Sessions::new(scx.clone()), peer, "c1".into(), subject, None);

        let res = session.publish(&mut sink, publish("hello", b"world", true, QoS::AtLeastOnce, 1)).await;
        assert!(res.is_err());
        assert_eq!(scx.events.emitted(), 1);
        let res = scx.resources.get("hello", false).await.unwrap();
        assert_eq!(res.retain.payload, Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn sessions_run_over_any_stream() {
        let scx = context();
        let sessions = Sessions::new(scx.clone());
        let (client, io) = tokio::io::duplex(4096);
        sessions.spawn(io, ([127, 0, 0, 1], 1883).into());

        let mut client = Framed::new(client, Codec::new(1024));
        client.send(Packet::Connect(Box::new(Connect::default().client_id("c1")))).await.unwrap();
        let ack = timeout(Duration::from_secs(5), client.next()).await.unwrap().unwrap().unwrap().0;
        let accepted = ConnectAckReason::ConnectionAccepted;
        assert!(matches!(ack, Packet::ConnectAck(a) if a.return_code == accepted));
        assert_eq!(sessions.connections(), (1, 1));

        let topic_filters = vec![(ByteString::from("a"), QoS::AtMostOnce)];
        client.send(Packet::Subscribe { packet_id: pid(1), topic_filters }).await.unwrap();
        let ack = timeout(Duration::from_secs(5), client.next()).await.unwrap().unwrap().unwrap().0;
        assert!(matches!(ack, Packet::SubscribeAck { .. }));
        assert_eq!(scx.broker.subscriptions().await, 1);

        sessions.shutdown().await;
        assert_eq!(scx.broker.subscriptions().await, 0);
        assert_eq!(sessions.connections(), (0, 1));
    }
}
