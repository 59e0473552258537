//! MQTT over websocket.
//!
//! The HTTP listener hands any `Upgrade: websocket` request offering the `mqtt` subprotocol to
//! [`MqttUpgrade`], which answers `101 Switching Protocols` and runs an MQTT session over the
//! upgraded connection. Binary and text frames carry the MQTT byte stream, control frames are
//! answered by the websocket layer and never reach the session.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{ready, Sink, Stream};
use salvo::http::header::{self, HeaderMap, HeaderValue};
use salvo::http::StatusCode;
use salvo::hyper::upgrade::OnUpgrade;
use salvo::rt::tokio::TokioIo;
use salvo::{Depot, FlowCtrl, Handler, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::mqtt::Sessions;

const SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqttv3.1"];

/// Byte stream view of a websocket connection.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    cached: Option<Bytes>,
    idx: usize,
}

impl<S> WsStream<S> {
    #[inline]
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner, cached: None, idx: 0 }
    }

    fn fill(&mut self, data: Bytes, buf: &mut ReadBuf<'_>) {
        let remaining = buf.remaining();
        if data.len() <= remaining {
            buf.put_slice(&data);
            self.cached = None;
            self.idx = 0;
        } else {
            buf.put_slice(&data[..remaining]);
            self.cached = Some(data);
            self.idx = remaining;
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(cached) = self.cached.take() {
            let data = cached.slice(self.idx..);
            self.fill(data, buf);
            return Poll::Ready(Ok(()));
        }

        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(msg @ (Message::Binary(_) | Message::Text(_)))) => {
                    let data = msg.into_data();
                    //an empty read would be taken for eof
                    if data.is_empty() {
                        continue;
                    }
                    self.fill(data, buf);
                    return Poll::Ready(Ok(()));
                }
                //eof
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("websocket read error, {:?}", e);
                    return Poll::Ready(Err(to_error(e)));
                }
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let msg = Message::Binary(Bytes::copy_from_slice(buf));
        if let Err(e) = Pin::new(&mut self.inner).start_send(msg) {
            return Poll::Ready(Err(to_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.inner).poll_flush(cx)).map_err(to_error)?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(Pin::new(&mut self.inner).poll_close(cx)).map_err(to_error)?;
        Poll::Ready(Ok(()))
    }
}

fn to_error(e: WsError) -> io::Error {
    match e {
        WsError::ConnectionClosed => io::Error::from(ErrorKind::ConnectionAborted),
        WsError::AlreadyClosed => io::Error::from(ErrorKind::NotConnected),
        WsError::Io(e) => e,
        _ => io::Error::other(e.to_string()),
    }
}

/// The MQTT subprotocol offered by the client, if any.
fn subprotocol(headers: &HeaderMap) -> Option<&'static str> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|offered| SUBPROTOCOLS.iter().find(|p| offered.trim().eq_ignore_ascii_case(p)).copied())
}

#[inline]
fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Upgrades websocket requests into MQTT sessions, any other request passes through.
pub struct MqttUpgrade {
    sessions: Arc<Sessions>,
}

impl MqttUpgrade {
    #[inline]
    pub fn new(sessions: Arc<Sessions>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Handler for MqttUpgrade {
    async fn handle(&self, req: &mut Request, _depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
        if !is_upgrade(req.headers()) {
            return;
        }
        ctrl.skip_rest();

        let peer =
            req.remote_addr().clone().into_std().unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let key = req.headers().get(header::SEC_WEBSOCKET_KEY).map(|k| derive_accept_key(k.as_bytes()));
        let (Some(key), Some(protocol)) = (key, subprotocol(req.headers())) else {
            log::debug!("{} websocket upgrade refused, missing key or mqtt subprotocol", peer);
            res.status_code(StatusCode::BAD_REQUEST);
            return;
        };
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let (Ok(accept), Some(on_upgrade)) = (HeaderValue::from_str(&key), on_upgrade) else {
            log::warn!("{} websocket upgrade unavailable on this connection", peer);
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            return;
        };

        res.status_code(StatusCode::SWITCHING_PROTOCOLS);
        let headers = res.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
        log::debug!("{} websocket upgrade, subprotocol: {}", peer, protocol);

        let upgraded = async move {
            let io = TokioIo::new(on_upgrade.await?);
            let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
            Ok::<_, anyhow::Error>(WsStream::new(ws))
        };
        self.sessions.spawn_pending(upgraded, peer);
    }
}
