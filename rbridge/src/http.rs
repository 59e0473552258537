//! HTTP adapter.
//!
//! `GET /{root}/{topic}` answers the retained value, `PUT` and `POST` write it and answer
//! 204 with a `Location` header. Only resource requests are authenticated; other paths are served
//! from `public_dirs` when `serve_static` is set, 404 otherwise. Every response carries permissive
//! CORS headers and preflight requests are answered directly.
//!
//! With the `ws` feature and `websocket` set, the listener also carries MQTT over websocket, see
//! [`crate::ws`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::Bytes;
use http_body_util::LengthLimitError;
use parking_lot::Mutex;
use salvo::conn::tcp::TcpAcceptor;
use salvo::http::header::{self, HeaderMap, HeaderValue};
use salvo::http::{Method, ParseError, StatusCode};
use salvo::serve_static::StaticDir;
use salvo::server::ServerHandle;
use salvo::writing::Text;
use salvo::{handler, Depot, FlowCtrl, Handler, Request, Response, Router, Server};
use tokio::task::JoinHandle;

use crate::auth::AuthRequest;
use crate::context::GatewayContext;
use crate::error::GatewayError;
use crate::gateway::Service;
#[cfg(feature = "ws")]
use crate::mqtt::Sessions;
use crate::resource::{locate, Written};
use crate::types::Protocol;
use crate::Result;

#[handler]
async fn cors(req: &mut Request, res: &mut Response, ctrl: &mut FlowCtrl) {
    let headers = res.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, PUT, DELETE, OPTIONS, XMODIFY"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("X-Requested-With, X-HTTP-Method-Override, Content-Type, Accept"),
    );
    if req.method() == Method::OPTIONS {
        res.status_code(StatusCode::OK);
        ctrl.skip_rest();
    }
}

#[derive(Clone)]
struct Resources {
    scx: GatewayContext,
    root: String,
    max_body_size: usize,
    statics: Option<Arc<StaticDir>>,
}

#[async_trait]
impl Handler for Resources {
    async fn handle(&self, req: &mut Request, depot: &mut Depot, res: &mut Response, ctrl: &mut FlowCtrl) {
        let path = req.uri().path().to_owned();
        let Some(topic) = resource_topic(&self.root, &path).map(String::from) else {
            match &self.statics {
                Some(statics) => statics.handle(req, depot, res, ctrl).await,
                None => {
                    res.status_code(StatusCode::NOT_FOUND);
                    res.render(Text::Plain("Not Found"));
                }
            }
            return;
        };

        log::debug!("http {} {} from {:?}", req.method(), path, req.remote_addr());
        match self.serve(req, res, path, &topic).await {
            Ok(Some(written)) => {
                //emitted once the response is on its way
                tokio::spawn(async move {
                    written.updated();
                });
            }
            Ok(None) => {}
            Err(e) => {
                if e.is_fault() {
                    log::warn!("http {} /{}/{} failed, {}", req.method(), self.root, topic, e);
                } else {
                    log::debug!("http {} /{}/{} refused, {}", req.method(), self.root, topic, e);
                }
                let status =
                    StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                res.status_code(status);
                match e {
                    GatewayError::NotFound => res.render(Text::Plain("Not found")),
                    GatewayError::MethodNotAllowed => res.render(Text::Plain("Not Found")),
                    _ => {}
                }
            }
        }
    }
}

impl Resources {
    async fn serve(
        &self,
        req: &mut Request,
        res: &mut Response,
        path: String,
        topic: &str,
    ) -> Result<Option<Written>, GatewayError> {
        let (username, password) = basic_auth(req.headers());
        let mut auth_req =
            AuthRequest::new(Protocol::Http, req.method().as_str(), path).credentials(username, password);
        if let Some(addr) = req.remote_addr().clone().into_std() {
            auth_req = auth_req.remote_addr(addr);
        }
        auth_req.headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_owned(), v.to_owned())))
            .collect();
        let subject = self.scx.auth.authenticate(&auth_req).await?;

        match *req.method() {
            Method::GET => {
                self.scx.auth.authorize_read(&subject, topic).await?;
                let resource = self.scx.resources.get(topic, false).await?;
                res.status_code(StatusCode::OK);
                res.write_body(resource.retain.payload)
                    .map_err(|e| GatewayError::Transport(anyhow!("{}", e)))?;
                Ok(None)
            }
            Method::PUT | Method::POST => {
                let payload = req
                    .payload_with_max_size(self.max_body_size)
                    .await
                    .map(Bytes::clone)
                    .map_err(body_error)?;
                self.scx.auth.authorize_write(&subject, topic, &payload).await?;
                let written = self.scx.resources.put(topic, payload, Protocol::Http).await?;
                res.status_code(StatusCode::NO_CONTENT);
                if let Ok(location) = HeaderValue::from_str(&locate(&self.root, topic)) {
                    res.headers_mut().insert(header::LOCATION, location);
                }
                Ok(Some(written))
            }
            _ => Err(GatewayError::MethodNotAllowed),
        }
    }
}

fn body_error(e: ParseError) -> GatewayError {
    match e {
        ParseError::Other(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            GatewayError::PayloadTooLarge
        }
        e => GatewayError::Transport(anyhow!("read body error, {}", e)),
    }
}

/// `/{root}/{topic}` with a non-empty topic, the query string is not part of it.
#[inline]
fn resource_topic<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix('/')?.strip_prefix(root)?.strip_prefix('/').filter(|t| !t.is_empty())
}

fn basic_auth(headers: &HeaderMap) -> (Option<String>, Option<Bytes>) {
    let decoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| BASE64_STANDARD.decode(v.trim()).ok());
    match decoded {
        Some(decoded) => match decoded.iter().position(|b| *b == b':') {
            Some(idx) => (
                Some(String::from_utf8_lossy(&decoded[..idx]).into_owned()),
                Some(Bytes::copy_from_slice(&decoded[idx + 1..])),
            ),
            None => (Some(String::from_utf8_lossy(&decoded).into_owned()), None),
        },
        None => (None, None),
    }
}

pub fn route(scx: GatewayContext) -> Router {
    let cfg = &scx.settings.http;
    let statics = if cfg.serve_static {
        let statics =
            StaticDir::new(cfg.public_dirs.clone()).include_dot_files(cfg.static_dot_files).auto_list(false);
        Some(Arc::new(statics))
    } else {
        None
    };
    let resources =
        Resources { root: cfg.root.clone(), max_body_size: cfg.max_body_size.as_usize(), statics, scx };
    Router::new().hoop(cors).goal(resources.clone()).push(Router::with_path("{**rest}").goal(resources))
}

struct Running {
    laddr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<()>,
    #[cfg(feature = "ws")]
    sessions: Option<Arc<Sessions>>,
}

pub struct HttpServer {
    scx: GatewayContext,
    running: Mutex<Option<Running>>,
}

impl HttpServer {
    #[inline]
    pub fn new(scx: GatewayContext) -> Self {
        Self { scx, running: Mutex::new(None) }
    }
}

#[async_trait]
impl Service for HttpServer {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> Result<()> {
        let cfg = &self.scx.settings.http;
        let listener = tokio::net::TcpListener::bind(cfg.laddr)
            .await
            .map_err(|e| anyhow!("http bind {:?} error, {}", cfg.laddr, e))?;
        let laddr = listener.local_addr()?;
        let server = Server::new(TcpAcceptor::try_from(listener)?);
        let handle = server.handle();
        let router = route(self.scx.clone());
        #[cfg(feature = "ws")]
        let (router, sessions) = if cfg.websocket {
            let sessions = Sessions::new(self.scx.clone());
            (router.hoop(crate::ws::MqttUpgrade::new(sessions.clone())), Some(sessions))
        } else {
            (router, None)
        };
        let service = salvo::Service::new(router);
        let task = tokio::spawn(async move {
            server.serve(service).await;
        });
        log::info!("http listening on {:?}, root: /{}", laddr, cfg.root);
        self.running.lock().replace(Running {
            laddr,
            handle,
            task,
            #[cfg(feature = "ws")]
            sessions,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.handle.stop_graceful(None);
            #[cfg(feature = "ws")]
            if let Some(sessions) = running.sessions {
                sessions.shutdown().await;
            }
            if let Err(e) = running.task.await {
                log::warn!("http server task error, {:?}", e);
            }
            log::info!("http server stopped");
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.laddr)
    }
}

#[cfg(test)]
mod tests {
    use salvo::test::{ResponseExt, TestClient};

    use super::*;
    use crate::auth::tests::TestAuth;
    use crate::conf::{self, Settings};
    use crate::utils::Bytesize;

    const BASE: &str = "http://127.0.0.1:3000";

    fn context(inner: conf::Inner, auth: bool) -> GatewayContext {
        let builder = GatewayContext::new(Settings::from(inner));
        let builder = if auth { builder.authenticator(Arc::new(TestAuth)) } else { builder };
        let scx = builder.build().unwrap();
        scx.events.open();
        scx
    }

    fn service(scx: &GatewayContext) -> salvo::Service {
        salvo::Service::new(route(scx.clone()))
    }

    #[test]
    fn topics() {
        assert_eq!(resource_topic("resources", "/resources/hello"), Some("hello"));
        assert_eq!(resource_topic("resources", "/resources//hello"), Some("/hello"));
        assert_eq!(resource_topic("resources", "/resources/"), None);
        assert_eq!(resource_topic("resources", "/public/hello"), None);
    }

    #[test]
    fn basic_credentials() {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", BASE64_STANDARD.encode("matteo:s3cret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        let (u, p) = basic_auth(&headers);
        assert_eq!(u.as_deref(), Some("matteo"));
        assert_eq!(p, Some(Bytes::from_static(b"s3cret")));
        assert_eq!(basic_auth(&HeaderMap::new()), (None, None));
    }

    #[tokio::test]
    async fn put_then_get() {
        let scx = context(conf::Inner::default(), false);
        let service = service(&scx);
        let mut updates = scx.events.subscribe().unwrap();

        let mut res =
            TestClient::put(format!("{}/resources/hello", BASE)).text("hello world").send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NO_CONTENT));
        assert_eq!(res.headers().get(header::LOCATION).unwrap(), "/resources/hello");
        assert_eq!(res.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert!(res.take_string().await.unwrap().is_empty());

        let update = updates.recv().await.unwrap();
        assert_eq!(update.topic, "hello");
        assert_eq!(update.payload, Bytes::from_static(b"hello world"));

        let mut res = TestClient::get(format!("{}/resources/hello", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(res.take_string().await.unwrap(), "hello world");

        let res = TestClient::post(format!("{}/resources/empty", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NO_CONTENT));
        let mut res = TestClient::get(format!("{}/resources/empty", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert!(res.take_string().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_found() {
        let scx = context(conf::Inner::default(), false);
        let service = service(&scx);

        let mut res = TestClient::get(format!("{}/resources/missing", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
        assert_eq!(res.take_string().await.unwrap(), "Not found");

        let mut res = TestClient::get(format!("{}/elsewhere", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
        assert_eq!(res.take_string().await.unwrap(), "Not Found");

        let res = TestClient::delete(format!("{}/resources/hello", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn oversized_body() {
        let mut inner = conf::Inner::default();
        inner.http.max_body_size = Bytesize::from(8);
        let scx = context(inner, false);
        let service = service(&scx);

        let url = format!("{}/resources/big", BASE);
        let res = TestClient::put(&url).text("more than eight bytes").send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert!(matches!(scx.resources.get("big", false).await, Err(GatewayError::NotFound)));
        assert_eq!(scx.events.emitted(), 0);

        let res = TestClient::put(&url).text("8 bytes!").send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NO_CONTENT));
    }

    #[tokio::test]
    async fn preflight() {
        let scx = context(conf::Inner::default(), true);
        let service = service(&scx);
        let res = TestClient::options(format!("{}/resources/unauthenticated", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        let headers = res.headers();
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
        assert_eq!(headers.get(header::ACCESS_CONTROL_MAX_AGE).unwrap(), "86400");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap().to_str().unwrap().contains("PUT"));
    }

    #[tokio::test]
    async fn auth_outcomes() {
        let scx = context(conf::Inner::default(), true);
        let service = service(&scx);
        let status = |res: salvo::Response| res.status_code;

        let res = TestClient::get(format!("{}/resources/unauthenticated", BASE)).send(&service).await;
        assert_eq!(status(res), Some(StatusCode::UNAUTHORIZED));
        let res = TestClient::get(format!("{}/resources/authFault", BASE)).send(&service).await;
        assert_eq!(status(res), Some(StatusCode::INTERNAL_SERVER_ERROR));
        let res = TestClient::get(format!("{}/resources/unauthorizedGet", BASE)).send(&service).await;
        assert_eq!(status(res), Some(StatusCode::FORBIDDEN));
        let res =
            TestClient::put(format!("{}/resources/unauthorizedPut", BASE)).text("x").send(&service).await;
        assert_eq!(status(res), Some(StatusCode::FORBIDDEN));
        let res = TestClient::put(format!("{}/resources/hello", BASE))
            .basic_auth("intruder", Some("pw".to_owned()))
            .text("x")
            .send(&service)
            .await;
        assert_eq!(status(res), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(scx.retain.count().await, 0);
        assert_eq!(scx.events.emitted(), 0);
    }

    #[tokio::test]
    async fn static_files() {
        let dir = std::env::temp_dir().join(format!("rbridge-public-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hello.txt"), "static hello").unwrap();

        let mut inner = conf::Inner::default();
        inner.http.serve_static = true;
        inner.http.public_dirs = vec![dir.to_string_lossy().to_string()];
        let scx = context(inner, false);
        let service = service(&scx);

        let mut res = TestClient::get(format!("{}/hello.txt", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(res.take_string().await.unwrap(), "static hello");
        let res = TestClient::get(format!("{}/missing.txt", BASE)).send(&service).await;
        assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn serve_and_stop() {
        let mut inner = conf::Inner::default();
        inner.http.laddr = ([127, 0, 0, 1], 0).into();
        let scx = context(inner, false);
        let server = HttpServer::new(scx);
        server.start().await.unwrap();
        let laddr = server.local_addr().unwrap();
        assert_ne!(laddr.port(), 0);
        server.stop().await.unwrap();
        assert!(server.local_addr().is_none());
    }
}
