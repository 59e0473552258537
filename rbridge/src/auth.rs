use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::GatewayError;
use crate::types::{Protocol, Subject};
use crate::Result;

/// What an adapter knows about the peer when it asks for authentication.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub protocol: Protocol,
    pub remote_addr: Option<SocketAddr>,
    /// "GET", "PUT", "CONNECT", ...
    pub method: String,
    pub path: String,
    /// HTTP headers or textual CoAP options
    pub headers: Vec<(String, String)>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub client_id: Option<String>,
}

impl AuthRequest {
    #[inline]
    pub fn new<M: Into<String>, P: Into<String>>(protocol: Protocol, method: M, path: P) -> Self {
        Self {
            protocol,
            remote_addr: None,
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            username: None,
            password: None,
            client_id: None,
        }
    }

    #[inline]
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    #[inline]
    pub fn credentials(mut self, username: Option<String>, password: Option<Bytes>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Case-insensitive header lookup, first value wins.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait Authenticator: Sync + Send {
    ///Returns whether the peer is authenticated, and the subject used for later authorization.
    async fn authenticate(&self, req: &AuthRequest) -> Result<(bool, Subject)>;

    async fn authorize_read(&self, subject: &Subject, topic: &str) -> Result<bool>;

    async fn authorize_write(&self, subject: &Subject, topic: &str, payload: &Bytes) -> Result<bool>;
}

/// Authenticates and authorizes everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    #[inline]
    async fn authenticate(&self, _req: &AuthRequest) -> Result<(bool, Subject)> {
        Ok((true, Subject::anonymous()))
    }

    #[inline]
    async fn authorize_read(&self, _subject: &Subject, _topic: &str) -> Result<bool> {
        Ok(true)
    }

    #[inline]
    async fn authorize_write(&self, _subject: &Subject, _topic: &str, _payload: &Bytes) -> Result<bool> {
        Ok(true)
    }
}

/// Runs an [`Authenticator`] and turns its answers into [`GatewayError`]s, identically for every
/// protocol adapter.
#[derive(Clone)]
pub struct AuthPipeline {
    auth: Arc<dyn Authenticator>,
}

impl Default for AuthPipeline {
    fn default() -> Self {
        Self::new(Arc::new(AllowAll))
    }
}

impl AuthPipeline {
    #[inline]
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self { auth }
    }

    pub async fn authenticate(&self, req: &AuthRequest) -> Result<Subject, GatewayError> {
        match self.auth.authenticate(req).await {
            Ok((true, subject)) => Ok(subject),
            Ok((false, _)) => {
                log::info!(
                    "{} authentication denied, {} {}, from {:?}",
                    req.protocol,
                    req.method,
                    req.path,
                    req.remote_addr
                );
                Err(GatewayError::Unauthenticated)
            }
            Err(e) => {
                log::warn!("{} authenticate error, {} {}, {:?}", req.protocol, req.method, req.path, e);
                Err(GatewayError::AuthFault(e))
            }
        }
    }

    pub async fn authorize_read(&self, subject: &Subject, topic: &str) -> Result<(), GatewayError> {
        match self.auth.authorize_read(subject, topic).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::info!("read of {:?} not authorized, subject: {:?}", topic, subject);
                Err(GatewayError::Unauthorized)
            }
            Err(e) => {
                log::warn!("authorize read of {:?} error, {:?}", topic, e);
                Err(GatewayError::AuthFault(e))
            }
        }
    }

    pub async fn authorize_write(
        &self,
        subject: &Subject,
        topic: &str,
        payload: &Bytes,
    ) -> Result<(), GatewayError> {
        match self.auth.authorize_write(subject, topic, payload).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::info!("write of {:?} not authorized, subject: {:?}", topic, subject);
                Err(GatewayError::Unauthorized)
            }
            Err(e) => {
                log::warn!("authorize write of {:?} error, {:?}", topic, e);
                Err(GatewayError::AuthFault(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::anyhow;

    use super::*;

    /// Denies or fails on a few well known topics, allows everything else.
    pub(crate) struct TestAuth;

    #[async_trait]
    impl Authenticator for TestAuth {
        async fn authenticate(&self, req: &AuthRequest) -> Result<(bool, Subject)> {
            if req.path.ends_with("/authFault") {
                return Err(anyhow!("auth backend unavailable"));
            }
            let denied =
                req.path.ends_with("/unauthenticated") || req.username.as_deref() == Some("intruder");
            Ok((!denied, Subject::new(serde_json::json!({"name": "tester"}))))
        }

        async fn authorize_read(&self, subject: &Subject, topic: &str) -> Result<bool> {
            assert_eq!(subject.get("name"), Some("tester"));
            Ok(topic != "unauthorizedGet")
        }

        async fn authorize_write(&self, _subject: &Subject, topic: &str, _payload: &Bytes) -> Result<bool> {
            if topic == "writeFault" {
                return Err(anyhow!("acl backend unavailable"));
            }
            Ok(topic != "unauthorizedPut")
        }
    }

    #[tokio::test]
    async fn allow_all_is_the_default() {
        let pipeline = AuthPipeline::default();
        let req = AuthRequest::new(Protocol::Http, "GET", "/resources/hello");
        let subject = pipeline.authenticate(&req).await.unwrap();
        assert!(subject.is_anonymous());
        assert!(pipeline.authorize_read(&subject, "hello").await.is_ok());
        assert!(pipeline.authorize_write(&subject, "hello", &Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn outcomes_map_to_errors() {
        let pipeline = AuthPipeline::new(Arc::new(TestAuth));
        let req = AuthRequest::new(Protocol::Coap, "GET", "/r/unauthenticated");
        assert!(matches!(pipeline.authenticate(&req).await, Err(GatewayError::Unauthenticated)));
        let req = AuthRequest::new(Protocol::Coap, "GET", "/r/authFault");
        assert!(matches!(pipeline.authenticate(&req).await, Err(GatewayError::AuthFault(_))));

        let req = AuthRequest::new(Protocol::Coap, "GET", "/r/hello");
        let subject = pipeline.authenticate(&req).await.unwrap();
        let res = pipeline.authorize_read(&subject, "unauthorizedGet").await;
        assert!(matches!(res, Err(GatewayError::Unauthorized)));
        assert!(matches!(
            pipeline.authorize_write(&subject, "unauthorizedPut", &Bytes::new()).await,
            Err(GatewayError::Unauthorized)
        ));
        assert!(matches!(
            pipeline.authorize_write(&subject, "writeFault", &Bytes::new()).await,
            Err(GatewayError::AuthFault(_))
        ));
    }

    #[test]
    fn header_lookup() {
        let mut req = AuthRequest::new(Protocol::Http, "GET", "/");
        req.headers.push(("Authorization".into(), "Basic abc".into()));
        assert_eq!(req.header("authorization"), Some("Basic abc"));
        assert_eq!(req.header("x-missing"), None);
    }
}
