//! Rule based [`Authenticator`] configured from the `[auth]` section.
//!
//! Each rule is a quadruple `[access, user, control, topics]`, for example:
//!
//! ```toml
//! rules = [
//!     ["allow", {user = "dashboard", password = "123456"}, "connect"],
//!     ["deny", {protocol = "coap"}, "write", ["$SYS/#", {eq = "#"}]],
//!     ["allow", "all", "read", ["public/#"]],
//! ]
//! ```
//!
//! Rules are checked in order and the first one that hits decides. When none hits, `no_match`
//! decides.

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::auth::{AuthRequest, Authenticator};
use crate::conf;
use crate::topic::{Level, Topic};
use crate::types::{Protocol, Subject};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Access {
    Allow,
    Deny,
}

impl TryFrom<&Value> for Access {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(access_cfg: &Value) -> Result<Self> {
        let err_msg = format!("ACL rule config error, access config is {:?}", access_cfg);
        match access_cfg.as_str().ok_or_else(|| anyhow!(err_msg.clone()))?.to_lowercase().as_str() {
            "allow" => Ok(Access::Allow),
            "deny" => Ok(Access::Deny),
            _ => Err(anyhow!(err_msg)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    All,
    Connect,
    Read,
    Write,
}

impl TryFrom<Option<&Value>> for Control {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(control_cfg: Option<&Value>) -> Result<Self> {
        let err_msg = format!("ACL rule config error, control config is {:?}", control_cfg);
        match control_cfg {
            None => Ok(Control::All),
            Some(Value::String(control)) => match control.to_lowercase().as_str() {
                "connect" => Ok(Control::Connect),
                "read" | "subscribe" => Ok(Control::Read),
                "write" | "publish" => Ok(Control::Write),
                "all" => Ok(Control::All),
                _ => Err(anyhow!(err_msg)),
            },
            _ => Err(anyhow!(err_msg)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum User {
    All,
    Username(String, Option<String>),
    Clientid(String),
    Ipaddr(String),
    Protocol(Protocol),
}

/// Peer attributes a [`User`] is matched against.
#[derive(Debug, Default)]
struct Identity<'a> {
    username: Option<&'a str>,
    password: Option<&'a [u8]>,
    client_id: Option<&'a str>,
    ipaddr: Option<String>,
    protocol: Option<&'a str>,
}

impl<'a> Identity<'a> {
    fn from_request(req: &'a AuthRequest) -> Self {
        Identity {
            username: req.username.as_deref(),
            password: req.password.as_deref(),
            client_id: req.client_id.as_deref(),
            ipaddr: req.remote_addr.map(|a| a.ip().to_string()),
            protocol: Some(req.protocol.as_str()),
        }
    }

    fn from_subject(subject: &'a Subject) -> Self {
        Identity {
            username: subject.get("username"),
            password: None,
            client_id: subject.get("client_id"),
            ipaddr: subject.get("addr").map(String::from),
            protocol: subject.get("protocol"),
        }
    }
}

impl User {
    ///`check_password` is only set while authenticating.
    #[inline]
    fn hit(&self, id: &Identity, check_password: bool) -> bool {
        match self {
            User::All => true,
            User::Username(name, password) => match (id.username, password) {
                (Some(name1), Some(password)) if check_password => {
                    name1 == name && id.password == Some(password.as_bytes())
                }
                (Some(name1), _) => name1 == name,
                (None, _) => false,
            },
            User::Clientid(client_id) => id.client_id == Some(client_id.as_str()),
            User::Ipaddr(ipaddr) => id.ipaddr.as_deref() == Some(ipaddr.as_str()),
            User::Protocol(protocol) => id.protocol == Some(protocol.as_str()),
        }
    }
}

fn users_try_from(user_cfg: &Value) -> Result<Vec<User>> {
    let err_msg = format!("ACL rule config error, user config is {:?}", user_cfg);
    match user_cfg {
        Value::String(all) if all.to_lowercase() == "all" => Ok(vec![User::All]),
        Value::Object(map) => {
            let mut users = Vec::new();
            if let Some(name) = map.get("user").and_then(|v| v.as_str()) {
                let password = match map.get("password") {
                    Some(Value::String(p)) => Some(p.clone()),
                    None => None,
                    _ => return Err(anyhow!(err_msg)),
                };
                users.push(User::Username(name.into(), password));
            }
            if let Some(client_id) = map.get("clientid").and_then(|v| v.as_str()) {
                users.push(User::Clientid(client_id.into()));
            }
            if let Some(ipaddr) = map.get("addr").or_else(|| map.get("ipaddr")).and_then(|v| v.as_str()) {
                users.push(User::Ipaddr(ipaddr.into()));
            }
            if let Some(protocol) = map.get("protocol") {
                let protocol = serde_json::from_value::<Protocol>(protocol.clone())
                    .map_err(|e| anyhow!("{}, {}", err_msg, e))?;
                users.push(User::Protocol(protocol));
            }
            if users.is_empty() {
                return Err(anyhow!(err_msg));
            }
            Ok(users)
        }
        _ => Err(anyhow!(err_msg)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Topics {
    all: bool,
    eqs: HashSet<String>,
    filters: Vec<Topic>,
}

impl Topics {
    /// `topic` may itself be a filter (an MQTT subscription); it then has to be covered entirely
    /// by one of the configured filters.
    fn is_match(&self, topic: &str) -> bool {
        if self.all || self.eqs.contains(topic) {
            return true;
        }
        match Topic::from_str(topic) {
            Ok(t) if t.is_wildcard() => self.filters.iter().any(|f| covers(f, &t)),
            Ok(_) => self.filters.iter().any(|f| f.matches_str(topic)),
            Err(_) => false,
        }
    }
}

impl TryFrom<Option<&Value>> for Topics {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(topics_cfg: Option<&Value>) -> Result<Self> {
        let err_msg = format!("ACL rule config error, topics config is {:?}", topics_cfg);
        let mut topics = Topics::default();
        match topics_cfg {
            None => topics.all = true,
            Some(Value::Array(items)) => {
                for item in items {
                    match item {
                        Value::String(filter) => topics.filters.push(Topic::from_str(filter)?),
                        Value::Object(eq_map) => match eq_map.get("eq") {
                            Some(Value::String(eq)) => {
                                topics.eqs.insert(eq.clone());
                            }
                            _ => return Err(anyhow!(err_msg)),
                        },
                        _ => return Err(anyhow!(err_msg)),
                    }
                }
            }
            _ => return Err(anyhow!(err_msg)),
        }
        Ok(topics)
    }
}

/// True if every topic matched by `requested` is also matched by `filter`.
fn covers(filter: &Topic, requested: &Topic) -> bool {
    let (filter, requested) = (filter.levels(), requested.levels());
    for (pos, level) in filter.iter().enumerate() {
        match (level, requested.get(pos)) {
            (Level::MultiWildcard, Some(Level::Metadata(_))) if pos == 0 => return false,
            (Level::MultiWildcard, _) => return true,
            (_, None) => return false,
            (Level::SingleWildcard, Some(Level::MultiWildcard)) => return false,
            (Level::SingleWildcard, Some(Level::Metadata(_))) if pos == 0 => return false,
            (Level::SingleWildcard, Some(_)) => {}
            (l, Some(r)) if l == r => {}
            _ => return false,
        }
    }
    filter.len() == requested.len()
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub access: Access,
    pub users: Vec<User>,
    pub control: Control,
    pub topics: Topics,
}

impl Rule {
    #[inline]
    fn hit(&self, id: &Identity, check_password: bool) -> bool {
        self.users.iter().all(|u| u.hit(id, check_password))
    }
}

impl TryFrom<&Value> for Rule {
    type Error = anyhow::Error;
    #[inline]
    fn try_from(rule_cfg: &Value) -> Result<Self> {
        let err_msg = format!("ACL rule config error, rule config is {:?}", rule_cfg);
        let items = rule_cfg.as_array().ok_or_else(|| anyhow!(err_msg.clone()))?;
        let access_cfg = items.first().ok_or_else(|| anyhow!(err_msg.clone()))?;
        let user_cfg = items.get(1).ok_or_else(|| anyhow!(err_msg))?;
        let control = Control::try_from(items.get(2))?;
        let topics_cfg = items.get(3);
        if topics_cfg.is_some() && control == Control::Connect {
            log::warn!("ACL rule config, control is connect, topics are ignored, {:?}", topics_cfg);
        }
        Ok(Rule {
            access: Access::try_from(access_cfg)?,
            users: users_try_from(user_cfg)?,
            control,
            topics: Topics::try_from(topics_cfg)?,
        })
    }
}

pub struct AclAuthenticator {
    rules: Vec<Rule>,
    no_match: Access,
}

impl AclAuthenticator {
    pub fn new(cfg: &conf::Auth) -> Result<Self> {
        let rules = cfg.rules.iter().map(Rule::try_from).collect::<Result<Vec<_>>>()?;
        let no_match = Access::try_from(&Value::String(cfg.no_match.clone()))?;
        log::debug!("acl rules: {}, no_match: {:?}", rules.len(), no_match);
        Ok(Self { rules, no_match })
    }

    #[inline]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn check(&self, subject: &Subject, control: Control, topic: &str) -> bool {
        let id = Identity::from_subject(subject);
        let access = self
            .rules
            .iter()
            .filter(|r| matches!(r.control, Control::All) || r.control == control)
            .find(|r| r.hit(&id, false) && r.topics.is_match(topic))
            .map(|r| r.access)
            .unwrap_or(self.no_match);
        access == Access::Allow
    }
}

#[async_trait]
impl Authenticator for AclAuthenticator {
    async fn authenticate(&self, req: &AuthRequest) -> Result<(bool, Subject)> {
        let id = Identity::from_request(req);
        let access = self
            .rules
            .iter()
            .filter(|r| matches!(r.control, Control::Connect | Control::All))
            .find(|r| r.hit(&id, true))
            .map(|r| r.access)
            .unwrap_or(self.no_match);
        let subject = Subject::new(json!({
            "username": req.username,
            "client_id": req.client_id,
            "addr": id.ipaddr,
            "protocol": req.protocol,
        }));
        Ok((access == Access::Allow, subject))
    }

    async fn authorize_read(&self, subject: &Subject, topic: &str) -> Result<bool> {
        Ok(self.check(subject, Control::Read, topic))
    }

    async fn authorize_write(&self, subject: &Subject, topic: &str, _payload: &Bytes) -> Result<bool> {
        Ok(self.check(subject, Control::Write, topic))
    }
}
