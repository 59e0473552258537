//! Retained record storage.
//!
//! One record per topic name, looked up by exact name or by filter. Names are opaque, a `+` or
//! `#` inside a stored name is an ordinary character. Records live in a trie keyed by topic
//! [`Level`]s so filter lookups only walk matching branches:
//!
//! ```text
//!   Root
//!   ├── iot
//!   │   └── b
//!   │       ├── x (value=1)
//!   │       └── y (value=2)
//!   └── "" (blank level, topic "/hello")
//!       └── hello (value=3)
//! ```
//!
//! Every successful write is stamped with a store-wide sequence number, taken under the write
//! lock, so later writes to a topic always carry a larger number than earlier ones.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::conf;
use crate::topic::{Level, Topic};
use crate::types::{HashMap, Retain, Seq};
use crate::utils::Counter;
use crate::Result;

#[async_trait]
pub trait RetainStorage: Sync + Send {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    ///The record stored under exactly `topic`, no wildcard interpretation.
    async fn get_retained(&self, topic: &str) -> Result<Option<Retain>>;

    ///topic_filter - an MQTT topic filter, `+` and `#` are wildcards
    async fn lookup_retained(&self, topic_filter: &str) -> Result<Vec<Retain>>;

    ///Replaces the record of `retain.topic`, returns the sequence number it was stored with.
    async fn store_retained(&self, retain: Retain) -> Result<Seq>;

    async fn count(&self) -> isize;

    async fn max(&self) -> isize;
}

#[derive(Debug, Clone)]
pub struct TimedValue<V> {
    value: V,
    expire_at: Option<Instant>,
}

impl<V> TimedValue<V> {
    #[inline]
    pub fn new(value: V, timeout: Option<Duration>) -> Self {
        Self { value, expire_at: timeout.map(|t| Instant::now() + t) }
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    #[inline]
    pub fn into_value(self) -> V {
        self.value
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expire_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

struct StorageInner {
    messages: RwLock<RetainTree<TimedValue<Retain>>>,
    retaineds: Counter,
    seq: AtomicU64,
    cfg: conf::Retain,
}

/// In-memory [`RetainStorage`], limited by the `[retain]` settings.
pub struct DefaultRetainStorage {
    inner: Arc<StorageInner>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DefaultRetainStorage {
    fn default() -> Self {
        Self::new(conf::Retain::default())
    }
}

impl DefaultRetainStorage {
    #[inline]
    pub fn new(cfg: conf::Retain) -> DefaultRetainStorage {
        Self {
            inner: Arc::new(StorageInner {
                messages: RwLock::new(RetainTree::default()),
                retaineds: Counter::new(),
                seq: AtomicU64::new(0),
                cfg,
            }),
            cleaner: Mutex::new(None),
        }
    }

    #[inline]
    pub async fn remove_expired_messages(&self) -> usize {
        self.inner.remove_expired_messages().await
    }

    #[inline]
    fn expiry(&self) -> Option<Duration> {
        let interval = self.inner.cfg.expiry_interval;
        if interval.is_zero() {
            None
        } else {
            Some(interval)
        }
    }
}

impl StorageInner {
    async fn remove_expired_messages(&self) -> usize {
        let mut messages = self.messages.write().await;
        messages.retain(|tv| {
            if tv.is_expired() {
                self.retaineds.dec();
                false
            } else {
                true
            }
        })
    }
}

#[async_trait]
impl RetainStorage for DefaultRetainStorage {
    async fn start(&self) -> Result<()> {
        let interval = self.inner.cfg.expiry_interval;
        if interval.is_zero() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let period = (interval / 2).max(Duration::from_secs(1));
        let cleaner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let removeds = inner.remove_expired_messages().await;
                if removeds > 0 {
                    log::debug!("remove expired retained messages: {}", removeds);
                }
            }
        });
        if let Some(old) = self.cleaner.lock().replace(cleaner) {
            old.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.abort();
        }
        Ok(())
    }

    async fn get_retained(&self, topic: &str) -> Result<Option<Retain>> {
        let topic = Topic::literal(topic);
        let messages = self.inner.messages.read().await;
        Ok(messages.get(&topic).filter(|tv| !tv.is_expired()).map(|tv| tv.value().clone()))
    }

    async fn lookup_retained(&self, topic_filter: &str) -> Result<Vec<Retain>> {
        let topic = Topic::from_str(topic_filter)?;
        let retains = self
            .inner
            .messages
            .read()
            .await
            .matches(&topic)
            .into_iter()
            .filter_map(|(_, tv)| if tv.is_expired() { None } else { Some(tv.into_value()) })
            .collect::<Vec<Retain>>();
        Ok(retains)
    }

    async fn store_retained(&self, mut retain: Retain) -> Result<Seq> {
        let topic = Topic::literal(&retain.topic);
        let max_payload_size = self.inner.cfg.max_payload_size.as_usize();
        if retain.payload.len() > max_payload_size {
            return Err(anyhow!(
                "retained payload of `{}` is too large, {} > {}",
                retain.topic,
                retain.payload.len(),
                max_payload_size
            ));
        }

        let mut messages = self.inner.messages.write().await;
        let exists = messages.get(&topic).is_some();
        let max = self.inner.cfg.max_retained_messages;
        if !exists && max > 0 && self.inner.retaineds.count() >= max {
            return Err(anyhow!("the retained message limit has been reached, max: {}", max));
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        retain.seq = seq;
        messages.insert(&topic, TimedValue::new(retain, self.expiry()));
        if !exists {
            self.inner.retaineds.inc();
        }
        Ok(seq)
    }

    #[inline]
    async fn count(&self) -> isize {
        self.inner.retaineds.count()
    }

    #[inline]
    async fn max(&self) -> isize {
        self.inner.retaineds.max()
    }
}

impl Drop for DefaultRetainStorage {
    fn drop(&mut self) {
        if let Some(cleaner) = self.cleaner.get_mut().take() {
            cleaner.abort();
        }
    }
}

pub type RetainTree<V> = Node<V>;

pub struct Node<V> {
    value: Option<V>,
    branches: HashMap<Level, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> Node<V>
where
    V: Clone,
{
    /// Stores `value` at `topic`, returning the value it replaced.
    #[inline]
    pub fn insert(&mut self, topic: &Topic, value: V) -> Option<V> {
        let mut node = self;
        for level in topic.levels() {
            node = node.branches.entry(level.clone()).or_default();
        }
        node.value.replace(value)
    }

    #[inline]
    pub fn get(&self, topic: &Topic) -> Option<&V> {
        let mut node = self;
        for level in topic.levels() {
            node = node.branches.get(level)?;
        }
        node.value.as_ref()
    }

    #[inline]
    pub fn remove(&mut self, topic: &Topic) -> Option<V> {
        self._remove(topic.levels())
    }

    fn _remove(&mut self, path: &[Level]) -> Option<V> {
        match path.split_first() {
            None => self.value.take(),
            Some((first, rest)) => {
                let child = self.branches.get_mut(first)?;
                let res = child._remove(rest);
                if child.value.is_none() && child.branches.is_empty() {
                    self.branches.remove(first);
                }
                res
            }
        }
    }

    //remove all values for which `f(&mut v)` returns `false`, returns how many were removed.
    #[inline]
    pub fn retain<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut V) -> bool,
    {
        let mut removeds = 0;
        self._retain(&mut f, &mut removeds);
        removeds
    }

    fn _retain<F>(&mut self, f: &mut F, removeds: &mut usize)
    where
        F: FnMut(&mut V) -> bool,
    {
        self.branches.retain(|_, child| {
            child._retain(f, removeds);
            if let Some(v) = child.value.as_mut() {
                if !f(v) {
                    child.value = None;
                    *removeds += 1;
                }
            }
            !(child.value.is_none() && child.branches.is_empty())
        });
    }

    /// All values whose topic matches `filter`, with their topics.
    #[inline]
    pub fn matches(&self, filter: &Topic) -> Vec<(Topic, V)> {
        let mut out = Vec::new();
        self._matches(filter.levels(), &mut Vec::new(), &mut out);
        out
    }

    fn _matches(&self, filter: &[Level], path: &mut Vec<Level>, out: &mut Vec<(Topic, V)>) {
        let (first, rest) = match filter.split_first() {
            None => {
                if let Some(v) = self.value.as_ref() {
                    out.push((Topic::from(path.clone()), v.clone()));
                }
                return;
            }
            Some(split) => split,
        };

        match first {
            Level::MultiWildcard => {
                //"a/#" also matches "a"
                if !path.is_empty() {
                    if let Some(v) = self.value.as_ref() {
                        out.push((Topic::from(path.clone()), v.clone()));
                    }
                }
                self._descendants(path, out);
            }
            Level::SingleWildcard => {
                for (level, child) in self.branches.iter() {
                    //topic names starting with $ are not matched by a leading wildcard
                    if path.is_empty() && level.is_metadata() {
                        continue;
                    }
                    path.push(level.clone());
                    child._matches(rest, path, out);
                    path.pop();
                }
            }
            level => {
                if let Some(child) = self.branches.get(level) {
                    path.push(level.clone());
                    child._matches(rest, path, out);
                    path.pop();
                }
            }
        }
    }

    fn _descendants(&self, path: &mut Vec<Level>, out: &mut Vec<(Topic, V)>) {
        for (level, child) in self.branches.iter() {
            if path.is_empty() && level.is_metadata() {
                continue;
            }
            path.push(level.clone());
            if let Some(v) = child.value.as_ref() {
                out.push((Topic::from(path.clone()), v.clone()));
            }
            child._descendants(path, out);
            path.pop();
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        if self.value.is_some() {
            len + 1
        } else {
            len
        }
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;

    use super::*;
    use crate::utils::Bytesize;

    fn match_one(tree: &RetainTree<i32>, topic_filter: &str, vs: &[i32]) -> bool {
        let t = Topic::from_str(topic_filter).unwrap();
        let mut found = tree.matches(&t).into_iter().map(|(_, v)| v).collect::<Vec<_>>();
        found.sort();
        let mut vs = vs.to_vec();
        vs.sort();
        found == vs
    }

    #[test]
    fn retain_tree() {
        let mut tree: RetainTree<i32> = RetainTree::default();
        tree.insert(&Topic::from_str("/iot/b/x").unwrap(), 1);
        tree.insert(&Topic::from_str("/iot/b/y").unwrap(), 2);
        tree.insert(&Topic::from_str("/iot/b/z").unwrap(), 3);
        tree.insert(&Topic::from_str("/iot/b").unwrap(), 123);
        tree.insert(&Topic::from_str("/x/y/z").unwrap(), 4);
        tree.insert(&Topic::from_str("$SYS/x").unwrap(), 99);

        assert!(match_one(&tree, "/iot/b/y", &[2]));
        assert!(match_one(&tree, "/iot/b/+", &[1, 2, 3]));
        assert!(match_one(&tree, "/iot/b/#", &[123, 1, 2, 3]));
        assert!(match_one(&tree, "/x/y/z", &[4]));
        assert!(match_one(&tree, "x/y/z", &[]));
        assert!(match_one(&tree, "#", &[123, 1, 2, 3, 4]));
        assert!(match_one(&tree, "+/x", &[]));
        assert!(match_one(&tree, "$SYS/#", &[99]));

        assert_eq!(tree.insert(&Topic::from_str("/x/y/z").unwrap(), 5), Some(4));
        assert_eq!(tree.get(&Topic::from_str("/x/y/z").unwrap()), Some(&5));
        assert_eq!(tree.values_size(), 6);

        assert_eq!(tree.remove(&Topic::from_str("/x/y/z").unwrap()), Some(5));
        assert!(tree.get(&Topic::from_str("/x/y/z").unwrap()).is_none());
        assert_eq!(tree.retain(|v| *v != 123), 1);
        assert_eq!(tree.values_size(), 4);
        assert_eq!(tree.retain(|_| false), 4);
        assert_eq!(tree.nodes_size(), 0);
    }

    #[tokio::test]
    async fn store_and_lookup() {
        let storage = DefaultRetainStorage::default();
        assert!(storage.lookup_retained("hello").await.unwrap().is_empty());

        let s1 = storage.store_retained(Retain::new("hello", Bytes::from_static(b"hello world"))).await;
        let s2 = storage.store_retained(Retain::new("hello", Bytes::from_static(b"hello matteo"))).await;
        let (s1, s2) = (s1.unwrap(), s2.unwrap());
        assert!(s2 > s1);

        let found = storage.lookup_retained("hello").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, Bytes::from_static(b"hello matteo"));
        assert_eq!(found[0].seq, s2);
        assert_eq!(storage.count().await, 1);

        //distinct keys, no normalization of the leading delimiter
        storage.store_retained(Retain::new("/hello", Bytes::from_static(b"slash"))).await.unwrap();
        assert_eq!(storage.lookup_retained("/hello").await.unwrap()[0].payload, Bytes::from_static(b"slash"));
        let retaineds = storage.lookup_retained("hello").await.unwrap();
        assert_eq!(retaineds[0].payload, Bytes::from_static(b"hello matteo"));
        assert_eq!(storage.lookup_retained("+/hello").await.unwrap().len(), 1);
        assert_eq!(storage.count().await, 2);
    }

    #[tokio::test]
    async fn names_are_opaque() {
        let storage = DefaultRetainStorage::default();
        storage.store_retained(Retain::new("a+b", Bytes::from_static(b"plus"))).await.unwrap();
        storage.store_retained(Retain::new("a/1", Bytes::from_static(b"one"))).await.unwrap();
        storage.store_retained(Retain::new("a/#", Bytes::from_static(b"hash"))).await.unwrap();

        let found = storage.get_retained("a+b").await.unwrap().unwrap();
        assert_eq!(found.payload, Bytes::from_static(b"plus"));
        assert_eq!(storage.get_retained("a/#").await.unwrap().unwrap().payload, Bytes::from_static(b"hash"));
        //never written under that exact name
        assert!(storage.get_retained("a/+").await.unwrap().is_none());
        assert!(storage.get_retained("a").await.unwrap().is_none());

        //filters still see literal names
        let found = storage.lookup_retained("a/+").await.unwrap();
        let mut names = found.into_iter().map(|r| r.topic).collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["a/#", "a/1"]);
        assert_eq!(storage.count().await, 3);
    }

    #[tokio::test]
    async fn empty_payload_is_a_write() {
        let storage = DefaultRetainStorage::default();
        storage.store_retained(Retain::new("empty", Bytes::new())).await.unwrap();
        let found = storage.lookup_retained("empty").await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].payload.is_empty());
    }

    #[tokio::test]
    async fn limits() {
        let storage = DefaultRetainStorage::new(conf::Retain {
            max_retained_messages: 1,
            max_payload_size: Bytesize(4),
            expiry_interval: Duration::ZERO,
        });
        storage.store_retained(Retain::new("a", Bytes::from_static(b"1"))).await.unwrap();
        //replacing an existing record is always allowed
        storage.store_retained(Retain::new("a", Bytes::from_static(b"2"))).await.unwrap();
        assert!(storage.store_retained(Retain::new("b", Bytes::from_static(b"1"))).await.is_err());
        assert!(storage.store_retained(Retain::new("a", Bytes::from_static(b"12345"))).await.is_err());
        assert_eq!(storage.lookup_retained("a").await.unwrap()[0].payload, Bytes::from_static(b"2"));
        assert!(storage.lookup_retained("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expiry() {
        let storage = DefaultRetainStorage::new(conf::Retain {
            expiry_interval: Duration::from_millis(20),
            ..Default::default()
        });
        storage.store_retained(Retain::new("a", Bytes::from_static(b"1"))).await.unwrap();
        assert_eq!(storage.lookup_retained("a").await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(storage.lookup_retained("a").await.unwrap().is_empty());
        assert!(storage.get_retained("a").await.unwrap().is_none());
        assert_eq!(storage.remove_expired_messages().await, 1);
        assert_eq!(storage.count().await, 0);
    }
}
