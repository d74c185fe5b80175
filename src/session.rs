//! Sessions: per-tag cookie state and proxy pinning.
//!
//! Jobs reference sessions through a tag, never a direct handle; the
//! sharded map is the owner. Each session carries a dispatch mutex the
//! dispatcher holds for the whole attempt loop so cookie updates and
//! pinned-proxy decisions compose across concurrent jobs on one tag.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::cookie::CookieJar;
use crate::error::Result;

/// How cookies persist across requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CookiePersistence {
    /// One jar per session tag.
    #[default]
    Session,
    /// Separate jars per proxy identity within a session.
    PerProxy,
    /// No cookie storage at all.
    None,
}

/// Cookie handling configuration.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub enabled: bool,
    pub persistence: CookiePersistence,
    /// Netscape-format cookie file, loaded on startup and rewritten on
    /// shutdown or after every `flush_every` jar updates.
    pub file: Option<PathBuf>,
    pub flush_every: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persistence: CookiePersistence::Session,
            file: None,
            flush_every: 50,
        }
    }
}

/// Jar key within a session. Session-persistence uses a single key;
/// per-proxy persistence keys by the proxy URL in effect.
fn jar_key(persistence: CookiePersistence, proxy: Option<&str>) -> Option<String> {
    match persistence {
        CookiePersistence::Session => Some(String::new()),
        CookiePersistence::PerProxy => Some(proxy.unwrap_or("").to_string()),
        CookiePersistence::None => None,
    }
}

/// Per-tag session state.
pub struct Session {
    pub tag: String,
    pub created_at: Instant,
    persistence: CookiePersistence,
    jars: RwLock<HashMap<String, CookieJar>>,
    pinned_proxy: Mutex<Option<String>>,
    last_used: Mutex<Instant>,
    updates: AtomicU64,
    /// Serializes dispatches on this session (held across the attempt loop).
    dispatch_lock: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(tag: String, persistence: CookiePersistence) -> Self {
        let now = Instant::now();
        Self {
            tag,
            created_at: now,
            persistence,
            jars: RwLock::new(HashMap::new()),
            pinned_proxy: Mutex::new(None),
            last_used: Mutex::new(now),
            updates: AtomicU64::new(0),
            dispatch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquire the per-session dispatch lock.
    pub async fn lock_dispatch(&self) -> tokio::sync::MutexGuard<'_, ()> {
        *self.last_used.lock() = Instant::now();
        self.dispatch_lock.lock().await
    }

    /// Build the Cookie header for a request, honoring persistence mode.
    pub fn cookie_header(&self, url: &str, proxy: Option<&str>) -> Option<String> {
        let key = jar_key(self.persistence, proxy)?;
        self.jars.read().get(&key)?.cookie_header(url)
    }

    /// Merge Set-Cookie values from a response into the session jar.
    /// Returns the total update count (for flush-every decisions).
    pub fn merge_response_cookies(
        &self,
        set_cookie_values: &[&str],
        request_url: &str,
        proxy: Option<&str>,
    ) -> u64 {
        let Some(key) = jar_key(self.persistence, proxy) else {
            return self.updates.load(Ordering::Relaxed);
        };
        if !set_cookie_values.is_empty() {
            let mut jars = self.jars.write();
            jars.entry(key)
                .or_default()
                .store_from_response(set_cookie_values, request_url);
        }
        self.updates.fetch_add(set_cookie_values.len() as u64, Ordering::Relaxed)
            + set_cookie_values.len() as u64
    }

    /// Point-in-time copy of the jar (empty jar when persistence is off).
    pub fn jar_snapshot(&self, proxy: Option<&str>) -> CookieJar {
        jar_key(self.persistence, proxy)
            .and_then(|key| self.jars.read().get(&key).cloned())
            .unwrap_or_default()
    }

    /// Seed the session jar (cookie-file startup load).
    pub fn seed_jar(&self, jar: CookieJar) {
        if let Some(key) = jar_key(self.persistence, None) {
            self.jars.write().insert(key, jar);
        }
    }

    pub fn clear_cookies(&self) {
        self.jars.write().clear();
    }

    pub fn pinned_proxy(&self) -> Option<String> {
        self.pinned_proxy.lock().clone()
    }

    /// Pin (or rewrite the pin to) a proxy identity.
    pub fn pin_proxy(&self, proxy: impl Into<String>) {
        *self.pinned_proxy.lock() = Some(proxy.into());
    }

    pub fn unpin_proxy(&self) {
        *self.pinned_proxy.lock() = None;
    }

    /// Total jar updates since creation.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

const SHARD_COUNT: usize = 16;

/// Sharded map of sessions keyed by tag.
pub struct SessionMap {
    shards: Vec<RwLock<HashMap<String, Arc<Session>>>>,
    persistence: CookiePersistence,
    /// Sessions idle longer than this are destroyed by `sweep_expired`.
    ttl: Duration,
    /// Update count of the default session at the last cookie-file write.
    flushed_updates: AtomicU64,
}

impl SessionMap {
    pub fn new(persistence: CookiePersistence, ttl: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            persistence,
            ttl,
            flushed_updates: AtomicU64::new(0),
        }
    }

    fn shard(&self, tag: &str) -> &RwLock<HashMap<String, Arc<Session>>> {
        let mut hash: usize = 0xcbf29ce484222325_u64 as usize;
        for b in tag.bytes() {
            hash ^= b as usize;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        &self.shards[hash % SHARD_COUNT]
    }

    /// Fetch the session for a tag, creating it on first use.
    /// Untagged jobs share the default (empty-tag) session.
    pub fn get_or_create(&self, tag: &str) -> Arc<Session> {
        let shard = self.shard(tag);
        if let Some(session) = shard.read().get(tag) {
            return Arc::clone(session);
        }
        let mut guard = shard.write();
        Arc::clone(
            guard
                .entry(tag.to_string())
                .or_insert_with(|| Arc::new(Session::new(tag.to_string(), self.persistence))),
        )
    }

    pub fn get(&self, tag: &str) -> Option<Arc<Session>> {
        self.shard(tag).read().get(tag).cloned()
    }

    /// Explicitly destroy a session.
    pub fn close(&self, tag: &str) -> bool {
        self.shard(tag).write().remove(tag).is_some()
    }

    /// Destroy sessions idle past the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, session| session.idle_for() < self.ttl);
            removed += before - guard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a cookie file into the default session's jar.
    pub async fn load_cookie_file(&self, path: &std::path::Path) -> Result<()> {
        let mut jar = CookieJar::new();
        jar.load_from_file(path).await?;
        self.get_or_create("").seed_jar(jar);
        Ok(())
    }

    /// Write the default session's jar back to the cookie file.
    pub async fn save_cookie_file(&self, path: &std::path::Path) -> Result<()> {
        let jar = self.get_or_create("").jar_snapshot(None);
        jar.save_to_file(path).await
    }

    /// Rewrite the cookie file when the default session has accumulated
    /// `flush_every` updates since the last write.
    pub async fn maybe_flush(&self, config: &CookieConfig) -> Result<()> {
        let Some(path) = &config.file else {
            return Ok(());
        };
        let updates = self.get_or_create("").update_count();
        let flushed = self.flushed_updates.load(Ordering::Relaxed);
        if updates.saturating_sub(flushed) >= config.flush_every.max(1) {
            self.save_cookie_file(path).await?;
            self.flushed_updates.store(updates, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Cookie;

    fn map() -> SessionMap {
        SessionMap::new(CookiePersistence::Session, Duration::from_secs(3600))
    }

    #[test]
    fn created_on_first_use_and_shared_after() {
        let sessions = map();
        let a = sessions.get_or_create("crawl-1");
        let b = sessions.get_or_create("crawl-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn close_destroys() {
        let sessions = map();
        sessions.get_or_create("tag");
        assert!(sessions.close("tag"));
        assert!(sessions.get("tag").is_none());
    }

    #[test]
    fn ttl_sweep_removes_idle_sessions() {
        let sessions = SessionMap::new(CookiePersistence::Session, Duration::ZERO);
        sessions.get_or_create("old");
        assert_eq!(sessions.sweep_expired(), 1);
        assert!(sessions.is_empty());
    }

    #[test]
    fn cookie_merge_is_visible_to_next_request() {
        let sessions = map();
        let session = sessions.get_or_create("s");
        session.merge_response_cookies(&["sid=1"], "https://a.test/", None);
        assert_eq!(
            session.cookie_header("https://a.test/", None).as_deref(),
            Some("sid=1")
        );
    }

    #[test]
    fn per_proxy_persistence_separates_jars() {
        let sessions = SessionMap::new(CookiePersistence::PerProxy, Duration::from_secs(60));
        let session = sessions.get_or_create("s");
        session.merge_response_cookies(&["a=1"], "https://a.test/", Some("http://p1:8080"));
        session.merge_response_cookies(&["b=2"], "https://a.test/", Some("http://p2:8080"));
        assert_eq!(
            session.cookie_header("https://a.test/", Some("http://p1:8080")).as_deref(),
            Some("a=1")
        );
        assert_eq!(
            session.cookie_header("https://a.test/", Some("http://p2:8080")).as_deref(),
            Some("b=2")
        );
    }

    #[test]
    fn persistence_none_stores_nothing() {
        let sessions = SessionMap::new(CookiePersistence::None, Duration::from_secs(60));
        let session = sessions.get_or_create("s");
        session.merge_response_cookies(&["a=1"], "https://a.test/", None);
        assert!(session.cookie_header("https://a.test/", None).is_none());
        assert!(session.jar_snapshot(None).is_empty());
    }

    #[test]
    fn pin_rewrite() {
        let sessions = map();
        let session = sessions.get_or_create("s");
        assert!(session.pinned_proxy().is_none());
        session.pin_proxy("http://p1:8080");
        assert_eq!(session.pinned_proxy().as_deref(), Some("http://p1:8080"));
        session.pin_proxy("http://p2:8080");
        assert_eq!(session.pinned_proxy().as_deref(), Some("http://p2:8080"));
    }

    #[test]
    fn seeded_jar_feeds_requests() {
        let sessions = map();
        let session = sessions.get_or_create("");
        let mut jar = CookieJar::new();
        jar.store(Cookie::new("seeded", "1", "a.test"));
        session.seed_jar(jar);
        assert_eq!(
            session.cookie_header("https://a.test/", None).as_deref(),
            Some("seeded=1")
        );
    }
}
