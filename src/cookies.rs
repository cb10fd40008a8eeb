//! Persistent cookie jar backing the HTTP client.
//!
//! One jar is shared by every request the agent makes and is flushed to
//! `DATA_DIR/cookies.jar` on shutdown and after credential changes. The
//! on-disk format is the cookie_store JSON serialization.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use cookie_store::{CookieStore, RawCookie};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{AgentError, Result};

pub struct CookieJar {
    store: Mutex<CookieStore>,
    path: PathBuf,
}

pub type SharedJar = Arc<CookieJar>;

impl CookieJar {
    /// Load the jar from disk; a missing or unreadable file starts empty.
    pub fn load(path: PathBuf) -> SharedJar {
        let store = if path.exists() {
            match File::open(&path)
                .map_err(|e| e.to_string())
                .and_then(|f| {
                    CookieStore::load_json(BufReader::new(f)).map_err(|e| e.to_string())
                }) {
                Ok(store) => {
                    tracing::debug!("loaded {} cookies from {}", store.iter_any().count(), path.display());
                    store
                }
                Err(e) => {
                    tracing::warn!("could not load cookie jar, starting fresh: {e}");
                    CookieStore::default()
                }
            }
        } else {
            CookieStore::default()
        };
        Arc::new(Self {
            store: Mutex::new(store),
            path,
        })
    }

    /// Flush the jar to disk.
    pub async fn save(&self) -> Result<()> {
        let store = self.store.lock().await;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let file = File::create(&self.path)
            .map_err(|e| AgentError::Config(format!("cannot write {}: {e}", self.path.display())))?;
        let mut writer = BufWriter::new(file);
        store
            .save_json(&mut writer)
            .map_err(|e| AgentError::Config(format!("cannot serialize cookie jar: {e}")))?;
        Ok(())
    }

    /// Read one cookie value by origin and name.
    pub async fn get(&self, url: &Url, name: &str) -> Option<String> {
        let store = self.store.lock().await;
        store
            .get(url.domain()?, "/", name)
            .map(|cookie| cookie.value().to_string())
    }

    /// Insert or overwrite one cookie.
    pub async fn set(&self, url: &Url, name: &str, value: &str) -> Result<()> {
        let cookie = RawCookie::build((name.to_string(), value.to_string()))
            .domain(url.domain().unwrap_or("twitch.tv").to_string())
            .path("/")
            .build();
        let mut store = self.store.lock().await;
        store
            .insert_raw(&cookie, url)
            .map_err(|e| AgentError::Invariant(format!("cookie insert failed: {e}")))?;
        Ok(())
    }

    /// `Cookie:` header value for a request to `url`, or None when the jar
    /// has nothing matching.
    pub async fn header_for(&self, url: &Url) -> Option<String> {
        let store = self.store.lock().await;
        let pairs: Vec<String> = store
            .matches(url)
            .into_iter()
            .map(|c| format!("{}={}", c.name(), c.value()))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Record every `Set-Cookie` from a response.
    pub async fn store_response_cookies(&self, url: &Url, headers: &reqwest::header::HeaderMap) {
        let mut store = self.store.lock().await;
        for value in headers.get_all(reqwest::header::SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                if let Ok(cookie) = RawCookie::parse(raw.to_string()) {
                    let _ = store.insert_raw(&cookie, url);
                }
            }
        }
    }

    /// Drop every cookie (logout / invalid credentials).
    pub async fn clear(&self) {
        let mut store = self.store.lock().await;
        *store = CookieStore::default();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_jar(name: &str) -> SharedJar {
        let path = std::env::temp_dir().join(format!("agent_test_{name}.jar"));
        let _ = std::fs::remove_file(&path);
        CookieJar::load(path)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let jar = temp_jar("roundtrip");
        let url = Url::parse("https://www.twitch.tv/").unwrap();
        jar.set(&url, "unique_id", "abc123").await.unwrap();
        assert_eq!(jar.get(&url, "unique_id").await.as_deref(), Some("abc123"));
        assert!(jar.get(&url, "missing").await.is_none());
    }

    #[tokio::test]
    async fn test_header_for_joins_cookies() {
        let jar = temp_jar("header");
        let url = Url::parse("https://www.twitch.tv/").unwrap();
        jar.set(&url, "a", "1").await.unwrap();
        jar.set(&url, "b", "2").await.unwrap();
        let header = jar.header_for(&url).await.unwrap();
        assert!(header.contains("a=1"));
        assert!(header.contains("b=2"));
        assert!(header.contains("; "));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let path = std::env::temp_dir().join("agent_test_persist.jar");
        let _ = std::fs::remove_file(&path);

        let jar = CookieJar::load(path.clone());
        let url = Url::parse("https://www.twitch.tv/").unwrap();
        jar.set(&url, "auth-token", "tok_value").await.unwrap();
        jar.save().await.unwrap();

        let reloaded = CookieJar::load(path.clone());
        assert_eq!(
            reloaded.get(&url, "auth-token").await.as_deref(),
            Some("tok_value")
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_clear_empties_jar() {
        let jar = temp_jar("clear");
        let url = Url::parse("https://www.twitch.tv/").unwrap();
        jar.set(&url, "a", "1").await.unwrap();
        jar.clear().await;
        assert!(jar.get(&url, "a").await.is_none());
        assert!(jar.header_for(&url).await.is_none());
    }
}
