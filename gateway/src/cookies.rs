use std::{
    fmt,
    sync::{MutexGuard, PoisonError},
};

use cookie_store::{CookieDomain, CookieStore};
use reqwest::{cookie::CookieStore as ClientCookieStore, header::HeaderValue, Url};
use reqwest_cookie_store::CookieStoreMutex;
use tracing::debug;

/// Cookie storage shared by every request the gateway sends.
///
/// Plugged into reqwest as its cookie provider, and reachable directly so the CSRF
/// cache can clear cookies on a forced refresh.
pub struct CookieJar {
    store: CookieStoreMutex,
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            store: CookieStoreMutex::new(CookieStore::default()),
        }
    }

    /// Store a raw `Set-Cookie` value as if it came from `url`.
    pub fn store(&self, set_cookie: &str, url: &Url) {
        if let Err(e) = self.lock().parse(set_cookie, url) {
            debug!(error = %e, %url, "rejected Set-Cookie");
        }
    }

    /// Value of the named cookie scoped to `host`.
    pub fn get(&self, name: &str, host: &str) -> Option<String> {
        self.lock()
            .iter_unexpired()
            .find(|c| c.name() == name && scoped_to(&c.domain, host))
            .map(|c| c.value().to_string())
    }

    /// Drop every cookie called `name` scoped to `host`, whatever its path.
    /// Returns whether anything was removed.
    pub fn remove(&self, name: &str, host: &str) -> bool {
        let mut store = self.lock();
        let targets: Vec<(String, String)> = store
            .iter_any()
            .filter(|c| c.name() == name && scoped_to(&c.domain, host))
            .map(|c| (String::from(&c.domain), String::from(&c.path)))
            .collect();

        let mut removed = false;
        for (domain, path) in targets {
            removed |= store.remove(&domain, &path, name).is_some();
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CookieStore> {
        // A poisoned jar still holds valid cookies.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieJar").field("len", &self.len()).finish()
    }
}

fn scoped_to(domain: &CookieDomain, host: &str) -> bool {
    match domain {
        CookieDomain::HostOnly(d) | CookieDomain::Suffix(d) => d.eq_ignore_ascii_case(host),
        CookieDomain::NotPresent | CookieDomain::Empty => false,
    }
}

impl ClientCookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        self.store.set_cookies(cookie_headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.store.cookies(url)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_round_trips_a_cookie_to_the_same_host() {
        let jar = CookieJar::new();
        jar.store("_csrf=abc; Path=/; HttpOnly", &url("http://api.local/api/csrf-token"));

        let header = jar.cookies(&url("http://api.local/clientes/add")).unwrap();
        assert_eq!(header.to_str().unwrap(), "_csrf=abc");
        assert!(jar.cookies(&url("http://other.local/")).is_none());
    }

    #[test]
    fn test_domain_cookies_reach_subdomains() {
        let jar = CookieJar::new();
        jar.store("XSRF-TOKEN=1; Domain=.example.com", &url("https://api.example.com/"));

        assert!(jar.cookies(&url("https://app.example.com/")).is_some());
        assert_eq!(jar.get("XSRF-TOKEN", "example.com").as_deref(), Some("1"));
    }

    #[test]
    fn test_foreign_host_cannot_set_backend_cookie() {
        let jar = CookieJar::new();
        jar.store("_csrf=evil; Domain=api.local", &url("http://evil.example/"));

        assert!(jar.cookies(&url("http://api.local/")).is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn test_newer_cookie_replaces_older_one() {
        let jar = CookieJar::new();
        jar.store("_csrf=one", &url("http://api.local/"));
        jar.store("_csrf=two", &url("http://api.local/"));

        assert_eq!(jar.len(), 1);
        assert_eq!(jar.get("_csrf", "api.local").as_deref(), Some("two"));
    }

    #[test]
    fn test_zero_max_age_deletes() {
        let jar = CookieJar::new();
        jar.store("_csrf=one", &url("http://api.local/"));
        jar.store("_csrf=; Max-Age=0", &url("http://api.local/"));

        assert!(jar.is_empty());
    }

    #[test]
    fn test_max_age_counts_from_when_the_cookie_was_set() {
        let jar = CookieJar::new();
        jar.store("_csrf=old; Max-Age=1", &url("http://api.local/"));
        assert!(jar.cookies(&url("http://api.local/")).is_some());

        std::thread::sleep(Duration::from_millis(2100));

        assert!(jar.cookies(&url("http://api.local/")).is_none());
        assert_eq!(jar.get("_csrf", "api.local"), None);
    }

    #[test]
    fn test_remove_is_scoped_to_host() {
        let jar = CookieJar::new();
        jar.store("_csrf=a", &url("http://api.local/"));
        jar.store("_csrf=b", &url("http://app.local/"));

        assert!(jar.remove("_csrf", "api.local"));
        assert!(!jar.remove("_csrf", "api.local"));
        assert_eq!(jar.get("_csrf", "app.local").as_deref(), Some("b"));
    }

    #[test]
    fn test_remove_covers_every_path() {
        let jar = CookieJar::new();
        jar.store("_csrf=root; Path=/", &url("http://api.local/"));
        jar.store("_csrf=nested; Path=/api", &url("http://api.local/api/csrf-token"));

        assert!(jar.remove("_csrf", "api.local"));
        assert!(jar.is_empty());
    }

    #[test]
    fn test_secure_cookies_skip_plain_http() {
        let jar = CookieJar::new();
        jar.store("sid=1; Secure", &url("https://api.local/"));

        assert!(jar.cookies(&url("http://api.local/")).is_none());
        assert!(jar.cookies(&url("https://api.local/")).is_some());
    }
}
