use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use http::{HeaderMap, Method};

static AUTH_GENERATION: AtomicU32 = AtomicU32::new(0);

/// Bump the global credentials epoch. Cached negative lookups made under an
/// older epoch are retried on next access; positive entries stay valid.
pub fn auth_parameters_changed() {
    AUTH_GENERATION.fetch_add(1, Ordering::Release);
}

pub(crate) fn auth_generation() -> u32 {
    AUTH_GENERATION.load(Ordering::Acquire)
}

/// Outcome of [`AuthProvider::can_restart_on_error`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartDecision {
    /// Re-issue the request from scratch (the provider reconfigured itself,
    /// e.g. switched region or refreshed a token).
    pub restart: bool,
    /// Publish the provider's parameters process-wide so new providers for
    /// the same scope start pre-configured.
    pub publish_params: bool,
}

/// Pluggable credentials for a backend. Implementations sign requests and
/// may react to error bodies (wrong-region responses, expired tokens).
pub trait AuthProvider: Send + Sync {
    /// Canonical URL for the object, without query-string credentials.
    fn url(&self) -> String;

    /// Extra headers for a request with the given verb.
    fn build_headers(&self, _verb: &Method, _existing: &HeaderMap) -> HeaderMap {
        HeaderMap::new()
    }

    /// Whether the transport may follow redirects on its own. Signed
    /// requests usually need to re-sign against the redirect target instead.
    fn allow_automatic_redirection(&self) -> bool {
        true
    }

    /// Inspect an error body and headers; decide whether a fresh attempt
    /// with updated provider state can succeed.
    fn can_restart_on_error(
        &self,
        _body: &str,
        _headers: &str,
        _set_error: bool,
    ) -> RestartDecision {
        RestartDecision::default()
    }

    /// Acquire credentials after a 401. Returns true when a retry is worth it.
    fn authenticate(&self) -> bool {
        false
    }

    /// Issue a ranged GET instead of HEAD for size discovery. Some
    /// S3-compatible backends deny HEAD on public objects.
    fn use_limit_range_get(&self) -> bool {
        false
    }

    /// Parameters to publish when `can_restart_on_error` asks for it.
    fn export_params(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

fn shared_map() -> &'static Mutex<HashMap<String, HashMap<String, String>>> {
    static SHARED: OnceLock<Mutex<HashMap<String, HashMap<String, String>>>> = OnceLock::new();
    SHARED.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record a provider's parameters (endpoint, region, …) under a scope key so
/// later providers can pick them up.
pub fn publish_shared_params(scope: &str, params: HashMap<String, String>) {
    if params.is_empty() {
        return;
    }
    let mut map = lock(shared_map());
    map.insert(scope.to_string(), params);
}

pub fn shared_params(scope: &str) -> Option<HashMap<String, String>> {
    lock(shared_map()).get(scope).cloned()
}

pub fn clear_shared_params() {
    lock(shared_map()).clear();
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
