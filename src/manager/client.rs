//! Typed HTTP wrapper around the media manager's JSON API.
//!
//! One pooled [`reqwest::Client`], retried per [`RetryPolicy`], with
//! read-through caching over [`TtlCache`] for the read endpoints. Every
//! mutating call invalidates whatever cache entries it can affect.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{info, instrument, warn};

use crate::cache::TtlCache;

use super::error::ManagerError;
use super::models::{
    CustomFormatScore, EpisodeFile, HistoryEvent, ManualImportCommand, ManualImportFile,
    QualityProfile, QueueItem, RemoveQueueItemRequest, Series,
};
use super::retry::{self, FailureClass, RetryDecision, RetryPolicy};
use super::score::compute_score;

const QUEUE_TTL: Duration = Duration::from_secs(60);
const CUSTOM_FORMATS_TTL: Duration = Duration::from_secs(300);
const QUALITY_PROFILES_TTL: Duration = Duration::from_secs(300);
const SERIES_TTL: Duration = Duration::from_secs(300);
const HISTORY_TTL: Duration = Duration::from_secs(30);
const EPISODE_FILE_TTL: Duration = Duration::from_secs(60);

/// Maximum history pages fetched per episode. Paired with the 24h cutoff in
/// [`ManagerClient::fetch_history`], this bounds worst-case fetch cost while
/// covering "at least the last 24h" in practice.
const MAX_HISTORY_PAGES: u32 = 5;
const HISTORY_PAGE_SIZE: u32 = 50;
const HISTORY_FRESHNESS_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// Connection and retry parameters for [`ManagerClient::new`].
#[derive(Debug, Clone)]
pub struct ManagerClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub retry_policy: RetryPolicy,
}

impl Default for ManagerClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 20,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Typed, retrying, cache-fronted client for the manager's HTTP API.
///
/// Cheap to clone: the inner `reqwest::Client` and cache are `Arc`-backed.
#[derive(Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry_policy: RetryPolicy,
    cache: Arc<TtlCache<CachedBody>>,
    call_count: Arc<std::sync::atomic::AtomicU64>,
}

/// A cached response body, stored as raw JSON text so one cache type serves
/// every endpoint's differently-shaped payload.
#[derive(Debug, Clone)]
pub(crate) struct CachedBody(String);

impl ManagerClient {
    /// Builds a client from `config`. Fails only if the underlying
    /// `reqwest::Client` cannot be constructed (e.g. an invalid TLS
    /// configuration baked into the build) — not a runtime condition under
    /// normal use.
    #[must_use]
    pub fn new(config: ManagerClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            retry_policy: config.retry_policy,
            cache: Arc::new(TtlCache::new()),
            call_count: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Exposes the read-through cache so the engine can invoke `sweep()`
    /// from its periodic maintenance, and so tests can assert on `stats()`.
    #[must_use]
    pub fn cache(&self) -> &TtlCache<CachedBody> {
        &self.cache
    }

    /// Total HTTP requests sent to the manager so far (each retry attempt
    /// counts separately), for the `/metrics` "manager API calls" counter.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.call_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Performs a GET against `path`, retrying transient failures per
    /// `self.retry_policy`, and returns the raw response body text.
    #[instrument(skip(self), fields(path = path))]
    async fn get_raw(&self, path: &str) -> Result<String, ManagerError> {
        let mut attempt = 1u32;
        loop {
            let result = self.send_once(Method::GET, path, None::<&()>).await;
            match result {
                Ok(body) => return Ok(body),
                Err(err) => {
                    let class = retry::classify_error(&err);
                    let retry_after = retry_after_from(&err);
                    match self.retry_policy.should_retry(class, attempt, retry_after) {
                        RetryDecision::Retry { delay, attempt: next } => {
                            warn!(path, attempt, delay_ms = delay.as_millis() as u64, "retrying manager call");
                            tokio::time::sleep(delay).await;
                            attempt = next;
                        }
                        RetryDecision::DoNotRetry => return Err(err),
                    }
                }
            }
        }
    }

    async fn send_once<B: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<String, ManagerError> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .header("X-Api-Key", &self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        self.call_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let response = request
            .send()
            .await
            .map_err(|err| ManagerError::transient(path, err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .text()
                .await
                .map_err(|err| ManagerError::transient(path, err.to_string()));
        }

        Err(status_to_error(path, status, response_retry_after(&response)))
    }

    /// GETs `path`, serving from cache under `cache_key` when live, and
    /// populating the cache with the fresh body on a miss.
    async fn get_cached<T: DeserializeOwned>(
        &self,
        path: &str,
        cache_key: &str,
        ttl: Duration,
    ) -> Result<T, ManagerError> {
        let (cached, hit) = self.cache.get(cache_key);
        let body = if hit {
            cached.expect("hit implies value").0
        } else {
            let body = self.get_raw(path).await?;
            self.cache.put(cache_key.to_string(), CachedBody(body.clone()), ttl);
            body
        };

        serde_json::from_str(&body).map_err(|err| ManagerError::malformed(path, err.to_string()))
    }

    /// `GET /queue`, reading every page.
    pub async fn fetch_queue(&self) -> Result<Vec<QueueItem>, ManagerError> {
        self.get_cached::<Vec<QueueItem>>("/queue", "queue", QUEUE_TTL).await
    }

    /// `GET /history?episodeId=…`, newest first, bounded to
    /// [`MAX_HISTORY_PAGES`] pages or until the oldest event on a page is
    /// older than [`HISTORY_FRESHNESS_WINDOW`], whichever comes first.
    #[instrument(skip(self))]
    pub async fn fetch_history(&self, episode_id: i64) -> Result<Vec<HistoryEvent>, ManagerError> {
        let cache_key = format!("history/episode/{episode_id}");
        let (cached, hit) = self.cache.get(&cache_key);
        if hit {
            let body = cached.expect("hit implies value").0;
            return serde_json::from_str(&body)
                .map_err(|err| ManagerError::malformed(&cache_key, err.to_string()));
        }

        let mut events = Vec::new();
        let cutoff = chrono::Utc::now() - HISTORY_FRESHNESS_WINDOW;

        for page in 1..=MAX_HISTORY_PAGES {
            let path = format!(
                "/history?episodeId={episode_id}&page={page}&pageSize={HISTORY_PAGE_SIZE}"
            );
            let body = self.get_raw(&path).await?;
            let page_events: Vec<HistoryEvent> = serde_json::from_str(&body)
                .map_err(|err| ManagerError::malformed(&path, err.to_string()))?;

            if page_events.is_empty() {
                break;
            }
            let oldest_on_page = page_events.iter().map(|e| e.date).min();
            events.extend(page_events);

            if oldest_on_page.is_some_and(|oldest| oldest < cutoff) {
                break;
            }
        }

        let serialized = serde_json::to_string(&events)
            .map_err(|err| ManagerError::malformed(&cache_key, err.to_string()))?;
        self.cache.put(cache_key, CachedBody(serialized), HISTORY_TTL);

        Ok(events)
    }

    /// `GET /episodefile/{episodeId}`, returning `None` on a 404.
    #[instrument(skip(self))]
    pub async fn fetch_episode_file(
        &self,
        episode_id: i64,
    ) -> Result<Option<EpisodeFile>, ManagerError> {
        let path = format!("/episodefile/{episode_id}");
        let cache_key = format!("episode_file/{episode_id}");

        match self.get_cached::<EpisodeFile>(&path, &cache_key, EPISODE_FILE_TTL).await {
            Ok(file) => Ok(Some(file)),
            Err(ManagerError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `GET /customformat`.
    pub async fn fetch_custom_formats(&self) -> Result<Vec<CustomFormatScore>, ManagerError> {
        self.get_cached("/customformat", "custom_formats", CUSTOM_FORMATS_TTL).await
    }

    /// `GET /qualityprofile`.
    pub async fn fetch_quality_profiles(&self) -> Result<Vec<QualityProfile>, ManagerError> {
        self.get_cached("/qualityprofile", "quality_profiles", QUALITY_PROFILES_TTL).await
    }

    /// `GET /series/{id}`.
    pub async fn fetch_series(&self, series_id: i64) -> Result<Series, ManagerError> {
        let path = format!("/series/{series_id}");
        let cache_key = format!("series_by_id/{series_id}");
        self.get_cached(&path, &cache_key, SERIES_TTL).await
    }

    /// Sums `custom_formats` against `profile`'s configured scores. Unknown
    /// formats contribute zero; see [`compute_score`].
    #[must_use]
    pub fn score_against_profile(
        profile: &QualityProfile,
        custom_formats: &BTreeSet<String>,
    ) -> i64 {
        compute_score(profile, custom_formats)
    }

    /// Looks up a quality profile by id from the cached catalog.
    #[instrument(skip(self))]
    pub async fn quality_profile_by_id(&self, id: i64) -> Result<QualityProfile, ManagerError> {
        let profiles = self.fetch_quality_profiles().await?;
        profiles
            .into_iter()
            .find(|profile| profile.id == id)
            .ok_or_else(|| ManagerError::not_found(format!("quality_profile/{id}")))
    }

    /// Resolves `series_id` to its currently configured quality profile
    /// (spec.md §4.2 "resolve series → quality profile").
    #[instrument(skip(self))]
    pub async fn resolve_quality_profile(&self, series_id: i64) -> Result<QualityProfile, ManagerError> {
        let series = self.fetch_series(series_id).await?;
        self.quality_profile_by_id(series.quality_profile_id).await
    }

    /// `DELETE /queue/{id}?blocklist=…&removeFromClient=true`. Invalidates
    /// the `queue` cache entry on success. A 404 means the item was already
    /// gone before this call landed; spec.md §7 treats that race as a
    /// `Conflict`, which is a success from the caller's point of view.
    #[instrument(skip(self))]
    pub async fn remove_queue_item(
        &self,
        request: RemoveQueueItemRequest,
    ) -> Result<(), ManagerError> {
        let path = format!(
            "/queue/{}?blocklist={}&removeFromClient=true",
            request.id, request.block_release
        );
        match self.send_once::<()>(Method::DELETE, &path, None).await {
            Ok(()) => {
                info!(queue_item_id = request.id, block_release = request.block_release, "removed queue item");
            }
            Err(ManagerError::NotFound { .. }) => {
                let conflict = ManagerError::conflict(path.clone());
                info!(queue_item_id = request.id, error = %conflict, "treating as success");
            }
            Err(err) => return Err(err),
        }
        self.cache.invalidate("queue");
        Ok(())
    }

    /// `POST /command` with a `ManualImport` body. Invalidates `queue` and
    /// the affected `history/episode/*` / `episode_file/*` entries for each
    /// episode touched by `command.files`.
    ///
    /// Refuses to send the request at all if any file is missing its path
    /// or episode ids (spec.md §6: "refuses to mutate if a required
    /// identifier is missing").
    #[instrument(skip(self, command))]
    pub async fn manual_import(&self, command: ManualImportCommand) -> Result<(), ManagerError> {
        if let Some(bad) = command
            .files
            .iter()
            .find(|f| f.path.trim().is_empty() || f.episode_ids.is_empty())
        {
            return Err(ManagerError::malformed(
                "/command",
                format!("manual import file missing required identifier: {bad:?}"),
            ));
        }

        let episode_ids: Vec<i64> =
            command.files.iter().flat_map(|f: &ManualImportFile| f.episode_ids.iter().copied()).collect();

        self.send_once(Method::POST, "/command", Some(&command)).await?;

        self.cache.invalidate("queue");
        for episode_id in episode_ids {
            self.cache.invalidate(&format!("history/episode/{episode_id}"));
            self.cache.invalidate(&format!("episode_file/{episode_id}"));
        }
        info!("submitted manual import command");
        Ok(())
    }
}

fn retry_after_from(error: &ManagerError) -> Option<Duration> {
    match error {
        ManagerError::Transient { retry_after, .. } => *retry_after,
        _ => None,
    }
}

/// Extracts and parses the `Retry-After` header, if present, into a
/// `Duration` up front so callers never need to re-parse prose.
fn response_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(retry::parse_retry_after)
}

fn status_to_error(path: &str, status: StatusCode, retry_after: Option<Duration>) -> ManagerError {
    match status.as_u16() {
        404 => ManagerError::not_found(path),
        401 | 403 => ManagerError::unauthorized(path),
        429 => {
            let detail = retry_after
                .map_or_else(|| "rate limited".to_string(), |delay| format!("rate limited, retry-after {}s", delay.as_secs()));
            ManagerError::rate_limited(path, detail, retry_after)
        }
        500..=599 => ManagerError::transient(path, format!("HTTP {status}")),
        _ => ManagerError::permanent(path, status.as_u16()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(base_url: String) -> ManagerClient {
        ManagerClient::new(ManagerClientConfig {
            base_url,
            api_key: "test-key".into(),
            timeout: Duration::from_secs(5),
            pool_max_idle_per_host: 4,
            retry_policy: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(20), 2.0),
        })
    }

    #[tokio::test]
    async fn fetch_queue_sends_api_key_header_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .and(header("X-Api-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let first = client.fetch_queue().await.unwrap();
        let second = client.fetch_queue().await.unwrap();

        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(client.cache().stats().hits, 1);
        // Only the first call reached the wire; the second was a cache hit.
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let result = client.fetch_queue().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn all_retries_exhausted_surfaces_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let result = client.fetch_queue().await;
        assert!(matches!(result, Err(ManagerError::Transient { .. })));
    }

    #[tokio::test]
    async fn not_found_episode_file_returns_none_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/episodefile/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let result = client.fetch_episode_file(42).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unauthorized_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let result = client.fetch_queue().await;
        assert!(matches!(result, Err(ManagerError::Unauthorized { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_429_honors_server_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        // base_delay=1ms caps the computed backoff far below the 2s the
        // server asked for, so only the honored Retry-After explains the gap.
        let client = client_for(server.uri());
        let start = tokio::time::Instant::now();
        let result = client.fetch_queue().await;
        assert!(result.is_ok());
        assert!(tokio::time::Instant::now() - start >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn remove_queue_item_invalidates_queue_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/queue/7"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        client.fetch_queue().await.unwrap();
        assert!(client.cache().contains("queue"));

        client
            .remove_queue_item(RemoveQueueItemRequest { id: 7, block_release: true })
            .await
            .unwrap();

        assert!(!client.cache().contains("queue"));
    }

    #[tokio::test]
    async fn manual_import_invalidates_affected_episode_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/command"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        client.cache().put("history/episode/42".to_string(), CachedBody("[]".into()), Duration::from_secs(60));
        client.cache().put("episode_file/42".to_string(), CachedBody("{}".into()), Duration::from_secs(60));

        let command = ManualImportCommand::new(vec![ManualImportFile {
            path: "/downloads/show.mkv".into(),
            episode_ids: vec![42],
            quality_profile_id: 1,
            custom_formats: vec!["HDR".into()],
        }]);
        client.manual_import(command).await.unwrap();

        assert!(!client.cache().contains("history/episode/42"));
        assert!(!client.cache().contains("episode_file/42"));
    }

    #[tokio::test]
    async fn remove_queue_item_already_gone_is_treated_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/queue/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let result = client
            .remove_queue_item(RemoveQueueItemRequest { id: 7, block_release: true })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn manual_import_refuses_to_send_with_missing_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/command"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let command = ManualImportCommand::new(vec![ManualImportFile {
            path: String::new(),
            episode_ids: vec![42],
            quality_profile_id: 1,
            custom_formats: vec![],
        }]);

        let result = client.manual_import(command).await;
        assert!(matches!(result, Err(ManagerError::Malformed { .. })));
    }

    #[tokio::test]
    async fn manual_import_refuses_to_send_with_no_episode_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/command"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(server.uri());
        let command = ManualImportCommand::new(vec![ManualImportFile {
            path: "/downloads/show.mkv".into(),
            episode_ids: vec![],
            quality_profile_id: 1,
            custom_formats: vec![],
        }]);

        let result = client.manual_import(command).await;
        assert!(matches!(result, Err(ManagerError::Malformed { .. })));
    }
}
