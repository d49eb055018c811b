//! Chapter page resolution
//!
//! The chapter endpoint has changed shape several times, so a request is
//! expanded into every URL variant known to have worked, tried in order.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::engine::CancelHandle;
use crate::error::{CourierError, Result};
use crate::fetch::{is_retryable_status, BackoffPolicy, HttpClient};
use crate::models::{ChapterResolutionRequest, PageAsset, ProxyEndpoint};

const NO_PAGES: &str = "source returned no pages";

/// Builds candidate URLs for a chapter and walks them until one yields pages
#[derive(Debug, Clone)]
pub struct ChapterResolver {
    api_base: String,
    image_base: String,
    policy: BackoffPolicy,
}

impl ChapterResolver {
    /// `image_base` is the mirror relative page paths are joined onto
    pub fn new(api_base: impl Into<String>, image_base: impl Into<String>, policy: BackoffPolicy) -> Self {
        let image_base = image_base.into();
        let image_base = if image_base.ends_with('/') {
            image_base
        } else {
            format!("{}/", image_base)
        };

        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            image_base,
            policy,
        }
    }

    /// Ordered, de-duplicated candidate URLs
    ///
    /// The first pass filters by branch (only when the branch is not the
    /// title's default one), the second pass drops the branch filter.
    pub fn build_candidates(&self, request: &ChapterResolutionRequest) -> Result<Vec<String>> {
        let slug = request.title_slug.trim();
        let chapter_id = request
            .chapter_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let number = request.number.and_then(format_number);

        if slug.is_empty() || (chapter_id.is_none() && number.is_none()) {
            return Err(CourierError::NoCandidates(request.label()));
        }

        let endpoint = join_segments(&self.api_base, &["manga", slug, "chapter"])?;
        let id_endpoint = chapter_id
            .map(|id| join_segments(endpoint.as_str(), &[id]))
            .transpose()?;
        let volume = request.volume.unwrap_or(1).to_string();
        let branch = request
            .branch_id
            .filter(|branch| Some(*branch) != request.default_branch_id)
            .map(|branch| branch.to_string());

        let params = ChapterParams {
            number: number.as_deref(),
            volume: Some(volume.as_str()),
            chapter_id,
        };

        let mut candidates = Vec::new();
        params.extend(&endpoint, id_endpoint.as_ref(), branch.as_deref(), &mut candidates);
        params.extend(&endpoint, id_endpoint.as_ref(), None, &mut candidates);

        // Same path and parameters in another order is the same request
        let mut seen = HashSet::new();
        candidates.retain(|url| seen.insert(candidate_key(url)));
        Ok(candidates.into_iter().map(String::from).collect())
    }

    /// Walk the candidates until one returns a non-empty page list
    ///
    /// Each candidate gets the chapter retry schedule. A non-retryable status
    /// moves on to the next candidate; an unparseable body is retried.
    #[instrument(skip_all, fields(chapter = %request.label()))]
    pub async fn resolve_pages(
        &self,
        client: &dyn HttpClient,
        proxy: Option<&ProxyEndpoint>,
        request: &ChapterResolutionRequest,
        cancel: &CancelHandle,
    ) -> Result<Vec<PageAsset>> {
        let candidates = self.build_candidates(request)?;
        let mut last_error: Option<String> = None;

        for (position, url) in candidates.iter().enumerate() {
            let mut attempt = 1u32;
            let mut saw_429 = false;

            loop {
                if cancel.is_cancelled() {
                    return Err(CourierError::Cancelled);
                }

                let mut status = None;
                let mut retry_after = None;

                match client.get(url, proxy).await {
                    Ok(response) if response.is_success() => {
                        match parse_pages(&response.body, &self.image_base) {
                            Ok(pages) if !pages.is_empty() => {
                                info!(
                                    candidate = position + 1,
                                    of = candidates.len(),
                                    pages = pages.len(),
                                    "Chapter resolved"
                                );
                                return Ok(pages);
                            }
                            Ok(_) => {
                                debug!(url = %url, "Candidate returned an empty page list");
                                last_error = Some(NO_PAGES.to_string());
                                break;
                            }
                            Err(reason) => {
                                last_error = Some(reason);
                            }
                        }
                    }
                    Ok(response) => {
                        let code = response.status.as_u16();
                        last_error = Some(format!("HTTP {}", code));
                        if !is_retryable_status(code) {
                            debug!(url = %url, status = code, "Candidate rejected");
                            break;
                        }
                        saw_429 |= code == 429;
                        status = Some(code);
                        retry_after = response.retry_after().map(str::to_string);
                        if self
                            .policy
                            .exceeds_retry_after_limit(status, retry_after.as_deref())
                        {
                            warn!(url = %url, "Server asked to wait too long, skipping candidate");
                            break;
                        }
                    }
                    Err(e) => {
                        last_error = Some(e.to_string());
                        if !e.is_transient() {
                            break;
                        }
                    }
                }

                if attempt >= self.policy.attempt_budget(saw_429) {
                    break;
                }

                let delay = self
                    .policy
                    .next_delay(attempt, status, retry_after.as_deref());
                warn!(
                    url = %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = last_error.as_deref().unwrap_or_default(),
                    "Retrying chapter request"
                );
                if !cancel.sleep(delay).await {
                    return Err(CourierError::Cancelled);
                }
                attempt += 1;
            }
        }

        Err(CourierError::ResolutionFailed(
            last_error.unwrap_or_else(|| NO_PAGES.to_string()),
        ))
    }
}

struct ChapterParams<'a> {
    number: Option<&'a str>,
    volume: Option<&'a str>,
    chapter_id: Option<&'a str>,
}

impl ChapterParams<'_> {
    fn extend(&self, endpoint: &Url, id_endpoint: Option<&Url>, branch: Option<&str>, out: &mut Vec<Url>) {
        out.push(with_query(
            endpoint,
            &[
                ("number", self.number),
                ("volume", self.volume),
                ("branch_id", branch),
            ],
        ));

        if let (Some(id), Some(id_endpoint)) = (self.chapter_id, id_endpoint) {
            out.push(with_query(
                id_endpoint,
                &[
                    ("branch_id", branch),
                    ("volume", self.volume),
                    ("number", self.number),
                ],
            ));
            out.push(with_query(
                endpoint,
                &[
                    ("chapter_id", Some(id)),
                    ("branch_id", branch),
                    ("volume", self.volume),
                    ("number", self.number),
                ],
            ));
            out.push(with_query(
                endpoint,
                &[
                    ("id", Some(id)),
                    ("branch_id", branch),
                    ("volume", self.volume),
                    ("number", self.number),
                ],
            ));
        }

        out.push(with_query(
            endpoint,
            &[
                ("branch_id", branch),
                ("id", self.chapter_id),
                ("volume", self.volume),
                ("number", self.number),
            ],
        ));
    }
}

/// `base` with percent-encoded path segments appended
fn join_segments(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| CourierError::InvalidRequest(format!("cannot append a path to {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `base?k=v&...` over the present parameters, `base` alone when none are
fn with_query(base: &Url, params: &[(&str, Option<&str>)]) -> Url {
    let present: Vec<(&str, &str)> = params
        .iter()
        .filter_map(|(key, value)| value.filter(|v| !v.is_empty()).map(|v| (*key, v)))
        .collect();

    let mut url = base.clone();
    if !present.is_empty() {
        url.query_pairs_mut().extend_pairs(present);
    }
    url
}

fn candidate_key(url: &Url) -> (String, Vec<(String, String)>) {
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    pairs.sort();
    (url.path().to_string(), pairs)
}

/// Render a chapter number without trailing zeros (`10.50` -> `10.5`)
pub fn format_number(value: f64) -> Option<String> {
    value.is_finite().then(|| format!("{}", value))
}

/// Extract pages from `pages` or `data.pages`
///
/// A body that is not JSON is an error; a JSON body without a page array
/// yields an empty list.
fn parse_pages(body: &[u8], image_base: &str) -> std::result::Result<Vec<PageAsset>, String> {
    let root: Value =
        serde_json::from_slice(body).map_err(|e| format!("unparseable chapter payload: {}", e))?;

    let pages = root
        .get("pages")
        .or_else(|| root.pointer("/data/pages"))
        .and_then(Value::as_array);

    let Some(pages) = pages else {
        return Ok(Vec::new());
    };

    let assets = pages
        .iter()
        .filter_map(|page| {
            let relative = page.get("url").and_then(Value::as_str)?.trim();
            (!relative.is_empty()).then(|| (relative.replace(' ', "%20"), page))
        })
        .enumerate()
        .map(|(i, (relative, page))| PageAsset {
            index: i + 1,
            url: join_image_url(image_base, &relative),
            width: dimension(page, "width"),
            height: dimension(page, "height"),
        })
        .collect();

    Ok(assets)
}

fn join_image_url(image_base: &str, relative: &str) -> String {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        relative.to_string()
    } else {
        format!("{}{}", image_base, relative.trim_start_matches('/'))
    }
}

fn dimension(page: &Value, field: &str) -> Option<u32> {
    page.get(field)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchTuning;
    use crate::fetch::client::mock::{json_body, status, status_with_retry_after, MockClient};
    use crate::fetch::HttpResponse;
    use http::StatusCode;
    use serde_json::json;
    use std::time::Duration;

    const API: &str = "https://api.example/api";
    const IMG: &str = "https://img2.example";

    fn resolver() -> ChapterResolver {
        ChapterResolver::new(API, IMG, BackoffPolicy::for_chapters(&FetchTuning::default()))
    }

    fn endpoint() -> String {
        format!("{}/manga/7965--title/chapter", API)
    }

    fn pages_payload() -> serde_json::Value {
        json!({"data": {"pages": [
            {"url": "/manga/title/ch1/01.jpg", "width": 800, "height": 1200},
            {"url": "//manga/title/ch1/02 b.jpg"},
            {"url": ""},
            {"url": "https://cdn.example/03.jpg"}
        ]}})
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0).as_deref(), Some("10"));
        assert_eq!(format_number(10.50).as_deref(), Some("10.5"));
        assert_eq!(format_number(0.25).as_deref(), Some("0.25"));
        assert_eq!(format_number(f64::NAN), None);
    }

    #[test]
    fn test_candidates_with_branch_and_id() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_chapter_id("123")
            .with_number(10.5)
            .with_branch(5, Some(1));
        let base = endpoint();

        let candidates = resolver().build_candidates(&request).unwrap();
        assert_eq!(
            candidates,
            vec![
                format!("{}?number=10.5&volume=1&branch_id=5", base),
                format!("{}/123?branch_id=5&volume=1&number=10.5", base),
                format!("{}?chapter_id=123&branch_id=5&volume=1&number=10.5", base),
                format!("{}?id=123&branch_id=5&volume=1&number=10.5", base),
                format!("{}?number=10.5&volume=1", base),
                format!("{}/123?volume=1&number=10.5", base),
                format!("{}?chapter_id=123&volume=1&number=10.5", base),
                format!("{}?id=123&volume=1&number=10.5", base),
            ]
        );
    }

    #[test]
    fn test_default_branch_is_not_filtered() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_number(3.0)
            .with_volume(2)
            .with_branch(1, Some(1));

        let candidates = resolver().build_candidates(&request).unwrap();
        assert_eq!(candidates, vec![format!("{}?number=3&volume=2", endpoint())]);
    }

    #[test]
    fn test_reordered_parameters_are_one_candidate() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_chapter_id("123")
            .with_number(3.0)
            .with_volume(2)
            .with_branch(5, None);

        let candidates = resolver().build_candidates(&request).unwrap();
        let keys: HashSet<_> = candidates
            .iter()
            .map(|c| candidate_key(&Url::parse(c).unwrap()))
            .collect();
        assert_eq!(keys.len(), candidates.len());
        assert_eq!(candidates.len(), 8);
    }

    #[test]
    fn test_chapter_id_is_encoded() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_chapter_id("12&x=1 ?")
            .with_number(1.0);

        let candidates = resolver().build_candidates(&request).unwrap();
        for candidate in &candidates {
            let url = Url::parse(candidate).unwrap();
            assert!(url.query_pairs().all(|(key, _)| key != "x"), "{}", candidate);
        }
        assert!(candidates.contains(&format!("{}/12&x=1%20%3F?volume=1&number=1", endpoint())));
        assert!(candidates.contains(&format!(
            "{}?chapter_id=12%26x%3D1+%3F&volume=1&number=1",
            endpoint()
        )));
    }

    #[test]
    fn test_candidates_require_id_or_number() {
        let request = ChapterResolutionRequest::new("7965--title");
        assert!(matches!(
            resolver().build_candidates(&request),
            Err(CourierError::NoCandidates(_))
        ));
    }

    #[test]
    fn test_parse_pages_joins_image_server() {
        let body = pages_payload().to_string();
        let pages = parse_pages(body.as_bytes(), "https://img2.example/").unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].url, "https://img2.example/manga/title/ch1/01.jpg");
        assert_eq!(pages[0].width, Some(800));
        assert_eq!(pages[1].index, 2);
        assert_eq!(pages[1].url, "https://img2.example/manga/title/ch1/02%20b.jpg");
        assert_eq!(pages[2].url, "https://cdn.example/03.jpg");
    }

    #[test]
    fn test_parse_pages_root_form_and_garbage() {
        let root = json!({"pages": [{"url": "a.jpg"}]}).to_string();
        assert_eq!(parse_pages(root.as_bytes(), "https://i/").unwrap().len(), 1);

        let missing = json!({"data": {}}).to_string();
        assert!(parse_pages(missing.as_bytes(), "https://i/").unwrap().is_empty());

        assert!(parse_pages(b"<html>", "https://i/").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_working_candidate_short_circuits() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_chapter_id("123")
            .with_number(4.0);
        let resolver = resolver();
        let candidates = resolver.build_candidates(&request).unwrap();
        assert_eq!(candidates.len(), 4);

        let winner = candidates[1].clone();
        let client = MockClient::new(move |url, _| {
            if url == winner {
                Ok(json_body(pages_payload()))
            } else {
                Ok(status(404))
            }
        });

        let pages = resolver
            .resolve_pages(&client, None, &request, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_page_list_moves_to_next_candidate() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_chapter_id("9")
            .with_number(1.0);
        let client = MockClient::new(|url, _| {
            if url.contains("chapter_id=9") {
                Ok(json_body(pages_payload()))
            } else {
                Ok(json_body(json!({"data": {"pages": []}})))
            }
        });

        let pages = resolver()
            .resolve_pages(&client, None, &request, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_status_is_retried_then_succeeds() {
        let request = ChapterResolutionRequest::new("7965--title").with_number(2.0);
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let client = MockClient::new(move |_, _| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(status_with_retry_after(429, "10"))
            } else {
                Ok(json_body(pages_payload()))
            }
        });

        let started = tokio::time::Instant::now();
        let pages = resolver()
            .resolve_pages(&client, None, &request, &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(pages.len(), 3);
        assert_eq!(client.call_count(), 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_fail_with_last_error() {
        let request = ChapterResolutionRequest::new("7965--title").with_number(2.0);
        let client = MockClient::new(|_, _| Ok(status(503)));

        let err = resolver()
            .resolve_pages(&client, None, &request, &CancelHandle::new())
            .await
            .unwrap_err();

        match err {
            CourierError::ResolutionFailed(reason) => assert_eq!(reason, "HTTP 503"),
            other => panic!("unexpected error: {:?}", other),
        }
        // One candidate, three attempts
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_body_is_retried() {
        let request = ChapterResolutionRequest::new("7965--title").with_number(2.0);
        let client = MockClient::new(|_, _| Ok(HttpResponse::new(StatusCode::OK, "<html>")));

        let err = resolver()
            .resolve_pages(&client, None, &request, &CancelHandle::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CourierError::ResolutionFailed(_)));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_retry_after_skips_candidate() {
        let request = ChapterResolutionRequest::new("7965--title")
            .with_chapter_id("123")
            .with_number(2.0);
        let first = resolver().build_candidates(&request).unwrap()[0].clone();
        let client = MockClient::new(move |url, _| {
            if url == first {
                Ok(status_with_retry_after(429, "600"))
            } else {
                Ok(json_body(pages_payload()))
            }
        });

        let started = tokio::time::Instant::now();
        let pages = resolver()
            .resolve_pages(&client, None, &request, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(client.call_count(), 2);
        assert!(started.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let request = ChapterResolutionRequest::new("7965--title").with_number(2.0);
        let client = MockClient::always_ok(10);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let err = resolver()
            .resolve_pages(&client, None, &request, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Cancelled));
        assert_eq!(client.call_count(), 0);
    }
}
