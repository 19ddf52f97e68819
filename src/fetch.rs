use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use tracing::debug;

use crate::record::{self, Record};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("gradscrape/", env!("CARGO_PKG_VERSION"));

/// One profile entry enumerated from a listing page. `target` is opaque to
/// the driver; the fetcher that produced it knows how to resolve it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileHandle {
    pub index: usize,
    pub target: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timeout fetching {0}")]
    Timeout(String),
    #[error("http {status} for {url}")]
    Status { status: u16, url: String },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("unrecognized page structure: {0}")]
    Structure(String),
}

impl FetchError {
    /// Transient failures are worth a retry; structural ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Structure(_) => false,
        }
    }
}

/// Loads one listing page at a time and enumerates its profiles.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn load(&mut self, page: u32) -> Result<(), FetchError>;

    /// Profiles on the currently loaded page. Empty after loading a page
    /// past the end of the listing.
    fn listing(&self) -> Vec<ProfileHandle>;
}

/// Resolves one profile handle into a record. Partial records are valid;
/// only the id is required.
#[async_trait]
pub trait ProfileExtractor: Send + Sync {
    async fn extract(&mut self, handle: &ProfileHandle) -> Result<Record, FetchError>;
}

/// What the driver actually holds: one session implementing both sides.
pub trait PageSource: PageFetcher + ProfileExtractor {}
impl<T: PageFetcher + ProfileExtractor> PageSource for T {}

// ── HTTP implementation ──

static LISTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href="(?:https?://[^"/]+)?/result/(\d+)""#).unwrap()
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(\.\d+)?%").unwrap());

/// Field labels probed on every profile page, uniformly: each one is
/// attempted, a miss leaves the field None, and no single field can fail
/// the record.
const FIELD_LABELS: [&str; 13] = [
    "Acceptance Rate",
    "Institution",
    "Program",
    "Degree Type",
    "Degree's Country of Origin",
    "Decision",
    "Notification",
    "Undergrad GPA",
    "GRE General",
    "GRE Verbal",
    "Analytical Writing",
    "Notes",
    "Timeline",
];

/// reqwest-backed survey-site session: listing pages at `{base}?page=N`,
/// profile detail pages linked as `/result/{id}`.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    /// Politeness jitter range in seconds between requests.
    delay: (f64, f64),
    listing: Vec<ProfileHandle>,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            delay: (0.5, 2.0),
            listing: Vec::new(),
        })
    }

    fn page_url(&self, page: u32) -> String {
        if page == 1 {
            self.base_url.clone()
        } else {
            format!("{}?page={}", self.base_url, page)
        }
    }

    async fn polite_wait(&self) {
        let secs = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.delay.0..self.delay.1)
        };
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(url.to_string())
            } else {
                FetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        response.text().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn load(&mut self, page: u32) -> Result<(), FetchError> {
        self.polite_wait().await;
        let url = self.page_url(page);
        let body = match self.get(&url).await {
            Ok(body) => body,
            // Past-the-end pages 404; an empty listing lets the empty-page
            // budget terminate the crawl instead of failing the range.
            Err(FetchError::Status { status: 404, .. }) => {
                debug!(page, "listing page not found; treating as empty");
                self.listing.clear();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.listing = parse_listing(&body, &self.base_url)?;
        debug!(page, profiles = self.listing.len(), "loaded listing page");
        Ok(())
    }

    fn listing(&self) -> Vec<ProfileHandle> {
        self.listing.clone()
    }
}

#[async_trait]
impl ProfileExtractor for HttpFetcher {
    async fn extract(&mut self, handle: &ProfileHandle) -> Result<Record, FetchError> {
        self.polite_wait().await;
        let body = self.get(&handle.target).await?;
        if !body.contains("<dt") {
            return Err(FetchError::Structure(format!(
                "no detail fields at {}",
                handle.target
            )));
        }

        let mut record = Record::with_id(id_from_target(&handle.target));
        for label in FIELD_LABELS {
            if let Some(value) = extract_field(&body, label) {
                apply_field(&mut record, label, &value);
            }
        }
        Ok(record)
    }
}

/// Enumerate profile detail links in listing order, deduplicated (the same
/// profile can be linked more than once per row).
fn parse_listing(body: &str, base_url: &str) -> Result<Vec<ProfileHandle>, FetchError> {
    let origin = reqwest::Url::parse(base_url)
        .map_err(|e| FetchError::Structure(format!("bad base url {base_url}: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    let mut handles = Vec::new();
    for caps in LISTING_RE.captures_iter(body) {
        let id = &caps[1];
        if !seen.insert(id.to_string()) {
            continue;
        }
        let target = origin
            .join(&format!("/result/{id}"))
            .map_err(|e| FetchError::Structure(format!("bad profile link: {e}")))?;
        handles.push(ProfileHandle {
            index: handles.len(),
            target: target.to_string(),
        });
    }
    Ok(handles)
}

fn id_from_target(target: &str) -> String {
    target
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Value of the `<dd>` following the `<dt>` whose text starts with `label`,
/// tags stripped. None when the page doesn't carry the field.
fn extract_field(body: &str, label: &str) -> Option<String> {
    let pattern = format!(
        r"(?is)<dt[^>]*>\s*{}[^<]*</dt>\s*<dd[^>]*>(.*?)</dd>",
        regex::escape(label)
    );
    let re = Regex::new(&pattern).ok()?;
    let raw = re.captures(body)?.get(1)?.as_str();
    let text = unescape(TAG_RE.replace_all(raw, " ").trim());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Route one extracted label/value pair into the record, applying the
/// field's cleaning rule. Unknown labels are ignored.
fn apply_field(record: &mut Record, label: &str, value: &str) {
    match label {
        "Acceptance Rate" => {
            let rate = PERCENT_RE
                .find(value)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| value.to_string());
            record.acceptance_rate = Some(rate);
        }
        "Institution" => record.institution = Some(value.to_string()),
        "Program" => record.program = Some(value.to_string()),
        "Degree Type" => record.degree_type = Some(value.to_string()),
        "Degree's Country of Origin" => record.degree_country = Some(value.to_string()),
        "Decision" => record.decision = Some(value.to_string()),
        "Notification" => {
            let (date, method) = record::split_notification(value);
            record.notification_date = date;
            record.notification_method = method;
        }
        "Undergrad GPA" => record.undergrad_gpa = record::clean_gpa(value),
        "GRE General" => record.gre_general = record::clean_gre(value),
        "GRE Verbal" => record.gre_verbal = record::clean_gre(value),
        "Analytical Writing" => record.analytical_writing = record::clean_writing(value),
        "Notes" => record.notes = Some(value.to_string()),
        "Timeline" => {
            // "Event — Date" on one line; keep the whole text as the event
            // when no separator is present.
            match value.split_once(" — ") {
                Some((event, date)) => {
                    record.timeline_event = Some(event.trim().to_string());
                    record.timeline_date = Some(date.trim().to_string());
                }
                None => record.timeline_event = Some(value.to_string()),
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <tr><a href="/result/111">See More</a></tr>
        <tr><a href="https://example.com/result/222">See More</a>
            <a href="/result/222">See More</a></tr>
        <tr><a href="/survey/?page=2">Next</a></tr>
    "#;

    #[test]
    fn listing_extracts_unique_profiles_in_order() {
        let handles = parse_listing(LISTING, "https://example.com/survey/").unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].target, "https://example.com/result/111");
        assert_eq!(handles[1].target, "https://example.com/result/222");
        assert_eq!(handles[1].index, 1);
    }

    #[test]
    fn detail_fields_are_parsed_and_cleaned() {
        let body = r#"
            <dl>
              <dt class="label">Institution</dt><dd><span>MIT</span></dd>
              <dt>Program</dt><dd>Computer Science</dd>
              <dt>Decision</dt><dd>Accepted</dd>
              <dt>Notification</dt><dd>on 15 Mar 2025 via E-mail</dd>
              <dt>Undergrad GPA</dt><dd>0.00</dd>
              <dt>GRE General</dt><dd>328</dd>
              <dt>Acceptance Rate</dt><dd>about 12.5% of applicants</dd>
            </dl>
        "#;
        let mut record = Record::with_id("9");
        for label in FIELD_LABELS {
            if let Some(v) = extract_field(body, label) {
                apply_field(&mut record, label, &v);
            }
        }
        assert_eq!(record.institution.as_deref(), Some("MIT"));
        assert_eq!(record.program.as_deref(), Some("Computer Science"));
        assert_eq!(record.decision.as_deref(), Some("Accepted"));
        assert_eq!(record.notification_date.as_deref(), Some("15 Mar 2025"));
        assert_eq!(record.notification_method.as_deref(), Some("via E-mail"));
        assert_eq!(record.undergrad_gpa, None, "placeholder GPA cleaned out");
        assert_eq!(record.gre_general, Some(328));
        assert_eq!(record.acceptance_rate.as_deref(), Some("12.5%"));
        assert_eq!(record.gre_verbal, None);
    }

    #[test]
    fn id_from_target_takes_last_segment() {
        assert_eq!(id_from_target("https://x.test/result/445"), "445");
        assert_eq!(id_from_target("https://x.test/result/445/"), "445");
    }

    #[test]
    fn transient_classification() {
        assert!(FetchError::Timeout("u".into()).is_transient());
        assert!(FetchError::Status { status: 503, url: "u".into() }.is_transient());
        assert!(FetchError::Status { status: 429, url: "u".into() }.is_transient());
        assert!(!FetchError::Status { status: 403, url: "u".into() }.is_transient());
        assert!(!FetchError::Structure("bad".into()).is_transient());
    }
}
