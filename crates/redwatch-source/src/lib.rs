//! Record-source contract plus the red-notice listing extractor.
//!
//! The pipeline only requires a [`NoticeSource`]: something that yields a
//! finite, possibly-empty batch of raw notices per harvesting cycle.
//! [`HtmlNoticeSource`] is the production implementation, walking a
//! paginated public listing with a hard page cap and an ordered list of
//! CSS-selector fallbacks per field.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redwatch_core::RawNotice;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "redwatch-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("listing fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// A producer of raw notice batches. One call is one bounded harvesting
/// attempt; an empty batch is a valid result.
#[async_trait]
pub trait NoticeSource: Send + Sync {
    async fn collect(&self) -> Result<Vec<RawNotice>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct HtmlSourceConfig {
    pub base_url: String,
    /// Hard cap on the pagination walk so one cycle never does unbounded work.
    pub max_pages: usize,
    pub user_agent: String,
    pub timeout: Duration,
}

impl HtmlSourceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SOURCE_BASE_URL").unwrap_or(defaults.base_url),
            max_pages: std::env::var("SOURCE_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_pages),
            user_agent: std::env::var("SOURCE_USER_AGENT").unwrap_or(defaults.user_agent),
            timeout: defaults.timeout,
        }
    }
}

impl Default for HtmlSourceConfig {
    fn default() -> Self {
        Self {
            base_url:
                "https://www.interpol.int/How-we-work/Notices/Red-Notices/View-Red-Notices/"
                    .to_string(),
            max_pages: 50,
            user_agent: "redwatch/0.1".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Fetches listing pages over HTTP and extracts notices from the markup.
pub struct HtmlNoticeSource {
    config: HtmlSourceConfig,
    client: reqwest::Client,
}

impl HtmlNoticeSource {
    pub fn new(config: HtmlSourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { config, client })
    }

    fn page_url(&self, page: usize) -> String {
        if page <= 1 {
            self.config.base_url.clone()
        } else {
            format!("{}?page={}", self.config.base_url, page)
        }
    }

    async fn fetch_page(&self, page: usize) -> Result<String, SourceError> {
        let response = self
            .client
            .get(self.page_url(page))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl NoticeSource for HtmlNoticeSource {
    async fn collect(&self) -> Result<Vec<RawNotice>, SourceError> {
        let mut notices = Vec::new();
        for page in 1..=self.config.max_pages {
            let html = match self.fetch_page(page).await {
                Ok(html) => html,
                Err(err) => {
                    // A mid-walk fetch failure ends the walk with whatever
                    // was collected; the next cycle starts over.
                    warn!(page, error = %err, "listing fetch failed, stopping pagination walk");
                    break;
                }
            };
            let page_notices = parse_listing(&html);
            if page_notices.is_empty() {
                info!(page, "no notice items on page, stopping pagination walk");
                break;
            }
            info!(page, count = page_notices.len(), "extracted notices from page");
            notices.extend(page_notices);
        }
        Ok(notices)
    }
}

const ITEM_SELECTOR: &str = ".redNoticeItem";
const NAME_SELECTORS: &[&str] = &[
    "a.redNoticeItem__labelLink",
    ".redNoticeItem__label",
    "h3",
    "h4",
    ".name",
];
const AGE_SELECTORS: &[&str] = &[".redNoticeItem__age", ".age"];
const NATIONALITY_SELECTORS: &[&str] = &[".redNoticeItem__nationalities", ".nationalities"];
const IMAGE_SELECTORS: &[&str] = &["img"];

/// Extract all notices from one listing page. Items without a usable name
/// are skipped; every optional field's absence is a plain `None`.
pub fn parse_listing(html: &str) -> Vec<RawNotice> {
    let document = Html::parse_document(html);
    let Ok(item_selector) = Selector::parse(ITEM_SELECTOR) else {
        return Vec::new();
    };
    let collected_at = Utc::now();
    document
        .select(&item_selector)
        .filter_map(|item| {
            let name = first_text(item, NAME_SELECTORS)?;
            Some(RawNotice {
                name,
                age: first_text(item, AGE_SELECTORS),
                nationality: first_text(item, NATIONALITY_SELECTORS),
                image_url: first_attr(item, IMAGE_SELECTORS, "src"),
                collected_at,
            })
        })
        .collect()
}

fn first_text(item: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        item.select(&selector)
            .next()
            .and_then(|el| text_or_none(el.text().collect::<String>()))
    })
}

fn first_attr(item: ElementRef<'_>, selectors: &[&str], attr: &str) -> Option<String> {
    selectors.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        item.select(&selector)
            .next()
            .and_then(|el| el.value().attr(attr))
            .and_then(|s| text_or_none(s.to_string()))
    })
}

fn text_or_none(text: String) -> Option<String> {
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
