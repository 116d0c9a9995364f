//! Source crawler contract + the Argenprop listing-page adapter.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rentwatch_core::{text_or_none, RawListing};
use rentwatch_storage::{FetchError, FetchedResponse, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub const ARGENPROP_SOURCE_ID: &str = "argenprop";

const LOCATION_PREFIX: &str = "Departamento en Alquiler en ";

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("page limit of {max_pages} reached before the last page")]
    PageLimit { max_pages: usize },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One fetched and parsed page of a crawl pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledPage {
    pub url: String,
    pub listings: Vec<RawListing>,
}

/// Lazy, finite sequence of listing pages.
///
/// Each call fetches at most one page. `Ok(None)` means the pass completed;
/// an error means the pass was interrupted and later pages were never seen.
#[async_trait]
pub trait SourceCrawler: Send {
    fn source_id(&self) -> &'static str;

    async fn next_page(&mut self) -> Result<Option<CrawledPage>, CrawlError>;
}

/// Listing page markup parsed into raw records plus the next-page link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedListingPage {
    pub listings: Vec<RawListing>,
    pub next_page: Option<String>,
    pub skipped_without_link: usize,
    pub skipped_invalid_link: usize,
}

struct ListingSelectors {
    item: Selector,
    link: Selector,
    price: Selector,
    expenses: Selector,
    address: Selector,
    rooms: Selector,
    m2: Selector,
    years: Selector,
    image: Selector,
    title: Selector,
    next_page: Selector,
}

fn selector(css: &str) -> Result<Selector, CrawlError> {
    Selector::parse(css).map_err(|e| CrawlError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

impl ListingSelectors {
    fn new() -> Result<Self, CrawlError> {
        Ok(Self {
            item: selector(".listing__item")?,
            link: selector("a.card")?,
            price: selector(".card__price")?,
            expenses: selector(".card__expenses")?,
            address: selector(".card__address")?,
            rooms: selector(".icono-cantidad_dormitorios + span")?,
            m2: selector(".icono-superficie_cubierta + span")?,
            years: selector(".icono-antiguedad + span")?,
            image: selector(".card__photos img")?,
            title: selector(".card__title--primary")?,
            next_page: selector(".pagination__page-next a")?,
        })
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

fn location_from_title(title: &str) -> Option<String> {
    title
        .split_once(LOCATION_PREFIX)
        .and_then(|(_, rest)| text_or_none(rest))
}

/// Resolve `href` against `base`, keeping absolute links untouched.
pub fn resolve_link(base: &Url, href: &str) -> Result<String, CrawlError> {
    base.join(href.trim())
        .map(|u| u.to_string())
        .map_err(|_| CrawlError::InvalidUrl(href.to_string()))
}

/// Parse an Argenprop search result page.
///
/// Field values are kept as the page shows them; numeric parsing happens
/// downstream. Cards without a link are counted and dropped.
pub fn parse_listing_page(html: &str, page_url: &Url) -> Result<ParsedListingPage, CrawlError> {
    let selectors = ListingSelectors::new()?;
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut listings = Vec::new();
    let mut skipped_without_link = 0usize;
    let mut skipped_invalid_link = 0usize;

    for item in root.select(&selectors.item) {
        let Some(href) = first_attr(item, &selectors.link, "href") else {
            skipped_without_link += 1;
            continue;
        };
        let link = match resolve_link(page_url, &href) {
            Ok(link) => link,
            Err(err) => {
                warn!(page = %page_url, error = %err, "listing card with an unusable link skipped");
                skipped_invalid_link += 1;
                continue;
            }
        };

        let image = first_attr(item, &selectors.image, "src")
            .or_else(|| first_attr(item, &selectors.image, "data-src"));

        listings.push(RawListing {
            link,
            price: first_text(item, &selectors.price),
            expenses: first_text(item, &selectors.expenses),
            location: first_text(item, &selectors.title).and_then(|t| location_from_title(&t)),
            address: first_text(item, &selectors.address),
            rooms: first_text(item, &selectors.rooms),
            m2: first_text(item, &selectors.m2),
            years: first_text(item, &selectors.years),
            image,
        });
    }

    let next_page = first_attr(root, &selectors.next_page, "href")
        .map(|href| resolve_link(page_url, &href))
        .transpose()?;

    Ok(ParsedListingPage {
        listings,
        next_page,
        skipped_without_link,
        skipped_invalid_link,
    })
}

/// Source of listing page bodies for [`ArgenpropCrawler`].
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes(url).await
    }
}

/// Live crawler: starts at the search page and follows "next" links.
pub struct ArgenpropCrawler<F = HttpFetcher> {
    fetcher: F,
    next_url: Option<Url>,
    visited: HashSet<String>,
    pages_fetched: usize,
    max_pages: usize,
}

impl<F: PageFetcher> ArgenpropCrawler<F> {
    pub fn new(
        fetcher: F,
        base_link: &str,
        search_link: &str,
        max_pages: usize,
    ) -> Result<Self, CrawlError> {
        let base = Url::parse(base_link).map_err(|_| CrawlError::InvalidUrl(base_link.to_string()))?;
        let seed = base
            .join(search_link)
            .map_err(|_| CrawlError::InvalidUrl(search_link.to_string()))?;
        Ok(Self {
            fetcher,
            next_url: Some(seed),
            visited: HashSet::new(),
            pages_fetched: 0,
            max_pages: max_pages.max(1),
        })
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

#[async_trait]
impl<F: PageFetcher> SourceCrawler for ArgenpropCrawler<F> {
    fn source_id(&self) -> &'static str {
        ARGENPROP_SOURCE_ID
    }

    async fn next_page(&mut self) -> Result<Option<CrawledPage>, CrawlError> {
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };
        if self.visited.contains(url.as_str()) {
            warn!(url = %url, "pagination loops back to a visited page, ending pass");
            return Ok(None);
        }
        if self.pages_fetched >= self.max_pages {
            // Unvisited pages may still hold active listings, so this is not a completed pass.
            return Err(CrawlError::PageLimit {
                max_pages: self.max_pages,
            });
        }
        self.visited.insert(url.to_string());

        let response = self
            .fetcher
            .fetch_page(url.as_str())
            .await
            .map_err(|source| CrawlError::Fetch {
                url: url.to_string(),
                source,
            })?;
        self.pages_fetched += 1;

        let page_url = Url::parse(&response.final_url).unwrap_or_else(|_| url.clone());
        let parsed = parse_listing_page(&response.text(), &page_url)?;
        let skipped = parsed.skipped_without_link + parsed.skipped_invalid_link;
        if skipped > 0 {
            warn!(url = %page_url, skipped, "listing cards without a usable link were skipped");
        }
        debug!(url = %page_url, listings = parsed.listings.len(), "parsed listing page");

        self.next_url = parsed
            .next_page
            .as_deref()
            .and_then(|next| Url::parse(next).ok());

        Ok(Some(CrawledPage {
            url: page_url.to_string(),
            listings: parsed.listings,
        }))
    }
}

/// Replays captured listing pages (`*.html`, sorted by file name) from a directory.
pub struct FixtureCrawler {
    base: Url,
    pages: Vec<PathBuf>,
    cursor: usize,
}

impl FixtureCrawler {
    pub async fn from_dir(dir: impl AsRef<Path>, base_link: &str) -> Result<Self, CrawlError> {
        let dir = dir.as_ref();
        let base = Url::parse(base_link).map_err(|_| CrawlError::InvalidUrl(base_link.to_string()))?;
        let io_err = |source: std::io::Error| CrawlError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = fs::read_dir(dir).await.map_err(io_err)?;
        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "html") {
                pages.push(path);
            }
        }
        pages.sort();
        info!(dir = %dir.display(), pages = pages.len(), "loaded fixture pages");

        Ok(Self {
            base,
            pages,
            cursor: 0,
        })
    }
}

#[async_trait]
impl SourceCrawler for FixtureCrawler {
    fn source_id(&self) -> &'static str {
        ARGENPROP_SOURCE_ID
    }

    async fn next_page(&mut self) -> Result<Option<CrawledPage>, CrawlError> {
        let Some(path) = self.pages.get(self.cursor).cloned() else {
            return Ok(None);
        };
        self.cursor += 1;

        let html = fs::read_to_string(&path).await.map_err(|source| CrawlError::Io {
            path: path.clone(),
            source,
        })?;
        let parsed = parse_listing_page(&html, &self.base)?;
        Ok(Some(CrawledPage {
            url: path.display().to_string(),
            listings: parsed.listings,
        }))
    }
}
