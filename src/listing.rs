//! The site's WordPress `admin-ajax.php` project listing.
//!
//! Each page is an HTML fragment of `<tr>` rows plus a `has_more` flag. Rows
//! carry far fewer fields than the feature layer and no coordinates, which is
//! why this source is only consulted when every layer has failed.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::dataset::ProjectRow;
use crate::error::FetchError;
use crate::mapper::normalize_row;
use crate::paginator::{Page, PageRequest, PageSource, Paginator};
use crate::retry::Attempt;
use crate::session::{Session, is_certificate_error};
use crate::util::urljoin;

static FC_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)(?:window\.)?FC\s*=\s*\{[^}]*?['"]?ajaxUrl['"]?\s*:\s*['"](?P<ajax>[^'"]+)['"][^}]*?['"]?nonce['"]?\s*:\s*['"](?P<nonce>[^'"]+)['"][^}]*?\}"#,
    )
    .expect("FC object pattern should be valid")
});
static DATA_NONCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"data-nonce="(?P<nonce>[0-9a-fA-F]+)""#).expect("data-nonce pattern should be valid")
});
static LOOSE_NONCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bnonce\b['"]?\s*[:=]\s*['"](?P<nonce>[0-9a-fA-F]+)['"]"#)
        .expect("nonce pattern should be valid")
});

static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("row selector should be valid"));
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("cell selector should be valid"));
static CARD_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.load-project-card").expect("card selector should be valid"));
static REPORT_BUTTON: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("button.open-report-form").expect("report selector should be valid"));

/// Nonce and endpoint found in a page, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub nonce: String,
    pub ajax_url: Option<String>,
}

/// Scans page HTML for the localized `FC` object or a bare nonce.
pub fn find_nonce(html: &str) -> Option<Detected> {
    if let Some(c) = FC_OBJECT.captures(html) {
        return Some(Detected {
            nonce: c["nonce"].to_string(),
            // wp_localize_script escapes slashes.
            ajax_url: Some(c["ajax"].replace("\\/", "/")),
        });
    }
    DATA_NONCE
        .captures(html)
        .or_else(|| LOOSE_NONCE.captures(html))
        .map(|c| Detected {
            nonce: c["nonce"].to_string(),
            ajax_url: None,
        })
}

/// Resolves the endpoint and nonce: configured nonce first, then the public pages.
pub fn detect_endpoint(session: &Session, config: &Config) -> (Option<String>, String) {
    if let Some(nonce) = &config.nonce {
        return (Some(nonce.clone()), config.ajax_url.clone());
    }
    for page in ["flood-control-map/", ""] {
        let url = urljoin(&config.site_url, page);
        let html = match session.get_text(&url) {
            Attempt::Done(html) => html,
            Attempt::Retryable(e) | Attempt::Fatal(e) => {
                warn!(url = %url, error = %e, "could not load page for nonce detection");
                continue;
            }
        };
        if let Some(found) = find_nonce(&html) {
            // The localized object may carry a site-relative path.
            let ajax = found
                .ajax_url
                .map(|u| urljoin(&config.site_url, &u))
                .unwrap_or_else(|| config.ajax_url.clone());
            info!(ajax_url = %ajax, "detected listing nonce");
            return (Some(found.nonce), ajax);
        }
    }
    warn!("no listing nonce found; trying without one");
    (None, config.ajax_url.clone())
}

#[derive(Debug, Deserialize)]
struct ListingReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true"),
        _ => false,
    }
}

#[derive(Debug)]
pub struct Listing<'s> {
    session: &'s Session,
    ajax_url: String,
    nonce: Option<String>,
}

impl<'s> Listing<'s> {
    pub fn new(session: &'s Session, ajax_url: impl Into<String>, nonce: Option<String>) -> Self {
        Self {
            session,
            ajax_url: ajax_url.into(),
            nonce,
        }
    }

    pub fn ajax_url(&self) -> &str {
        &self.ajax_url
    }
}

impl PageSource for Listing<'_> {
    type Item = ProjectRow;

    fn fetch_page(&self, req: &PageRequest) -> Attempt<Page<ProjectRow>> {
        let form = [
            ("action", "filter_projects".to_string()),
            // Some deployments accept an empty nonce.
            ("nonce", self.nonce.clone().unwrap_or_default()),
            ("page", (req.index + 1).to_string()),
            ("per_page", req.limit.to_string()),
            ("region", String::new()),
            ("year", String::new()),
            ("type_of_work", String::new()),
            ("municipality", String::new()),
            ("search_itm", String::new()),
        ];
        self.session
            .post_form_json::<ListingReply>(&self.ajax_url, &form)
            .map(|reply| {
                let rows_html = reply.data.get("rows").and_then(Value::as_str).unwrap_or("");
                let has_more = truthy(reply.data.get("has_more"));
                if !reply.success {
                    warn!(page = req.index + 1, "listing reported failure");
                }
                Page {
                    items: parse_rows(rows_html),
                    more: Some(reply.success && has_more),
                }
            })
    }
}

/// Parses the listing's `<tr>` fragment into rows.
pub fn parse_rows(rows_html: &str) -> Vec<ProjectRow> {
    // Bare <tr> outside a table is dropped by an HTML5 parser.
    let doc = Html::parse_fragment(&format!("<table><tbody>{}</tbody></table>", rows_html));
    doc.select(&ROW).map(parse_row).collect()
}

fn parse_row(tr: ElementRef<'_>) -> ProjectRow {
    let link = tr.select(&CARD_LINK).next();
    let project_id = link
        .and_then(|a| a.value().attr("data-id").or_else(|| a.value().attr("href")))
        .map(str::to_string);
    let description = link.map(text_of);

    let cells: Vec<String> = tr.select(&CELL).map(text_of).collect();
    let cell = |i: usize| cells.get(i).cloned();

    let report_contract_id = tr
        .select(&REPORT_BUTTON)
        .next()
        .and_then(|b| b.value().attr("data-contract_id"))
        .map(str::to_string);

    let mut row = ProjectRow {
        project_id,
        description,
        location: cell(1),
        contractor: cell(2),
        cost: cell(3),
        completion_date: cell(4),
        report_contract_id,
        ..Default::default()
    };
    normalize_row(&mut row);
    row
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pages through the listing, retrying once without TLS verification if allowed.
///
/// The retry repeats nonce detection too, since the pages it scans sit behind
/// the same certificate.
pub fn fetch_listing(session: &Session, config: &Config) -> Result<(String, Vec<ProjectRow>), FetchError> {
    with_insecure_retry(session, config, || listing_pass(session, config))
}

fn listing_pass(session: &Session, config: &Config) -> Result<(String, Vec<ProjectRow>), FetchError> {
    let (nonce, ajax_url) = detect_endpoint(session, config);
    let listing = Listing::new(session, ajax_url, nonce);
    let rows = Paginator::new(config.listing_page_size, session.retry_policy().clone())
        .with_max_pages(config.max_pages)
        .with_progress(config.progress)
        .run(&listing, ProjectRow::listing_key)?;
    info!(rows = rows.len(), "listing rows collected");
    Ok((listing.ajax_url().to_string(), rows))
}

fn with_insecure_retry<T, F>(session: &Session, config: &Config, mut pass: F) -> Result<T, FetchError>
where
    F: FnMut() -> Result<T, FetchError>,
{
    match pass() {
        Err(e) if is_certificate_error(&e) && config.allow_insecure_retry && session.verifies_tls() => {
            warn!(error = %e, "TLS verification failed for listing");
            if let Err(build) = session.disable_tls_verification() {
                warn!(error = %build, "could not rebuild HTTP client");
                return Err(e);
            }
            pass()
        }
        other => other,
    }
}
