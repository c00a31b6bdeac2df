use crate::types::Citation;
use serde_json::Value;

pub const DEFAULT_TITLE: &str = "Official Document";

/// What the citation panel should show after a `sources` frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CitationSet {
    /// Upstream sent no sources at all.
    NoneAvailable,
    /// Upstream sent sources but none were on an allowed domain.
    NoOfficialSources,
    Listed(Vec<Citation>),
}

impl CitationSet {
    /// Builds the panel state from a raw `sources` array.
    pub fn from_sources(records: &[Value], allowed_prefixes: &[String]) -> Self {
        if records.is_empty() {
            return CitationSet::NoneAvailable;
        }
        let citations = filter_citations(records, allowed_prefixes);
        if citations.is_empty() {
            CitationSet::NoOfficialSources
        } else {
            CitationSet::Listed(citations)
        }
    }

    /// Only a non-empty filtered list opens the panel.
    pub fn opens_panel(&self) -> bool {
        matches!(self, CitationSet::Listed(items) if !items.is_empty())
    }

    pub fn citations(&self) -> &[Citation] {
        match self {
            CitationSet::Listed(items) => items,
            _ => &[],
        }
    }

    pub fn empty_notice(&self) -> Option<&'static str> {
        match self {
            CitationSet::NoneAvailable => Some("No citations available for this response."),
            CitationSet::NoOfficialSources => Some("No official government sources found."),
            CitationSet::Listed(_) => None,
        }
    }
}

/// Keeps the records whose URL starts with one of `allowed_prefixes`.
///
/// The URL comes from `url`, falling back to `source_url`; the title from
/// `title`, then `document_title`.
pub fn filter_citations(records: &[Value], allowed_prefixes: &[String]) -> Vec<Citation> {
    records
        .iter()
        .filter(|record| {
            let url = resolve_url(record).unwrap_or_default();
            allowed_prefixes
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()))
        })
        .map(to_citation)
        .collect()
}

fn resolve_url(record: &Value) -> Option<&str> {
    first_str(record, &["url", "source_url"])
}

fn to_citation(record: &Value) -> Citation {
    Citation {
        url: resolve_url(record)
            .unwrap_or(Citation::NO_URL)
            .to_string(),
        title: first_str(record, &["title", "document_title"])
            .unwrap_or(DEFAULT_TITLE)
            .to_string(),
    }
}

fn first_str<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
}
