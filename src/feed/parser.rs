use feed_rs::model::Link;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use super::media::{scan_entry_media, EntryMedia};
use super::retrieve::RetrieveError;

/// A successfully parsed feed document
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    /// Canonical website URL advertised by the feed
    pub site_url: Option<String>,
    /// Entries in document order
    pub entries: Vec<ParsedEntry>,
}

/// One feed entry with the raw fields the fetcher normalizes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEntry {
    /// The entry's own id (`<guid>` / `<id>`), possibly empty
    pub id: String,
    pub title: Option<String>,
    /// Full body (`content:encoded`, Atom `<content>`)
    pub content: Option<String>,
    /// Summary (`<description>`, Atom `<summary>`)
    pub description: Option<String>,
    pub permalink: Option<String>,
    pub author: Option<String>,
    /// Epoch seconds
    pub published: Option<i64>,
    pub media: EntryMedia,
}

impl ParsedEntry {
    /// Stable identifier used for deduplication.
    ///
    /// Permalink first, then the entry id, then a SHA-256 digest of
    /// `link|title|published` so entries with neither still dedup across fetches.
    pub fn dedup_key(&self) -> String {
        if let Some(link) = non_blank(self.permalink.as_deref()) {
            return link.to_string();
        }
        if let Some(id) = non_blank(Some(&self.id)) {
            return id.to_string();
        }

        let input = format!(
            "{}|{}|{}",
            self.permalink.as_deref().unwrap_or(""),
            self.title.as_deref().unwrap_or(""),
            self.published.map(|p| p.to_string()).unwrap_or_default()
        );
        format!("{:x}", Sha256::digest(input.as_bytes()))
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// The page link among a feed's or entry's links: no `rel`, or `rel="alternate"`
fn page_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

/// Parse an RSS or Atom document.
///
/// Text fields come from `feed-rs`; enclosures and media-namespace tags come
/// from a second pass over the raw XML (see [`scan_entry_media`]).
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, RetrieveError> {
    let feed = parser::parse(bytes).map_err(|e| RetrieveError::Parse(e.to_string()))?;

    let mut media = scan_entry_media(bytes);
    if media.len() != feed.entries.len() {
        tracing::debug!(
            entries = feed.entries.len(),
            scanned = media.len(),
            "Media scan did not line up with parsed entries, ignoring media"
        );
        media = Vec::new();
    }
    let mut media = media.into_iter();

    let site_url = page_link(&feed.links);

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let description = entry.summary.map(|s| s.content).filter(|s| !s.trim().is_empty());
            let content = entry
                .content
                .and_then(|c| c.body)
                .filter(|s| !s.trim().is_empty());
            let author = entry
                .authors
                .into_iter()
                .map(|p| p.name)
                .find(|name| !name.trim().is_empty());

            ParsedEntry {
                id: entry.id,
                title: entry.title.map(|t| t.content),
                content,
                description,
                permalink: page_link(&entry.links),
                author,
                published: entry.published.or(entry.updated).map(|dt| dt.timestamp()),
                media: media.next().unwrap_or_default(),
            }
        })
        .collect();

    Ok(ParsedFeed { site_url, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/"
     xmlns:dc="http://purl.org/dc/elements/1.1/">
<channel>
  <title>Example</title>
  <link>https://example.com/</link>
  <item>
    <title>First</title>
    <link>https://example.com/first</link>
    <guid isPermaLink="false">abc-1</guid>
    <description>Short &lt;b&gt;summary&lt;/b&gt;</description>
    <content:encoded><![CDATA[<p>Full body</p>]]></content:encoded>
    <dc:creator>Jane Doe</dc:creator>
    <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
  </item>
  <item>
    <description>No title, no link</description>
  </item>
</channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <link rel="self" href="https://example.org/feed.atom"/>
  <link rel="alternate" href="https://example.org/"/>
  <id>urn:feed</id>
  <updated>2025-06-10T04:00:00Z</updated>
  <entry>
    <title>Atom Entry</title>
    <id>urn:entry:1</id>
    <link rel="alternate" href="https://example.org/entry-1"/>
    <link rel="enclosure" type="image/png" href="https://example.org/1.png"/>
    <updated>2025-06-10T04:00:00Z</updated>
    <summary>Atom summary</summary>
    <author><name>Sam</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_fields() {
        let feed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(feed.site_url.as_deref(), Some("https://example.com/"));
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.title.as_deref(), Some("First"));
        assert_eq!(first.permalink.as_deref(), Some("https://example.com/first"));
        assert_eq!(first.content.as_deref(), Some("<p>Full body</p>"));
        assert_eq!(first.description.as_deref(), Some("Short <b>summary</b>"));
        assert_eq!(first.author.as_deref(), Some("Jane Doe"));
        assert_eq!(first.published, Some(1_749_528_000));
        assert_eq!(first.dedup_key(), "https://example.com/first");
    }

    #[test]
    fn test_parse_atom_fields() {
        let feed = parse_feed(ATOM.as_bytes()).unwrap();
        assert_eq!(feed.site_url.as_deref(), Some("https://example.org/"));

        let entry = &feed.entries[0];
        assert_eq!(entry.permalink.as_deref(), Some("https://example.org/entry-1"));
        assert_eq!(entry.description.as_deref(), Some("Atom summary"));
        assert_eq!(entry.author.as_deref(), Some("Sam"));
        assert_eq!(entry.published, Some(1_749_528_000));
        assert_eq!(entry.media.enclosures.len(), 1);
        assert_eq!(entry.media.enclosures[0].url, "https://example.org/1.png");
    }

    #[test]
    fn test_dedup_key_falls_back_to_id() {
        let entry = ParsedEntry {
            id: " urn:entry:9 ".into(),
            permalink: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(entry.dedup_key(), "urn:entry:9");
    }

    #[test]
    fn test_dedup_key_hash_is_stable() {
        let entry = ParsedEntry {
            title: Some("Only a title".into()),
            published: Some(1_700_000_000),
            ..Default::default()
        };
        let key = entry.dedup_key();
        assert_eq!(key.len(), 64);
        assert_eq!(key, entry.clone().dedup_key());

        let other = ParsedEntry {
            title: Some("Another title".into()),
            ..entry
        };
        assert_ne!(other.dedup_key(), key);
    }

    #[test]
    fn test_malformed_xml_is_parse_error() {
        assert!(matches!(
            parse_feed(b"<not valid xml"),
            Err(RetrieveError::Parse(_))
        ));
    }
}
