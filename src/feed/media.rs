//! Enclosure and Media RSS extraction.
//!
//! `feed-rs` folds enclosures and `media:*` elements into one list, which
//! loses the distinction the thumbnail resolver relies on. This module
//! re-reads the raw XML with `quick-xml` and keeps them apart, producing one
//! [`EntryMedia`] per `<item>`/`<entry>` in document order.

use quick_xml::encoding::Decoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

/// Media RSS namespace; the trailing slash is optional in the wild
const MRSS_NS: &[u8] = b"http://search.yahoo.com/mrss";

/// A downloadable attachment of an entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: Option<String>,
    /// Explicit preview image, only known for `media:group` content
    pub thumbnail: Option<String>,
}

/// A `<media:content>` element outside any `<media:group>`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaContent {
    pub url: String,
    /// `medium` attribute (`image`, `video`, ...)
    pub medium: Option<String>,
    pub mime_type: Option<String>,
}

/// Media attached to a single entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryMedia {
    pub enclosures: Vec<Enclosure>,
    /// Entry-level `<media:thumbnail>` URLs
    pub thumbnails: Vec<String>,
    pub contents: Vec<MediaContent>,
}

impl EntryMedia {
    pub fn is_empty(&self) -> bool {
        self.enclosures.is_empty() && self.thumbnails.is_empty() && self.contents.is_empty()
    }
}

/// Elements the scanner cares about, after namespace resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Entry,
    Enclosure,
    Link,
    MediaGroup,
    MediaContent,
    MediaThumbnail,
    Other,
}

fn is_media_ns(ns: &ResolveResult<'_>) -> bool {
    match ns {
        ResolveResult::Bound(Namespace(uri)) => {
            let uri: &[u8] = uri;
            uri.strip_suffix(b"/").unwrap_or(uri) == MRSS_NS
        }
        // Undeclared `media:` prefix, common in hand-written feeds
        ResolveResult::Unknown(prefix) => prefix.as_slice() == b"media",
        ResolveResult::Unbound => false,
    }
}

fn classify(ns: &ResolveResult<'_>, local: &[u8]) -> Tag {
    if is_media_ns(ns) {
        return match local {
            b"group" => Tag::MediaGroup,
            b"content" => Tag::MediaContent,
            b"thumbnail" => Tag::MediaThumbnail,
            _ => Tag::Other,
        };
    }
    match local {
        b"item" | b"entry" => Tag::Entry,
        b"enclosure" => Tag::Enclosure,
        b"link" => Tag::Link,
        _ => Tag::Other,
    }
}

/// `<media:content>` currently open, collecting a nested thumbnail
struct OpenContent {
    content: MediaContent,
    thumbnail: Option<String>,
}

#[derive(Default)]
struct OpenGroup {
    contents: Vec<(MediaContent, Option<String>)>,
    thumbnail: Option<String>,
}

#[derive(Default)]
struct Scanner {
    entries: Vec<EntryMedia>,
    current: Option<EntryMedia>,
    group: Option<OpenGroup>,
    content: Option<OpenContent>,
}

impl Scanner {
    fn start(&mut self, tag: Tag, e: &BytesStart<'_>, decoder: Decoder, self_closing: bool) {
        if tag == Tag::Entry {
            if !self_closing {
                self.current = Some(EntryMedia::default());
                self.group = None;
                self.content = None;
            } else {
                self.entries.push(EntryMedia::default());
            }
            return;
        }

        let Some(entry) = self.current.as_mut() else {
            return;
        };

        match tag {
            Tag::Enclosure => {
                if let Some(url) = attr(e, decoder, b"url") {
                    entry.enclosures.push(Enclosure {
                        url,
                        mime_type: attr(e, decoder, b"type"),
                        thumbnail: None,
                    });
                }
            }
            Tag::Link => {
                if attr(e, decoder, b"rel").as_deref() == Some("enclosure") {
                    if let Some(url) = attr(e, decoder, b"href") {
                        entry.enclosures.push(Enclosure {
                            url,
                            mime_type: attr(e, decoder, b"type"),
                            thumbnail: None,
                        });
                    }
                }
            }
            Tag::MediaGroup => {
                if !self_closing {
                    self.group = Some(OpenGroup::default());
                }
            }
            Tag::MediaContent => {
                let Some(url) = attr(e, decoder, b"url") else {
                    return;
                };
                let open = OpenContent {
                    content: MediaContent {
                        url,
                        medium: attr(e, decoder, b"medium"),
                        mime_type: attr(e, decoder, b"type"),
                    },
                    thumbnail: None,
                };
                if self_closing {
                    self.finish_content(open);
                } else {
                    self.content = Some(open);
                }
            }
            Tag::MediaThumbnail => {
                let Some(url) = attr(e, decoder, b"url") else {
                    return;
                };
                if let Some(open) = self.content.as_mut() {
                    open.thumbnail.get_or_insert(url);
                } else if let Some(group) = self.group.as_mut() {
                    group.thumbnail.get_or_insert(url);
                } else {
                    entry.thumbnails.push(url);
                }
            }
            Tag::Entry | Tag::Other => {}
        }
    }

    fn end(&mut self, tag: Tag) {
        match tag {
            Tag::Entry => {
                if let Some(entry) = self.current.take() {
                    self.entries.push(entry);
                }
                self.group = None;
                self.content = None;
            }
            Tag::MediaContent => {
                if let Some(open) = self.content.take() {
                    self.finish_content(open);
                }
            }
            Tag::MediaGroup => {
                let (Some(group), Some(entry)) = (self.group.take(), self.current.as_mut()) else {
                    return;
                };
                for (content, thumbnail) in group.contents {
                    entry.enclosures.push(Enclosure {
                        url: content.url,
                        mime_type: content.mime_type,
                        thumbnail: thumbnail.or_else(|| group.thumbnail.clone()),
                    });
                }
            }
            _ => {}
        }
    }

    fn finish_content(&mut self, open: OpenContent) {
        if let Some(group) = self.group.as_mut() {
            group.contents.push((open.content, open.thumbnail));
        } else if let Some(entry) = self.current.as_mut() {
            // A thumbnail nested in a loose media:content still describes the entry
            if let Some(thumbnail) = open.thumbnail {
                entry.thumbnails.push(thumbnail);
            }
            entry.contents.push(open.content);
        }
    }
}

fn attr(e: &BytesStart<'_>, decoder: Decoder, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(Result::ok)
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.decode_and_unescape_value(decoder).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Collect enclosures and media tags per entry, in document order.
///
/// Media RSS elements are recognized by namespace URI, whatever prefix the
/// feed binds to it. Malformed XML stops the scan and returns what was
/// collected so far; the caller detects the resulting count mismatch and
/// drops the media.
pub fn scan_entry_media(bytes: &[u8]) -> Vec<EntryMedia> {
    // quick-xml 0.37 never expands custom <!ENTITY> declarations, only the 5 builtins
    let mut reader = NsReader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let decoder = reader.decoder();

    let mut scanner = Scanner::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_resolved_event_into(&mut buf) {
            Ok((ns, Event::Start(e))) => {
                let tag = classify(&ns, e.local_name().as_ref());
                scanner.start(tag, &e, decoder, false);
            }
            Ok((ns, Event::Empty(e))) => {
                let tag = classify(&ns, e.local_name().as_ref());
                scanner.start(tag, &e, decoder, true);
            }
            Ok((ns, Event::End(e))) => scanner.end(classify(&ns, e.local_name().as_ref())),
            Ok((_, Event::Eof)) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Media scan stopped on malformed XML");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    scanner.entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scan(xml: &str) -> Vec<EntryMedia> {
        scan_entry_media(xml.as_bytes())
    }

    #[test]
    fn test_rss_enclosure() {
        let media = scan(
            r#"<rss><channel>
                <item><enclosure url="https://e.com/a.mp3" type="audio/mpeg" length="1"/></item>
                <item><title>none</title></item>
            </channel></rss>"#,
        );
        assert_eq!(media.len(), 2);
        assert_eq!(
            media[0].enclosures,
            vec![Enclosure {
                url: "https://e.com/a.mp3".into(),
                mime_type: Some("audio/mpeg".into()),
                thumbnail: None,
            }]
        );
        assert!(media[1].is_empty());
    }

    #[test]
    fn test_channel_level_media_ignored() {
        let media = scan(
            r#"<rss xmlns:media="http://search.yahoo.com/mrss/"><channel>
                <media:thumbnail url="https://e.com/channel.jpg"/>
                <item><title>x</title></item>
            </channel></rss>"#,
        );
        assert_eq!(media.len(), 1);
        assert!(media[0].is_empty());
    }

    #[test]
    fn test_loose_media_tags() {
        let media = scan(
            r#"<rss xmlns:media="http://search.yahoo.com/mrss/"><channel><item>
                <media:thumbnail url="https://e.com/t.jpg" width="100"/>
                <media:content url="https://e.com/c.jpg" medium="image"/>
            </item></channel></rss>"#,
        );
        assert_eq!(media[0].thumbnails, vec!["https://e.com/t.jpg".to_string()]);
        assert_eq!(
            media[0].contents,
            vec![MediaContent {
                url: "https://e.com/c.jpg".into(),
                medium: Some("image".into()),
                mime_type: None,
            }]
        );
        assert!(media[0].enclosures.is_empty());
    }

    #[test]
    fn test_media_group_becomes_enclosures() {
        let media = scan(
            r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:media="http://search.yahoo.com/mrss/">
              <entry>
                <media:group>
                  <media:content url="https://e.com/v.mp4" type="video/mp4">
                    <media:thumbnail url="https://e.com/v.jpg"/>
                  </media:content>
                  <media:content url="https://e.com/w.mp4" type="video/mp4"/>
                  <media:thumbnail url="https://e.com/group.jpg"/>
                </media:group>
              </entry>
            </feed>"#,
        );
        let enclosures = &media[0].enclosures;
        assert_eq!(enclosures.len(), 2);
        assert_eq!(enclosures[0].thumbnail.as_deref(), Some("https://e.com/v.jpg"));
        assert_eq!(enclosures[1].thumbnail.as_deref(), Some("https://e.com/group.jpg"));
        assert!(media[0].thumbnails.is_empty());
    }

    #[test]
    fn test_atom_link_enclosure() {
        let media = scan(
            r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
                <link rel="alternate" href="https://e.com/post"/>
                <link rel="enclosure" type="image/jpeg" href="https://e.com/p.jpg"/>
            </entry></feed>"#,
        );
        assert_eq!(media[0].enclosures.len(), 1);
        assert_eq!(media[0].enclosures[0].url, "https://e.com/p.jpg");
    }

    #[test]
    fn test_media_namespace_under_other_prefix() {
        let media = scan(
            r#"<rss xmlns:m="http://search.yahoo.com/mrss/"><channel>
                <item>
                  <m:thumbnail url="https://e.com/t.jpg"/>
                  <m:content url="https://e.com/c.png" type="image/png"/>
                </item>
                <item>
                  <thumbnail xmlns="http://search.yahoo.com/mrss" url="https://e.com/default-ns.jpg"/>
                </item>
            </channel></rss>"#,
        );
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].thumbnails, vec!["https://e.com/t.jpg".to_string()]);
        assert_eq!(media[0].contents[0].url, "https://e.com/c.png");
        assert_eq!(
            media[1].thumbnails,
            vec!["https://e.com/default-ns.jpg".to_string()]
        );
    }

    #[test]
    fn test_media_prefix_bound_elsewhere_is_ignored() {
        let media = scan(
            r#"<rss xmlns:media="http://example.com/not-mrss"><channel><item>
                <media:thumbnail url="https://e.com/t.jpg"/>
            </item></channel></rss>"#,
        );
        assert_eq!(media.len(), 1);
        assert!(media[0].is_empty());
    }

    #[test]
    fn test_undeclared_media_prefix_still_recognized() {
        let media = scan(
            r#"<rss><channel><item>
                <media:thumbnail url="https://e.com/t.jpg"/>
            </item></channel></rss>"#,
        );
        assert_eq!(media[0].thumbnails, vec!["https://e.com/t.jpg".to_string()]);
    }

    #[test]
    fn test_escaped_attribute_decoded() {
        let media = scan(
            r#"<rss><channel><item>
                <enclosure url="https://e.com/i.jpg?a=1&amp;b=2" type="image/jpeg"/>
            </item></channel></rss>"#,
        );
        assert_eq!(media[0].enclosures[0].url, "https://e.com/i.jpg?a=1&b=2");
    }
}
