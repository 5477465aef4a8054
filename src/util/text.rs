use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// Appended to excerpts that were cut short
const ELLIPSIS: char = '…';

fn is_stripped_control(b: u8) -> bool {
    b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// Strip control characters and ANSI escape sequences from feed-supplied text.
///
/// Tab, newline and carriage return are kept. CSI sequences (`ESC [` up to a
/// final byte in 0x40..=0x7E) and OSC sequences (`ESC ]` up to BEL or
/// `ESC \`) are removed whole; a bare ESC is dropped on its own.
///
/// Returns `Cow::Borrowed` when nothing needs stripping, which is the common case.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().any(|&b| b == 0x1b || is_stripped_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    let mut run_start = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b != 0x1b && !is_stripped_control(b) {
            i += 1;
            continue;
        }

        // Only ASCII bytes end a run, so the slice is on a char boundary
        out.push_str(&s[run_start..i]);

        if b == 0x1b {
            match bytes.get(i + 1) {
                Some(b'[') => {
                    i += 2;
                    while i < bytes.len() {
                        let c = bytes[i];
                        i += 1;
                        if (0x40..=0x7e).contains(&c) {
                            break;
                        }
                    }
                }
                Some(b']') => {
                    i += 2;
                    while i < bytes.len() {
                        if bytes[i] == 0x07 {
                            i += 1;
                            break;
                        }
                        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        } else {
            i += 1;
        }
        run_start = i;
    }

    out.push_str(&s[run_start..]);
    Cow::Owned(out)
}

/// `<script>`/`<style>` elements, contents included
fn script_or_style() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>").ok()
        })
        .as_ref()
}

/// Remove HTML tags, decode the handful of common entities and collapse
/// whitespace runs into single spaces. Script and style bodies are dropped
/// entirely.
pub fn strip_html(html: &str) -> String {
    let html = match script_or_style() {
        Some(pattern) => pattern.replace_all(html, " "),
        None => Cow::Borrowed(html),
    };

    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                // Adjacent block elements should not glue words together
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    // &amp; last so "&amp;lt;" decodes to "&lt;" and not "<"
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain-text excerpt of at most `max_chars` characters (plus the ellipsis).
///
/// Text longer than the limit is cut back to the last word boundary inside
/// the limit and gets a trailing `…`. A single word longer than the limit is
/// cut mid-word.
pub fn make_excerpt(html: &str, max_chars: usize) -> String {
    let text = strip_html(html);
    if text.chars().count() <= max_chars {
        return text;
    }

    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let head = &text[..cut];

    // If the next char is a space we already stopped on a boundary
    let at_boundary = text[cut..].starts_with(' ');
    let trimmed = if at_boundary {
        head
    } else {
        match head.rfind(' ') {
            Some(space) if space > 0 => &head[..space],
            _ => head,
        }
    };

    let mut excerpt = trimmed.trim_end().to_string();
    excerpt.push(ELLIPSIS);
    excerpt
}

/// `src` of the first `<img>` tag in an HTML fragment
pub fn first_img_src(html: &str) -> Option<String> {
    let img_pattern = regex::Regex::new(r#"<img[^>]+src=["']([^"']+)["']"#).ok()?;
    img_pattern
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|src| !src.is_empty())
}
