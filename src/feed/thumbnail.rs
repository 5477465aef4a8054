use super::media::{Enclosure, EntryMedia};
use crate::util::first_img_src;

fn is_image_type(mime: Option<&str>) -> bool {
    mime.is_some_and(|m| m.trim().to_ascii_lowercase().starts_with("image/"))
}

fn enclosure_image(enclosure: &Enclosure) -> Option<&str> {
    is_image_type(enclosure.mime_type.as_deref()).then_some(enclosure.url.as_str())
}

/// Pick a thumbnail for an entry. First hit wins:
///
/// 1. the primary enclosure's explicit thumbnail
/// 2. the primary enclosure itself when it is an `image/*`
/// 3. with several enclosures, the first one with a thumbnail, else the first `image/*` one
/// 4. an entry-level `media:thumbnail`
/// 5. a `media:content` with `medium="image"` or an `image/*` type
/// 6. the first `<img src>` in the body
pub fn resolve_thumbnail(media: &EntryMedia, body: &str) -> Option<String> {
    if let Some(primary) = media.enclosures.first() {
        if let Some(thumb) = primary.thumbnail.as_deref() {
            return Some(thumb.to_string());
        }
        if let Some(url) = enclosure_image(primary) {
            return Some(url.to_string());
        }
    }

    if media.enclosures.len() > 1 {
        let from_thumbnail = media.enclosures.iter().find_map(|e| e.thumbnail.as_deref());
        let from_image = || media.enclosures.iter().find_map(enclosure_image);
        if let Some(url) = from_thumbnail.or_else(from_image) {
            return Some(url.to_string());
        }
    }

    if let Some(thumb) = media.thumbnails.first() {
        return Some(thumb.clone());
    }

    let image_content = media.contents.iter().find(|c| {
        c.medium.as_deref().is_some_and(|m| m.eq_ignore_ascii_case("image"))
            || is_image_type(c.mime_type.as_deref())
    });
    if let Some(content) = image_content {
        return Some(content.url.clone());
    }

    first_img_src(body)
}
