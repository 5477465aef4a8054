//! Text and URL helpers shared by the fetcher and the registry.
//!
//! - **Text**: control-character stripping, HTML-to-text excerpts, inline image lookup
//! - **URL validation**: scheme and address checks applied when a source is subscribed

mod text;
mod url_validator;

pub use text::{first_img_src, make_excerpt, strip_control_chars, strip_html};
pub use url_validator::{validate_feed_url, UrlValidationError};
