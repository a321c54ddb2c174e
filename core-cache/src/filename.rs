//! Content-derived cache filenames.
//!
//! A cached filename is a pure function of the locator: the SHA-256 of the
//! full locator in lowercase hex, followed by the extension found in the
//! locator's path. Re-deriving it always yields the same name, which lets the
//! engine detect a payload that is already in place.

use sha2::{Digest, Sha256};

const MAX_EXTENSION_LEN: usize = 5;

/// Derive the cache filename for `locator`.
///
/// `default_extension` is used when the locator path has no usable extension.
///
/// # Example
///
/// ```
/// use core_cache::filename::cache_filename;
///
/// let name = cache_filename("https://cdn.example.com/show/ep1.MP3?token=abc", "mp3");
/// assert!(name.ends_with(".mp3"));
/// assert_eq!(name.len(), 64 + 4);
/// ```
pub fn cache_filename(locator: &str, default_extension: &str) -> String {
    let digest = hex::encode(Sha256::digest(locator.as_bytes()));
    let extension =
        extension_of(locator).unwrap_or_else(|| default_extension.to_ascii_lowercase());
    format!("{}.{}", digest, extension)
}

/// Lowercased extension of the last path segment, if it looks like one.
pub fn extension_of(locator: &str) -> Option<String> {
    let path = path_of(locator);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let (stem, extension) = segment.rsplit_once('.')?;

    if stem.is_empty()
        || extension.is_empty()
        || extension.len() > MAX_EXTENSION_LEN
        || !extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }

    Some(extension.to_ascii_lowercase())
}

/// Path component of a locator with query and fragment removed.
fn path_of(locator: &str) -> &str {
    let end = locator.find(['?', '#']).unwrap_or(locator.len());
    let without_query = &locator[..end];

    match without_query.find("://") {
        Some(scheme_end) => {
            let rest = &without_query[scheme_end + 3..];
            match rest.find('/') {
                Some(path_start) => &rest[path_start..],
                None => "",
            }
        }
        None => without_query,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_locator_same_filename() {
        let locator = "https://cdn.example.com/feeds/42/episode.mp3";
        assert_eq!(cache_filename(locator, "mp3"), cache_filename(locator, "mp3"));
    }

    #[test]
    fn test_distinct_locators_distinct_filenames() {
        let a = cache_filename("https://cdn.example.com/a.mp3", "mp3");
        let b = cache_filename("https://cdn.example.com/b.mp3", "mp3");
        assert_ne!(a, b);
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            cache_filename("abc", "mp3"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad.mp3"
        );
    }

    #[test]
    fn test_extension_extraction() {
        assert_eq!(
            extension_of("https://cdn.example.com/ep.M4A?sig=1#t=30"),
            Some("m4a".to_string())
        );
        assert_eq!(extension_of("https://cdn.example.com/ep"), None);
        assert_eq!(extension_of("https://cdn.example.com"), None);
        assert_eq!(extension_of("https://cdn.example.com/dir.v2/ep"), None);
        assert_eq!(extension_of("https://cdn.example.com/ep.toolong"), None);
        assert_eq!(extension_of("https://cdn.example.com/.hidden"), None);
        assert_eq!(extension_of("/local/files/ep.ogg"), Some("ogg".to_string()));
    }

    #[test]
    fn test_default_extension_applied() {
        let name = cache_filename("https://cdn.example.com/stream?id=7", "MP3");
        assert!(name.ends_with(".mp3"));
    }
}
