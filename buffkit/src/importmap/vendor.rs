//! Module vendoring: downloads, content hashes, filenames.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256, Sha384};

use crate::error::{Error, Result};

/// Download a module.
pub async fn fetch(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::ImportMap(format!("download of '{url}' failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::ImportMap(format!(
            "download of '{url}' returned {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::ImportMap(format!("download of '{url}' failed mid-body: {e}")))?;
    Ok(bytes.to_vec())
}

/// Subresource-integrity hash of vendored content (`sha384-<base64>`).
#[must_use]
pub fn integrity_hash(content: &[u8]) -> String {
    let digest = Sha384::digest(content);
    format!("sha384-{}", STANDARD.encode(digest))
}

/// Local filename for vendored content: the pin name (sanitized) plus the
/// first eight hex chars of the content's SHA-256, keeping the URL's
/// extension when it has one.
#[must_use]
pub fn vendored_filename(name: &str, url: &str, content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let short: String = digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect();

    let base: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();

    let extension = url
        .rsplit('/')
        .next()
        .and_then(|segment| segment.split('?').next())
        .and_then(|segment| segment.rsplit_once('.').map(|(_, ext)| ext))
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()) && ext.len() <= 4)
        .unwrap_or("js");

    format!("{base}-{short}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_format() {
        let hash = integrity_hash(b"export default 1;");
        assert!(hash.starts_with("sha384-"));
        // SHA-384 is 48 bytes, 64 base64 chars.
        assert_eq!(hash.len(), "sha384-".len() + 64);
    }

    #[test]
    fn test_integrity_is_content_addressed() {
        assert_eq!(integrity_hash(b"a"), integrity_hash(b"a"));
        assert_ne!(integrity_hash(b"a"), integrity_hash(b"b"));
    }

    #[test]
    fn test_vendored_filename_shape() {
        let name = vendored_filename("htmx", "https://cdn.example.test/htmx@2.0.js", b"body");
        // name, dash, 8 hex chars, extension from the URL.
        let (stem, ext) = name.rsplit_once('.').unwrap();
        assert_eq!(ext, "js");
        let (base, hash) = stem.rsplit_once('-').unwrap();
        assert_eq!(base, "htmx");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_vendored_filename_sanitizes_name() {
        let name = vendored_filename("@scope/pkg", "https://x.test/mod.mjs", b"body");
        assert!(name.starts_with("-scope-pkg-"));
        assert!(name.ends_with(".mjs"));
    }

    #[test]
    fn test_same_content_same_filename() {
        let a = vendored_filename("m", "https://x.test/m.js", b"same");
        let b = vendored_filename("m", "https://x.test/m.js", b"same");
        assert_eq!(a, b);
    }
}
