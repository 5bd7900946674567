//! Path Handling
//!
//! Block-size hints embedded in remote paths, and the mapping from a remote
//! URL to the names of its local block files.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::info::INFO_EXTENSION;

/// Marker introducing a block-size hint in a remote path
pub const BLOCK_SIZE_TAG: &str = "hdfsbsize=";

/// Extract the block-size hint from a remote path.
///
/// Returns `None` when the path carries no hint. The value runs up to the next
/// `&` or the end of the string and is parsed like C `atoi`: leading decimal
/// digits only, anything else yields 0. Callers must reject 0.
pub fn block_size_from_path(path: &str) -> Option<u64> {
    let start = path.find(BLOCK_SIZE_TAG)? + BLOCK_SIZE_TAG.len();
    let rest = &path[start..];
    let value = match rest.find('&') {
        Some(end) => &rest[..end],
        None => rest,
    };
    Some(parse_leading_digits(value))
}

/// Raw text of the block-size hint, for error messages
pub(crate) fn block_size_hint_text(path: &str) -> &str {
    match path.find(BLOCK_SIZE_TAG) {
        Some(pos) => {
            let rest = &path[pos + BLOCK_SIZE_TAG.len()..];
            rest.split('&').next().unwrap_or(rest)
        }
        None => "",
    }
}

fn parse_leading_digits(value: &str) -> u64 {
    let value = value.trim_start();
    let digits: &str = {
        let end = value
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(value.len());
        &value[..end]
    };
    digits.parse().unwrap_or(0)
}

/// Local path (relative to the cache root) for a remote URL.
///
/// Strips `scheme://host[:port]` and any `?query`, percent-decodes the rest and
/// drops leading slashes. Paths escaping the root with `..` are rejected.
pub fn local_path_for(url: &str) -> Result<PathBuf> {
    let without_scheme = match url.find("://") {
        Some(pos) => {
            let after = &url[pos + 3..];
            match after.find('/') {
                Some(slash) => &after[slash..],
                None => "",
            }
        }
        None => url,
    };
    let without_query = without_scheme
        .split('?')
        .next()
        .unwrap_or(without_scheme);

    let decoded = urlencoding::decode(without_query)
        .map_err(|e| Error::Config(format!("invalid path encoding in {}: {}", url, e)))?;
    let relative = decoded.trim_start_matches('/');
    if relative.is_empty() {
        return Err(Error::Config(format!("no file path in {}", url)));
    }

    let mut out = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::Config(format!(
                    "path {} escapes the cache root",
                    url
                )))
            }
        }
    }
    Ok(out)
}

/// Name of the block file for the block at `offset`: `<base>___<size>_<offset>`
pub fn block_file_name(base: &Path, block_size: u64, offset: u64) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!("___{}_{}", block_size, offset));
    PathBuf::from(name)
}

/// Name of the `.cinfo` record accompanying a data file
pub fn info_file_name(data_file: &Path) -> PathBuf {
    let mut name = data_file.as_os_str().to_owned();
    name.push(INFO_EXTENSION);
    PathBuf::from(name)
}

/// True if `path` names a cache info record
pub fn is_info_file(path: &Path) -> bool {
    path.to_str()
        .map(|s| s.ends_with(INFO_EXTENSION))
        .unwrap_or(false)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_block_size_hint_terminated_by_ampersand() {
        let path = "root://host//store/file.root?hdfsbsize=67108864&other=1";
        assert_eq!(block_size_from_path(path), Some(67_108_864));
    }

    #[test]
    fn test_block_size_hint_at_end() {
        assert_eq!(block_size_from_path("/f?x=1&hdfsbsize=4096"), Some(4096));
    }

    #[test]
    fn test_block_size_hint_absent() {
        assert_eq!(block_size_from_path("/store/file.root"), None);
    }

    #[test]
    fn test_block_size_hint_malformed_is_zero() {
        assert_eq!(block_size_from_path("/f?hdfsbsize=abc"), Some(0));
        assert_eq!(block_size_from_path("/f?hdfsbsize=&a=b"), Some(0));
        assert_eq!(block_size_from_path("/f?hdfsbsize=12kb"), Some(12));
        assert_eq!(block_size_hint_text("/f?hdfsbsize=abc&x"), "abc");
    }

    #[test]
    fn test_local_path_strips_scheme_host_and_query() {
        let path = local_path_for("root://server.example:1094//store/data/run1.root?hdfsbsize=10")
            .unwrap();
        assert_eq!(path, PathBuf::from("store/data/run1.root"));
    }

    #[test]
    fn test_local_path_plain_and_encoded() {
        assert_eq!(
            local_path_for("/data/a%20b.bin").unwrap(),
            PathBuf::from("data/a b.bin")
        );
    }

    #[test]
    fn test_local_path_rejects_escape() {
        assert_matches!(local_path_for("/data/../../etc/passwd"), Err(Error::Config(_)));
        assert_matches!(local_path_for("root://host"), Err(Error::Config(_)));
    }

    #[test]
    fn test_block_file_naming() {
        let name = block_file_name(Path::new("store/run1.root"), 1000, 2000);
        assert_eq!(name, PathBuf::from("store/run1.root___1000_2000"));
        assert_eq!(
            info_file_name(&name),
            PathBuf::from("store/run1.root___1000_2000.cinfo")
        );
        assert!(is_info_file(&info_file_name(&name)));
        assert!(!is_info_file(&name));
    }
}
