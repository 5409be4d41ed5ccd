//! Resource identifiers of the form `<scheme>://<path>`

use crate::config::SCHEME;

/// Returns the path of a `fatfs://` identifier, or `None` if it uses another scheme or has none
pub fn fatfs_path(url: &str) -> Option<&str> {
    let (scheme, path) = url.split_once("://")?;
    (scheme == SCHEME).then_some(path)
}
