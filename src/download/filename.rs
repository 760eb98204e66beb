//! Destination naming for downloads whose target path is a directory.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Resolves the file a session writes to.
///
/// A `path` naming an existing directory receives a file named after the
/// URL's last path segment; any other `path` is used as-is.
#[must_use]
pub(crate) fn resolve_destination(path: &Path, url: &Url) -> PathBuf {
    if path.is_dir() {
        path.join(filename_from_url(url))
    } else {
        path.to_path_buf()
    }
}

/// Filename derived from the URL's last path segment, or `download_<timestamp>.bin`.
pub(crate) fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
        let name = sanitize_filename(&decoded);
        if !name.trim_matches('_').is_empty() {
            return name;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("download_{timestamp}.bin")
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
