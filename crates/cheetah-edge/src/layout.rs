use std::path::{Path, PathBuf};

/// Location of a cache entry: `<root>/<key[0:2]>/<key[2:4]>/<key[4:]>`.
///
/// `content_key` is the validated `{hash}.{ext}` string, so it is ASCII and longer than
/// four characters.
pub fn cache_path(root: &Path, content_key: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    match (content_key.get(0..2), content_key.get(2..4), content_key.get(4..)) {
        (Some(first), Some(second), Some(rest)) if !rest.is_empty() => {
            path.push(first);
            path.push(second);
            path.push(rest);
        }
        _ => path.push(content_key),
    }
    path
}

pub fn image_mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
