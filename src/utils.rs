use std::path::PathBuf;
use url::Url;

/// Name used when neither the caller nor the server supplies one.
pub const DEFAULT_FILE_NAME: &str = "update.bin";

pub fn get_filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(|segment| segment.to_string())
}

/// Strips the characters a destination name may never carry (`"` and `;`).
/// An empty result falls back to [`DEFAULT_FILE_NAME`].
pub fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename.chars().filter(|c| *c != '"' && *c != ';').collect();
    let sanitized = sanitized.trim();

    if sanitized.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        sanitized.to_string()
    }
}

/// Extracts the `filename=` parameter from a Content-Disposition header value.
///
/// Quoted values end at the closing quote, bare values at the first `;` or
/// space. Any directory part is dropped so a server cannot steer the write
/// outside the download directory.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let pos = header.to_ascii_lowercase().find("filename=")?;
    let raw = &header[pos + "filename=".len()..];

    let value = if let Some(quoted) = raw.strip_prefix('"') {
        match quoted.find('"') {
            Some(end) => &quoted[..end],
            None => quoted,
        }
    } else {
        let end = raw.find(';').or_else(|| raw.find(' ')).unwrap_or(raw.len());
        &raw[..end]
    };

    let base = value.rsplit(['/', '\\']).next().unwrap_or(value).trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }

    Some(sanitize_filename(base))
}

pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}
