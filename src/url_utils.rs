//! URL helper functions used throughout the crawler

use url::Url;

/// Maximum URL length accepted for admission
const MAX_URL_LEN: usize = 500;

/// Normalize a URL into its canonical absolute form.
///
/// Lowercases scheme and host, strips default ports, removes the fragment,
/// and resolves dot-segments in the path. Returns None for unparseable input.
pub fn normalize_url(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url.trim()).ok()?;
    parsed.set_fragment(None);
    // Url::parse already lowercases scheme/host, drops default ports,
    // and resolves "." / ".." path segments.
    Some(parsed.to_string())
}

/// Extract the host portion of a URL
pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_string()))
}

/// Resolve a link against the provided base URL
pub fn convert_to_absolute_url(link: &str, base_url: &str) -> Result<String, String> {
    let base = Url::parse(base_url).map_err(|e| e.to_string())?;
    let absolute_url = base.join(link).map_err(|e| e.to_string())?;
    Ok(absolute_url.to_string())
}

/// Build the robots.txt URL for the given URL's host
pub fn robots_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let scheme = parsed.scheme();
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}/robots.txt", scheme, host, port)),
        None => Some(format!("{}://{}/robots.txt", scheme, host)),
    }
}

/// Determine whether a URL is eligible for admission to the frontier
pub fn should_crawl_url(url: &str) -> bool {
    if url.len() > MAX_URL_LEN {
        return false;
    }

    let parsed_url = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return false,
    };

    // Require HTTP(S)
    if !matches!(parsed_url.scheme(), "http" | "https") {
        return false;
    }

    if parsed_url.host_str().is_none() {
        return false;
    }

    // Skip binary payloads the parser will never extract links from
    let path = parsed_url.path().to_lowercase();
    const DISALLOWED_EXTENSIONS: &[&str] = &[
        ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".css", ".js", ".zip", ".mp4", ".avi",
        ".mov", ".mp3", ".wav", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".tar",
        ".gz", ".tgz", ".bz2", ".7z", ".rar", ".exe", ".msi", ".dmg", ".iso", ".apk",
    ];
    if DISALLOWED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }

    true
}

/// Normalize CLI input by adding https:// when no scheme is provided
pub fn normalize_url_for_cli(url: &str) -> String {
    let trimmed = url.trim();

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }

    format!("https://{}", trimmed)
}

/// Check if a content type represents HTML
pub fn is_html_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
}
