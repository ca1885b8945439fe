use scraper::{Html, Selector};

use crate::url_utils;

/// Extract outbound link targets from an HTML document, resolved against
/// `base_url` (or a `<base href>` when the document declares one).
///
/// Schemes that can never be crawled (javascript:, mailto:, ...) are dropped
/// here; crawl-eligibility filtering happens at frontier admission.
pub fn extract_links(base_url: &str, html_body: &str) -> Vec<String> {
    let document = Html::parse_document(html_body);

    let base_selector = Selector::parse("base[href]").expect("Invalid CSS selector");
    let effective_base = document
        .select(&base_selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .unwrap_or(base_url)
        .to_string();

    let selector = Selector::parse("a[href]").expect("Invalid CSS selector");

    let mut links = Vec::new();
    for element in document.select(&selector) {
        if let Some(href) = element.value().attr("href") {
            let cleaned_href = href.trim();

            // Skip empty links, javascript links, mailto, tel, etc.
            if cleaned_href.is_empty()
                || cleaned_href.starts_with("javascript:")
                || cleaned_href.starts_with("mailto:")
                || cleaned_href.starts_with("tel:")
                || cleaned_href.starts_with("data:")
                || cleaned_href.starts_with("file:")
            {
                continue;
            }

            if let Ok(absolute) = url_utils::convert_to_absolute_url(cleaned_href, &effective_base)
            {
                links.push(absolute);
            }
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_absolute_links() {
        let html = "<html><body><a href=\"https://example.com/page1\">Link 1</a><a href=\"https://other-site.com/about\">External</a></body></html>";

        let links = extract_links("https://example.com/", html);
        assert_eq!(
            links,
            vec![
                "https://example.com/page1".to_string(),
                "https://other-site.com/about".to_string(),
            ]
        );
    }

    #[test]
    fn test_relative_links_resolve_against_page() {
        let html = "<html><body><a href=\"/about\">About</a><a href=\"child\">Child</a></body></html>";

        let links = extract_links("https://example.com/dir/page", html);
        assert_eq!(
            links,
            vec![
                "https://example.com/about".to_string(),
                "https://example.com/dir/child".to_string(),
            ]
        );
    }

    #[test]
    fn test_base_href_wins() {
        let html = "<html><head><base href=\"https://cdn.example.com/assets/\"></head><body><a href=\"x\">X</a></body></html>";

        let links = extract_links("https://example.com/page", html);
        assert_eq!(links, vec!["https://cdn.example.com/assets/x".to_string()]);
    }

    #[test]
    fn test_unfetchable_schemes_dropped() {
        let html = "<html><body><a href=\"javascript:void(0)\">JS</a><a href=\"mailto:a@b.c\">Mail</a><a href=\"tel:+1\">Tel</a><a href=\"/real\">Real</a></body></html>";

        let links = extract_links("https://example.com/", html);
        assert_eq!(links, vec!["https://example.com/real".to_string()]);
    }

    #[test]
    fn test_malformed_html() {
        let html = "<html><body><a href=\"https://example.com/ok\">Valid<div>Unclosed<p>text</body></html>";

        let links = extract_links("https://example.com/", html);
        assert_eq!(links, vec!["https://example.com/ok".to_string()]);
    }

    #[test]
    fn test_empty_html() {
        assert!(extract_links("https://example.com/", "").is_empty());
    }
}
