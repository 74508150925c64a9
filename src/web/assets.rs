//! Built-in pages served when storage lacks a file

const ASSETS: &[(&str, &str)] = &[
    ("/index.html", include_str!("../../assets/index.html")),
    ("/toolkit.js", include_str!("../../assets/toolkit.js")),
    ("/toolkit.css", include_str!("../../assets/toolkit.css")),
    ("/upload.html", include_str!("../../assets/upload.html")),
    ("/kiosk.html", include_str!("../../assets/kiosk.html")),
];

/// Built-in content for `path`
pub fn default_asset(path: &str) -> Option<&'static [u8]> {
    ASSETS
        .iter()
        .find(|(name, _)| *name == path)
        .map(|(_, body)| body.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_assets_present() {
        for path in ["/index.html", "/toolkit.js", "/toolkit.css", "/upload.html", "/kiosk.html"] {
            assert!(default_asset(path).is_some_and(|body| !body.is_empty()), "{}", path);
        }
        assert!(default_asset("/favicon.ico").is_none());
    }
}
