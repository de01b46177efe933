//! Network reachability of remote installer endpoints.
//!
//! Probes go through the same [`Fetcher`] as the build, so the TLS floor and
//! HTTPS-only policy are exercised before any step runs.

use super::CheckResult;
use crate::fetch::Fetcher;
use reqwest::Url;

/// Probe every remote installer URL.
pub async fn check_network(fetcher: &dyn Fetcher, urls: &[&str]) -> Vec<CheckResult> {
    if urls.is_empty() {
        return vec![CheckResult::pass("Network", "no remote installers in recipe")];
    }

    let mut results = Vec::with_capacity(urls.len());
    for url in urls {
        let name = format!("Network ({})", host_of(url));
        let result = match Url::parse(url) {
            Ok(parsed) => match fetcher.probe(&parsed).await {
                Ok(()) => CheckResult::pass(name, format!("{} reachable", url)),
                Err(e) => CheckResult::fail(
                    name,
                    format!("{} unreachable: {}", url, e),
                    "Check your internet connection or try again later",
                ),
            },
            Err(e) => CheckResult::fail(name, format!("invalid URL {}: {}", url, e), "fix the recipe"),
        };
        results.push(result);
    }
    results
}

/// Host part of a URL for display.
fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl Fetcher for Offline {
        async fn fetch(&self, _url: &Url) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Status(503))
        }
        async fn probe(&self, _url: &Url) -> Result<(), FetchError> {
            Err(FetchError::Status(503))
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://sh.rustup.rs/path"), "sh.rustup.rs");
        assert_eq!(host_of("garbage"), "garbage");
    }

    #[tokio::test]
    async fn test_no_urls_passes() {
        let results = check_network(&Offline, &[]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
    }

    #[tokio::test]
    async fn test_unreachable_fails() {
        let results = check_network(&Offline, &["https://sh.rustup.rs"]).await;
        assert!(!results[0].passed);
        assert!(results[0].message.contains("503"));
        assert_eq!(results[0].name, "Network (sh.rustup.rs)");
    }
}
