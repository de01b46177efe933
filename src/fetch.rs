//! Installer download and integrity verification.
//!
//! Remote installer content is fetched over HTTPS only, with a minimum TLS
//! version enforced by the client, and checked against the step's
//! [`VerificationPolicy`] before it is ever written into an image.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::Url;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::BuilderConfig;
use crate::step::VerificationPolicy;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("refusing non-https URL scheme '{0}'")]
    InsecureScheme(String),

    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("{}", error_chain(.0))]
    Transport(#[from] reqwest::Error),
}

/// Render an error with its full source chain on one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Source of remote installer content.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full body at `url`.
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError>;

    /// Check reachability without downloading the body.
    async fn probe(&self, url: &Url) -> Result<(), FetchError>;
}

/// Production fetcher: rustls, HTTPS-only, TLS floor from config.
pub struct HttpsFetcher {
    client: reqwest::Client,
}

impl HttpsFetcher {
    pub fn new(config: &BuilderConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .min_tls_version(config.min_tls.to_reqwest())
            .timeout(config.fetch_timeout())
            .redirect(Policy::limited(10))
            .user_agent(concat!("envbuild/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn check_scheme(url: &Url) -> Result<(), FetchError> {
        if url.scheme() != "https" {
            return Err(FetchError::InsecureScheme(url.scheme().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for HttpsFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        Self::check_scheme(url)?;
        tracing::debug!(%url, "fetching installer");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        tracing::debug!(%url, bytes = body.len(), "fetched installer");
        Ok(body.to_vec())
    }

    async fn probe(&self, url: &Url) -> Result<(), FetchError> {
        Self::check_scheme(url)?;
        let response = self.client.head(url.clone()).send().await?;
        let status = response.status();
        // Some CDNs reject HEAD; any answer proves TLS and routing work.
        if status.is_server_error() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Outcome of checking content against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verified {
    /// Digest matched.
    Matched(String),
    /// Policy was `insecure-skip`; carries the digest for the record.
    Skipped(String),
}

/// Content did not match the expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityMismatch {
    pub expected: String,
    pub actual: String,
}

/// Check `content` against `policy`.
pub fn verify(policy: &VerificationPolicy, content: &[u8]) -> Result<Verified, IntegrityMismatch> {
    let actual = sha256_hex(content);
    match policy {
        VerificationPolicy::Sha256(expected) => {
            if expected.eq_ignore_ascii_case(&actual) {
                Ok(Verified::Matched(actual))
            } else {
                Err(IntegrityMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                })
            }
        }
        VerificationPolicy::InsecureSkip => Ok(Verified::Skipped(actual)),
    }
}
