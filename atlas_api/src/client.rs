//! HTTP client for the Atlas live read endpoints.

use url::Url;

use crate::errors::AtlasError;
use crate::rate_limit::RateLimitInfo;

/// Header carrying the upstream API secret.
pub const SECRET_HEADER: &str = "Abios-Secret";

/// Production Atlas base URL.
pub const DEFAULT_BASE_URL: &str = "https://atlas.abiosgaming.com/v3";

/// Largest `take` value Atlas accepts; anything above is clamped down.
pub const MAX_TAKE: u64 = 50;

/// The three live read endpoints the proxy exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEndpoint {
    Series,
    Players,
    Teams,
}

impl LiveEndpoint {
    /// Path of the endpoint on the Atlas side.
    pub fn upstream_path(&self) -> &'static str {
        match self {
            Self::Series => "/series",
            Self::Players => "/players",
            Self::Teams => "/teams",
        }
    }
}

/// Pagination parameters forwarded to Atlas.
///
/// `take` is clamped to [`MAX_TAKE`] when the query pairs are produced;
/// `skip` is passed through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageQuery {
    pub take: Option<u64>,
    pub skip: Option<u64>,
}

impl PageQuery {
    /// Query pairs for an outgoing live request. `lifecycle=live` is always
    /// present; only live records are ever requested through the proxy.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("lifecycle", "live".to_string())];
        if let Some(take) = self.take {
            pairs.push(("take", take.min(MAX_TAKE).to_string()));
        }
        if let Some(skip) = self.skip {
            pairs.push(("skip", skip.to_string()));
        }
        pairs
    }
}

/// Client for the Atlas API.
///
/// Holds the upstream secret and a shared `reqwest::Client`. Responses are
/// handed back raw; the proxy relays payload bytes and never decodes them.
pub struct AtlasClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl AtlasClient {
    /// Creates a client for the given base URL and upstream secret.
    pub fn new(base_url: &str, secret: &str) -> Result<Self, AtlasError> {
        Url::parse(base_url)?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        })
    }

    /// Fetches one of the live endpoints with the given pagination.
    pub async fn get_live(
        &self,
        endpoint: LiveEndpoint,
        page: &PageQuery,
    ) -> Result<reqwest::Response, AtlasError> {
        let url = format!("{}{}", self.base_url, endpoint.upstream_path());
        let response = self
            .client
            .get(&url)
            .query(&page.to_query_pairs())
            .header(SECRET_HEADER, self.secret.as_str())
            .send()
            .await?;
        Ok(response)
    }

    /// Learns the upstream rate limits by requesting a single live series.
    ///
    /// The response body is discarded; only the rate-limit headers matter.
    /// Any failure here means the proxy cannot know the upstream budget and
    /// must not start.
    pub async fn probe(&self) -> Result<RateLimitInfo, AtlasError> {
        let page = PageQuery {
            take: Some(1),
            skip: None,
        };
        let response = self.get_live(LiveEndpoint::Series, &page).await?;
        let info = RateLimitInfo::from_headers(response.headers())?;
        tracing::debug!(
            limit = info.limit,
            remaining = info.remaining,
            reset_ms = info.reset,
            "probed upstream rate limits"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_clamped_to_the_cap() {
        let page = PageQuery {
            take: Some(120),
            skip: None,
        };
        assert!(page.to_query_pairs().contains(&("take", "50".to_string())));
    }

    #[test]
    fn zero_take_passes_through() {
        let page = PageQuery {
            take: Some(0),
            skip: None,
        };
        assert!(page.to_query_pairs().contains(&("take", "0".to_string())));
    }

    #[test]
    fn skip_is_never_clamped() {
        let page = PageQuery {
            take: None,
            skip: Some(9_999),
        };
        let pairs = page.to_query_pairs();
        assert!(pairs.contains(&("skip", "9999".to_string())));
        assert!(!pairs.iter().any(|(name, _)| *name == "take"));
    }

    #[test]
    fn lifecycle_is_always_live() {
        let pairs = PageQuery::default().to_query_pairs();
        assert_eq!(pairs, vec![("lifecycle", "live".to_string())]);
    }

    #[test]
    fn bad_base_url_is_rejected() {
        assert!(AtlasClient::new("not a url", "secret").is_err());
    }
}
