//! Network proxy: every guest `fetch` and every package download goes through here
//!
//! Guest fetches are counted against the per-run request and byte budgets.
//! Package downloads only share the timeout/abort primitive.

use crate::http::{FetchInit, FetchReply, FetchRequest, FetchResponse, HttpMethod, RedirectMode};
use crate::{QuotaPolicy, Result, RunStats, SandboxError, Transport};
use bytes::Bytes;
use std::time::Duration;
use url::Url;

/// Run one exchange with a hard timeout
///
/// On expiry the transfer future is dropped, which aborts it.
pub async fn fetch_with_timeout(
    transport: &dyn Transport,
    request: FetchRequest,
    timeout: Duration,
) -> Result<FetchResponse> {
    let url = request.url.clone();
    match tokio::time::timeout(timeout, transport.fetch(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(message)) => Err(SandboxError::Network(message)),
        Err(_) => Err(SandboxError::RequestTimeout {
            url,
            ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Validate a guest `fetch` call and turn it into a transport request
///
/// Nothing here performs I/O; every rejection happens before the request
/// is counted.
pub fn prepare_request(url: &str, init: &FetchInit, policy: &QuotaPolicy) -> Result<FetchRequest> {
    let parsed = Url::parse(url.trim())
        .map_err(|err| SandboxError::Network(format!("invalid url {url:?}: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SandboxError::Network(format!(
            "unsupported url scheme {:?}",
            parsed.scheme()
        )));
    }

    let method = match init.method.as_deref() {
        None => HttpMethod::Get,
        Some(raw) => raw
            .parse()
            .map_err(|_| SandboxError::Network(format!("unsupported method {raw:?}")))?,
    };

    let redirect = match init.redirect.as_deref() {
        None => RedirectMode::Follow,
        Some(raw) => raw
            .parse()
            .map_err(|_| SandboxError::Network(format!("unsupported redirect mode {raw:?}")))?,
    };

    let policy_max = u32::try_from(policy.net_max_redirects).unwrap_or(u32::MAX);
    let max_redirects = match init.max_redirects {
        Some(requested) if requested < 0 => {
            return Err(SandboxError::Network(format!(
                "maxRedirects must be non-negative, got {requested}"
            )));
        }
        Some(requested) => u32::try_from(requested).unwrap_or(u32::MAX).min(policy_max),
        None => policy_max,
    };

    Ok(FetchRequest {
        method,
        url: parsed.to_string(),
        headers: init.headers.clone(),
        body: init.body.clone().map(Bytes::from),
        redirect,
        max_redirects,
        body_limit: policy.net_max_response_bytes,
    })
}

/// Guest `fetch` with full accounting
///
/// Order of checks: feature flag, request validation, request count
/// (before any I/O), timeout, per-response size, cumulative download size.
pub async fn fetch_bounded(
    transport: &dyn Transport,
    url: &str,
    init: &FetchInit,
    policy: &QuotaPolicy,
    stats: &mut RunStats,
) -> Result<FetchReply> {
    if !policy.net_fetch_enabled {
        return Err(SandboxError::NetFetchDisabled);
    }

    let request = prepare_request(url, init, policy)?;

    if stats.fetch_requests >= policy.net_max_requests_per_run {
        tracing::warn!(limit = policy.net_max_requests_per_run, "fetch request limit reached");
        return Err(SandboxError::RequestLimit(policy.net_max_requests_per_run));
    }
    stats.fetch_requests += 1;

    tracing::debug!(method = %request.method, url = %request.url, "guest fetch");
    let response = match fetch_with_timeout(transport, request, policy.net_request_timeout()).await {
        Ok(response) => response,
        Err(err) => {
            stats.fetch_errors += 1;
            return Err(err);
        }
    };

    let size = response.body.len() as u64;
    if size > policy.net_max_response_bytes {
        stats.fetch_errors += 1;
        return Err(SandboxError::ResponseTooLarge {
            size,
            limit: policy.net_max_response_bytes,
        });
    }

    stats.fetch_bytes += size;
    if stats.fetch_bytes > policy.net_max_total_download_bytes {
        tracing::warn!(
            total = stats.fetch_bytes,
            limit = policy.net_max_total_download_bytes,
            "download budget exceeded"
        );
        return Err(SandboxError::DownloadBudget(policy.net_max_total_download_bytes));
    }

    Ok(FetchReply::from(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticTransport;

    fn policy() -> QuotaPolicy {
        QuotaPolicy {
            net_max_requests_per_run: 2,
            net_max_response_bytes: 10,
            net_max_total_download_bytes: 15,
            ..QuotaPolicy::default()
        }
    }

    fn transport() -> StaticTransport {
        StaticTransport::new()
            .with_text("https://api.test/small", 200, "12345678")
            .with_text("https://api.test/large", 200, "0123456789ABC")
    }

    #[tokio::test]
    async fn test_fetch_counts_requests_and_bytes() {
        let transport = transport();
        let mut stats = RunStats::default();
        let reply = fetch_bounded(
            &transport,
            "https://api.test/small",
            &FetchInit::default(),
            &policy(),
            &mut stats,
        )
        .await
        .unwrap();

        assert_eq!(reply.status, 200);
        assert!(reply.ok);
        assert_eq!(reply.body_text, "12345678");
        assert_eq!(stats.fetch_requests, 1);
        assert_eq!(stats.fetch_bytes, 8);
    }

    #[tokio::test]
    async fn test_request_limit_checked_before_io() {
        let transport = transport();
        let mut stats = RunStats {
            fetch_requests: 2,
            ..RunStats::default()
        };

        let err = fetch_bounded(
            &transport,
            "https://api.test/small",
            &FetchInit::default(),
            &policy(),
            &mut stats,
        )
        .await
        .unwrap_err();

        assert_eq!(err, SandboxError::RequestLimit(2));
        assert!(transport.requested().is_empty());
        assert_eq!(stats.fetch_requests, 2);
    }

    #[tokio::test]
    async fn test_oversized_response_counts_error() {
        let transport = transport();
        let mut stats = RunStats::default();
        let err = fetch_bounded(
            &transport,
            "https://api.test/large",
            &FetchInit::default(),
            &policy(),
            &mut stats,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SandboxError::ResponseTooLarge { size: 13, limit: 10 }));
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(stats.fetch_bytes, 0);
    }

    #[tokio::test]
    async fn test_cumulative_download_budget() {
        let transport = transport();
        let mut stats = RunStats::default();
        let init = FetchInit::default();

        fetch_bounded(&transport, "https://api.test/small", &init, &policy(), &mut stats)
            .await
            .unwrap();
        let err = fetch_bounded(&transport, "https://api.test/small", &init, &policy(), &mut stats)
            .await
            .unwrap_err();

        assert_eq!(err, SandboxError::DownloadBudget(15));
        assert_eq!(stats.fetch_bytes, 16);
        assert_eq!(stats.fetch_requests, 2);
    }

    #[tokio::test]
    async fn test_disabled_flag() {
        let transport = transport();
        let mut stats = RunStats::default();
        let policy = QuotaPolicy {
            net_fetch_enabled: false,
            ..QuotaPolicy::default()
        };

        let err = fetch_bounded(
            &transport,
            "https://api.test/small",
            &FetchInit::default(),
            &policy,
            &mut stats,
        )
        .await
        .unwrap_err();
        assert_eq!(err, SandboxError::NetFetchDisabled);
        assert_eq!(stats, RunStats::default());
    }

    #[tokio::test]
    async fn test_timeout_aborts_and_counts_error() {
        let transport = StaticTransport::new().with_delay(Duration::from_millis(200));
        let mut stats = RunStats::default();
        let policy = QuotaPolicy {
            net_request_timeout_ms: 20,
            ..QuotaPolicy::default()
        };

        let err = fetch_bounded(
            &transport,
            "https://api.test/slow",
            &FetchInit::default(),
            &policy,
            &mut stats,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SandboxError::RequestTimeout { ms: 20, .. }));
        assert_eq!(stats.fetch_requests, 1);
        assert_eq!(stats.fetch_errors, 1);
    }

    #[test]
    fn test_prepare_request_validation() {
        let policy = QuotaPolicy::default();

        let bad_redirect = FetchInit {
            redirect: Some("sometimes".into()),
            ..FetchInit::default()
        };
        assert!(prepare_request("https://a.test/", &bad_redirect, &policy).is_err());

        let negative = FetchInit {
            max_redirects: Some(-1),
            ..FetchInit::default()
        };
        assert!(prepare_request("https://a.test/", &negative, &policy).is_err());

        assert!(prepare_request("file:///etc/passwd", &FetchInit::default(), &policy).is_err());
        assert!(prepare_request("not a url", &FetchInit::default(), &policy).is_err());

        let capped = FetchInit {
            method: Some("post".into()),
            max_redirects: Some(50),
            body: Some("{}".into()),
            ..FetchInit::default()
        };
        let request = prepare_request("https://a.test/x", &capped, &policy).unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.max_redirects, 5);
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }
}
