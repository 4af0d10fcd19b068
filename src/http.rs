use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// HTTP method enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Redirect handling, mirroring the `redirect` option of `fetch`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    /// Follow up to `max_redirects` hops
    #[default]
    Follow,
    /// Hand the 3xx response back as-is
    Manual,
    /// Fail on the first redirect
    Error,
}

impl std::str::FromStr for RedirectMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow" => Ok(Self::Follow),
            "manual" => Ok(Self::Manual),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

/// `init` argument of guest `fetch`, as received over the bridge
///
/// Everything is loosely typed here; [`crate::net::prepare_request`]
/// validates it before any I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchInit {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub redirect: Option<String>,
    pub max_redirects: Option<i64>,
}

/// One outbound HTTP exchange handed to a [`crate::Transport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    pub redirect: RedirectMode,
    pub max_redirects: u32,
    /// Transports may stop reading once the body is longer than this
    pub body_limit: u64,
}

impl FetchRequest {
    /// Plain GET used for package and module downloads
    pub fn get(url: impl Into<String>, body_limit: u64, max_redirects: u32) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            redirect: RedirectMode::Follow,
            max_redirects,
            body_limit,
        }
    }
}

/// Buffered response returned by a [`crate::Transport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// URL after redirects
    pub final_url: String,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response shape handed back to the guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReply {
    pub status: u16,
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub body_text: String,
    pub final_url: String,
}

impl From<FetchResponse> for FetchReply {
    fn from(response: FetchResponse) -> Self {
        let ok = response.is_success();
        let body_text = response.text();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers {
            headers
                .entry(name.to_lowercase())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        Self {
            status: response.status,
            ok,
            headers,
            body_text,
            final_url: response.final_url,
        }
    }
}
