//! Package cache: resolves a spec on the CDN and records it in the ledger

use crate::http::FetchRequest;
use crate::net::fetch_with_timeout;
use crate::resolve::{Cdn, parse_reexport};
use crate::{InstalledPackage, QuotaPolicy, Result, RunStats, RuntimeState, SandboxError, Transport};
use sha2::{Digest, Sha256};
use url::Url;

/// Outcome of [`PackageCache::ensure_installed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub package: InstalledPackage,
    /// Entry source when it was downloaded during this call; `None` on a cache hit
    pub entry_source: Option<String>,
}

impl Installed {
    pub fn is_cache_hit(&self) -> bool {
        self.entry_source.is_none()
    }
}

/// Trim and validate a guest-supplied spec
///
/// Allowed characters: ASCII alphanumerics and `@ / . _ + -`.
pub fn validate_spec(raw: &str, policy: &QuotaPolicy) -> Result<String> {
    let spec = raw.trim();
    if spec.is_empty() {
        return Err(SandboxError::InvalidSpec("spec is empty".into()));
    }
    if spec.chars().count() as u64 > policy.pkg_max_spec_length {
        return Err(SandboxError::InvalidSpec(format!(
            "spec is longer than {} characters",
            policy.pkg_max_spec_length
        )));
    }
    if let Some(bad) = spec
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '@' | '/' | '.' | '_' | '+' | '-')))
    {
        return Err(SandboxError::InvalidSpec(format!(
            "character {bad:?} is not allowed in {spec:?}"
        )));
    }
    Ok(spec.to_string())
}

/// Resolves and records packages for one run
pub struct PackageCache<'a> {
    transport: &'a dyn Transport,
    policy: &'a QuotaPolicy,
    cdn: &'a Cdn,
}

impl<'a> PackageCache<'a> {
    pub fn new(transport: &'a dyn Transport, policy: &'a QuotaPolicy, cdn: &'a Cdn) -> Self {
        Self {
            transport,
            policy,
            cdn,
        }
    }

    /// Return the ledger entry for `spec`, installing it first if needed
    ///
    /// A hit performs no I/O and consumes no quota. A miss counts against
    /// `pkg_max_installs_per_run`, inserts the record, and hands the
    /// updated ledger to `persist` before returning.
    pub async fn ensure_installed(
        &self,
        raw_spec: &str,
        ledger: &mut RuntimeState,
        stats: &mut RunStats,
        persist: &mut dyn FnMut(&RuntimeState),
    ) -> Result<Installed> {
        let spec = validate_spec(raw_spec, self.policy)?;

        if let Some(package) = ledger.get(&spec) {
            tracing::debug!(%spec, "package cache hit");
            return Ok(Installed {
                package: package.clone(),
                entry_source: None,
            });
        }

        if stats.package_installs >= self.policy.pkg_max_installs_per_run {
            tracing::warn!(%spec, limit = self.policy.pkg_max_installs_per_run, "package install limit reached");
            return Err(SandboxError::InstallLimit(self.policy.pkg_max_installs_per_run));
        }

        let (package, source) = self.download(&spec).await?;

        ledger.insert(package.clone());
        stats.package_installs += 1;
        tracing::info!(
            %spec,
            entry = %package.entry_url,
            size = package.size_bytes,
            "package installed"
        );
        persist(ledger);

        Ok(Installed {
            package,
            entry_source: Some(source),
        })
    }

    async fn download(&self, spec: &str) -> Result<(InstalledPackage, String)> {
        let resolve_err = |reason: String| SandboxError::Resolve {
            spec: spec.to_string(),
            reason,
        };

        let index_url = self
            .cdn
            .index_url(spec)
            .map_err(|err| resolve_err(err.to_string()))?;
        let index = self.get(index_url.as_str()).await?;
        if !index.is_success() {
            return Err(resolve_err(format!("index returned HTTP {}", index.status)));
        }

        let resolved_url = Url::parse(&index.final_url).unwrap_or_else(|_| index_url.clone());
        let entry_url = match parse_reexport(&index.text()) {
            Some(target) => self
                .anchor(&resolved_url, &target)
                .map_err(|err| resolve_err(format!("bad entry {target:?}: {err}")))?,
            None => resolved_url.clone(),
        };
        if !self.cdn.owns(&entry_url) {
            return Err(resolve_err(format!("entry {entry_url} is not on the package CDN")));
        }

        let entry = if entry_url == resolved_url {
            index
        } else {
            let entry = self.get(entry_url.as_str()).await?;
            if !entry.is_success() {
                return Err(resolve_err(format!("entry returned HTTP {}", entry.status)));
            }
            entry
        };

        let size = entry.body.len() as u64;
        if size > self.policy.pkg_max_module_bytes {
            return Err(SandboxError::ModuleTooLarge {
                url: entry_url.to_string(),
                size,
                limit: self.policy.pkg_max_module_bytes,
            });
        }

        let sha256 = hex::encode(Sha256::digest(&entry.body));
        let package = InstalledPackage {
            spec: spec.to_string(),
            resolved_url: resolved_url.to_string(),
            entry_url: entry_url.to_string(),
            sha256,
            size_bytes: size,
            installed_at: chrono::Utc::now().to_rfc3339(),
        };
        Ok((package, entry.text()))
    }

    /// Root-relative targets go to the CDN host, relative ones join the index URL
    fn anchor(&self, index: &Url, target: &str) -> std::result::Result<Url, url::ParseError> {
        if target.starts_with('/') && !target.starts_with("//") {
            self.cdn.rebase(target)
        } else {
            index.join(target)
        }
    }

    async fn get(&self, url: &str) -> Result<crate::http::FetchResponse> {
        let max_redirects = u32::try_from(self.policy.net_max_redirects).unwrap_or(u32::MAX);
        let request = FetchRequest::get(url, self.policy.pkg_max_module_bytes, max_redirects);
        fetch_with_timeout(self.transport, request, self.policy.pkg_install_timeout()).await
    }
}
