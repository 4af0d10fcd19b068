//! Per-run module store
//!
//! The interpreter loads modules synchronously, so every module a guest can
//! import is downloaded up front by the host and kept here, keyed by URL.

use crate::http::FetchRequest;
use crate::net::fetch_with_timeout;
use crate::resolve::{Cdn, Locator, resolve_specifier, scan_imports};
use crate::{QuotaPolicy, Result, SandboxError, Transport};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use url::Url;

/// Shared between the session (writer) and the interpreter loader (reader)
pub type SharedModules = Rc<RefCell<ModuleStore>>;

#[derive(Debug, Clone)]
pub struct ModuleStore {
    cdn: Cdn,
    sources: HashMap<String, String>,
    /// `spec` -> entry URL
    aliases: HashMap<String, String>,
    /// module name -> why it could not be made available
    failures: HashMap<String, String>,
    total_bytes: u64,
}

impl ModuleStore {
    pub fn new(cdn: Cdn) -> Self {
        Self {
            cdn,
            sources: HashMap::new(),
            aliases: HashMap::new(),
            failures: HashMap::new(),
            total_bytes: 0,
        }
    }

    pub fn shared(cdn: Cdn) -> SharedModules {
        Rc::new(RefCell::new(Self::new(cdn)))
    }

    pub fn cdn(&self) -> &Cdn {
        &self.cdn
    }

    pub fn contains(&self, url: &str) -> bool {
        self.sources.contains_key(url)
    }

    pub fn source(&self, url: &str) -> Option<&str> {
        self.sources.get(url).map(String::as_str)
    }

    pub fn alias(&self, spec: &str) -> Option<&str> {
        self.aliases.get(spec).map(String::as_str)
    }

    pub fn set_alias(&mut self, spec: impl Into<String>, entry_url: impl Into<String>) {
        self.aliases.insert(spec.into(), entry_url.into());
    }

    pub fn set_failure(&mut self, name: impl Into<String>, message: impl Into<String>) {
        self.failures.insert(name.into(), message.into());
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Add a module, charging its size against the per-run prefetch budget
    pub fn insert(&mut self, url: impl Into<String>, source: String, policy: &QuotaPolicy) -> Result<()> {
        let url = url.into();
        if self.sources.contains_key(&url) {
            return Ok(());
        }

        let size = source.len() as u64;
        if size > policy.pkg_max_module_bytes {
            return Err(SandboxError::ModuleTooLarge {
                url,
                size,
                limit: policy.pkg_max_module_bytes,
            });
        }
        let total = self.total_bytes.saturating_add(size);
        if total > policy.pkg_max_total_install_bytes_per_run {
            return Err(SandboxError::ModuleTooLarge {
                url,
                size: total,
                limit: policy.pkg_max_total_install_bytes_per_run,
            });
        }

        self.total_bytes = total;
        self.sources.insert(url, source);
        Ok(())
    }

    /// Module name the interpreter should register for an import
    ///
    /// Packages map to their entry URL once installed, so relative imports
    /// inside the entry resolve against a real URL.
    pub fn module_name(&self, base: Option<&str>, specifier: &str) -> std::result::Result<String, crate::resolve::ResolveError> {
        match resolve_specifier(&self.cdn, base, specifier)? {
            Locator::Package(spec) => Ok(self
                .alias(&spec)
                .map(str::to_string)
                .unwrap_or_else(|| Locator::Package(spec).module_name())),
            locator @ Locator::Url(_) => Ok(locator.module_name()),
        }
    }

    /// Source for a resolved module name
    pub fn load(&self, name: &str) -> Result<&str> {
        if let Some(source) = self.source(name) {
            return Ok(source);
        }
        if let Some(message) = self.failures.get(name) {
            return Err(SandboxError::ModuleNotFound(format!("{name} ({message})")));
        }
        match name.strip_prefix(crate::resolve::NPM_PREFIX) {
            Some(spec) => Err(SandboxError::ModuleNotFound(format!(
                "{name} (call pkg.install({spec:?}) first)"
            ))),
            None => Err(SandboxError::ModuleNotFound(name.to_string())),
        }
    }
}

/// Download `entry` and everything it statically imports into the store
///
/// `entry_source` skips the first download when the caller already has it.
/// Imports that do not resolve to a CDN URL are left for the loader to
/// reject at import time.
pub async fn prefetch_graph(
    modules: &SharedModules,
    transport: &dyn Transport,
    policy: &QuotaPolicy,
    entry: &Url,
    entry_source: Option<String>,
) -> Result<usize> {
    let cdn = modules.borrow().cdn().clone();
    let mut queue: VecDeque<(Url, Option<String>)> = VecDeque::from([(entry.clone(), entry_source)]);
    let mut added = 0;

    while let Some((url, known)) = queue.pop_front() {
        let key = url.to_string();
        if modules.borrow().contains(&key) {
            continue;
        }

        let source = match known {
            Some(source) => source,
            None => download(transport, policy, &url).await?,
        };

        for specifier in scan_imports(&source) {
            if let Ok(Locator::Url(next)) = resolve_specifier(&cdn, Some(&key), &specifier) {
                if !modules.borrow().contains(next.as_str()) {
                    queue.push_back((next, None));
                }
            }
        }

        modules.borrow_mut().insert(key, source, policy)?;
        added += 1;
    }

    tracing::debug!(entry = %entry, added, "module graph prefetched");
    Ok(added)
}

async fn download(transport: &dyn Transport, policy: &QuotaPolicy, url: &Url) -> Result<String> {
    let max_redirects = u32::try_from(policy.net_max_redirects).unwrap_or(u32::MAX);
    let request = FetchRequest::get(url.as_str(), policy.pkg_max_module_bytes, max_redirects);
    let response = fetch_with_timeout(transport, request, policy.pkg_install_timeout()).await?;
    if !response.is_success() {
        return Err(SandboxError::ModuleNotFound(format!(
            "{url} (HTTP {})",
            response.status
        )));
    }
    if response.body.len() as u64 > policy.pkg_max_module_bytes {
        return Err(SandboxError::ModuleTooLarge {
            url: url.to_string(),
            size: response.body.len() as u64,
            limit: policy.pkg_max_module_bytes,
        });
    }
    Ok(response.text())
}
