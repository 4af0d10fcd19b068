//! Pure module resolution
//!
//! Turning a specifier into a locator never performs I/O, so everything in
//! this module is testable without a network.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Default CDN serving packages as ES modules
pub const DEFAULT_CDN_BASE: &str = "https://esm.sh";

/// Prefix routing a specifier to the package cache
pub const NPM_PREFIX: &str = "npm:";

/// The CDN convention used to locate packages
///
/// The base is validated once in [`Cdn::new`] and kept as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cdn {
    base: String,
}

impl Cdn {
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let base = Url::parse(base)?;
        if base.cannot_be_a_base() || base.host_str().is_none() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
        }
        Ok(Self {
            base: base.to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn base_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.base)
    }

    /// Index document for a package spec: `<base>/<spec>`
    pub fn index_url(&self, spec: &str) -> Result<Url, url::ParseError> {
        self.base_url()?.join(&format!("/{}", spec.trim_start_matches('/')))
    }

    /// Same scheme, host and port as the CDN base
    pub fn owns(&self, url: &Url) -> bool {
        let Ok(base) = self.base_url() else {
            return false;
        };
        url.scheme() == base.scheme()
            && url.host_str() == base.host_str()
            && url.port_or_known_default() == base.port_or_known_default()
    }

    /// Rebase a root-relative path (`/x/y.mjs`) onto the CDN host
    pub fn rebase(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url()?.join(path)
    }
}

impl Default for Cdn {
    fn default() -> Self {
        Self {
            base: format!("{DEFAULT_CDN_BASE}/"),
        }
    }
}

/// Where a module specifier points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// `npm:<spec>`: goes through the package cache
    Package(String),
    /// A module on the CDN
    Url(Url),
}

impl Locator {
    /// Canonical module name used by the interpreter's module map
    pub fn module_name(&self) -> String {
        match self {
            Locator::Package(spec) => format!("{NPM_PREFIX}{spec}"),
            Locator::Url(url) => url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("empty module specifier")]
    Empty,
    #[error("module {0:?} is not on the package CDN")]
    ForeignHost(String),
    #[error("cannot resolve {specifier:?} from {base:?}")]
    NoBase { base: String, specifier: String },
    #[error("unsupported module specifier {0:?}; use \"npm:<package>\"")]
    Unsupported(String),
    #[error("malformed module url {0:?}")]
    Malformed(String),
}

/// Resolve `specifier` as imported from the module named `base`
///
/// Rules, in order:
/// - `npm:<spec>` goes to the package cache
/// - absolute URLs must be on the CDN
/// - `/path` is rebased onto the CDN host
/// - `./x` and `../x` join the importer's URL (a root-relative importer is
///   rebased first); any other importer cannot anchor them
/// - anything else is rejected
pub fn resolve_specifier(cdn: &Cdn, base: Option<&str>, specifier: &str) -> Result<Locator, ResolveError> {
    let specifier = specifier.trim();
    if specifier.is_empty() {
        return Err(ResolveError::Empty);
    }

    if let Some(spec) = specifier.strip_prefix(NPM_PREFIX) {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ResolveError::Empty);
        }
        return Ok(Locator::Package(spec.to_string()));
    }

    if specifier.starts_with("https://") || specifier.starts_with("http://") {
        let url = Url::parse(specifier).map_err(|_| ResolveError::Malformed(specifier.to_string()))?;
        return if cdn.owns(&url) {
            Ok(Locator::Url(url))
        } else {
            Err(ResolveError::ForeignHost(specifier.to_string()))
        };
    }

    if specifier.starts_with('/') && !specifier.starts_with("//") {
        return cdn
            .rebase(specifier)
            .map(Locator::Url)
            .map_err(|_| ResolveError::Malformed(specifier.to_string()));
    }

    if specifier.starts_with("./") || specifier.starts_with("../") {
        let no_base = || ResolveError::NoBase {
            base: base.unwrap_or_default().to_string(),
            specifier: specifier.to_string(),
        };
        let base = base.map(str::trim).ok_or_else(no_base)?;

        let base_url = if base.starts_with('/') && !base.starts_with("//") {
            cdn.rebase(base).map_err(|_| no_base())?
        } else {
            match Url::parse(base) {
                Ok(url) if cdn.owns(&url) => url,
                _ => return Err(no_base()),
            }
        };

        return base_url
            .join(specifier)
            .map(Locator::Url)
            .map_err(|_| ResolveError::Malformed(specifier.to_string()));
    }

    Err(ResolveError::Unsupported(specifier.to_string()))
}

fn reexport_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"export\s*(?:\*|\{[^}]*\})\s*from\s*["']([^"']+)["']"#).ok())
        .as_ref()
}

fn import_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(concat!(
                r#"(?:^|[^\w$.])(?:"#,
                r#"(?:import|export)\s*(?:[\w$*{}\s,]+?)\s*from\s*["']([^"']+)["']"#,
                r#"|import\s*["']([^"']+)["']"#,
                r#"|import\s*\(\s*["']([^"']+)["']\s*\)"#,
                r#")"#,
            ))
            .ok()
        })
        .as_ref()
}

/// First `export * from "…"` / `export {…} from "…"` target in an index document
pub fn parse_reexport(source: &str) -> Option<String> {
    reexport_pattern()?
        .captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Literal specifiers a module imports, in source order, deduplicated
pub fn scan_imports(source: &str) -> Vec<String> {
    let Some(pattern) = import_pattern() else {
        return Vec::new();
    };
    let mut found: Vec<String> = Vec::new();
    for caps in pattern.captures_iter(source) {
        let spec = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string());
        if let Some(spec) = spec {
            if !found.contains(&spec) {
                found.push(spec);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Locator {
        Locator::Url(Url::parse(s).unwrap())
    }

    #[test]
    fn test_npm_prefix() {
        let cdn = Cdn::default();
        assert_eq!(
            resolve_specifier(&cdn, None, "npm:left-pad@1.3.0"),
            Ok(Locator::Package("left-pad@1.3.0".into()))
        );
        assert_eq!(resolve_specifier(&cdn, None, "npm:  "), Err(ResolveError::Empty));
    }

    #[test]
    fn test_absolute_urls_must_be_on_cdn() {
        let cdn = Cdn::default();
        assert_eq!(
            resolve_specifier(&cdn, None, "https://esm.sh/v135/a.mjs"),
            Ok(url("https://esm.sh/v135/a.mjs"))
        );
        assert!(matches!(
            resolve_specifier(&cdn, None, "https://evil.test/a.mjs"),
            Err(ResolveError::ForeignHost(_))
        ));
    }

    #[test]
    fn test_root_relative_rebased() {
        let cdn = Cdn::default();
        assert_eq!(
            resolve_specifier(&cdn, Some("eval_script"), "/v135/left-pad/es2022/left-pad.mjs"),
            Ok(url("https://esm.sh/v135/left-pad/es2022/left-pad.mjs"))
        );
    }

    #[test]
    fn test_relative_against_importer() {
        let cdn = Cdn::default();
        assert_eq!(
            resolve_specifier(&cdn, Some("https://esm.sh/v135/pkg/es2022/index.mjs"), "./util.mjs"),
            Ok(url("https://esm.sh/v135/pkg/es2022/util.mjs"))
        );
        assert_eq!(
            resolve_specifier(&cdn, Some("/v135/pkg/es2022/index.mjs"), "../shared.mjs"),
            Ok(url("https://esm.sh/v135/pkg/shared.mjs"))
        );
        assert!(matches!(
            resolve_specifier(&cdn, Some("npm:pkg"), "./x.mjs"),
            Err(ResolveError::NoBase { .. })
        ));
        assert!(matches!(
            resolve_specifier(&cdn, None, "./x.mjs"),
            Err(ResolveError::NoBase { .. })
        ));
    }

    #[test]
    fn test_bare_and_other_rejected() {
        let cdn = Cdn::default();
        assert!(matches!(
            resolve_specifier(&cdn, None, "lodash"),
            Err(ResolveError::Unsupported(_))
        ));
        assert!(matches!(
            resolve_specifier(&cdn, None, "//esm.sh/x"),
            Err(ResolveError::Unsupported(_))
        ));
        assert!(matches!(
            resolve_specifier(&cdn, None, "file:///etc/passwd"),
            Err(ResolveError::Unsupported(_))
        ));
    }

    #[test]
    fn test_index_url() {
        let cdn = Cdn::new("https://cdn.test/").unwrap();
        assert_eq!(
            cdn.index_url("@scope/pkg@2").unwrap().as_str(),
            "https://cdn.test/@scope/pkg@2"
        );
        assert!(Cdn::new("not a url").is_err());
    }

    #[test]
    fn test_default_cdn_matches_parsed_base() {
        assert_eq!(Cdn::default(), Cdn::new(DEFAULT_CDN_BASE).unwrap());
        assert_eq!(Cdn::default().base(), "https://esm.sh/");
    }

    #[test]
    fn test_patterns_compile() {
        assert!(reexport_pattern().is_some());
        assert!(import_pattern().is_some());
    }

    #[test]
    fn test_parse_reexport() {
        let index = r#"/* esm.sh - left-pad@1.3.0 */
export * from "/v135/left-pad@1.3.0/es2022/left-pad.mjs";
export { default } from "/v135/left-pad@1.3.0/es2022/left-pad.mjs";
"#;
        assert_eq!(
            parse_reexport(index).as_deref(),
            Some("/v135/left-pad@1.3.0/es2022/left-pad.mjs")
        );
        assert_eq!(
            parse_reexport("export {a, b as c} from './x.mjs'").as_deref(),
            Some("./x.mjs")
        );
        assert_eq!(parse_reexport("export default 1;"), None);
    }

    #[test]
    fn test_scan_imports() {
        let source = r#"
import a from "/v135/a.mjs";
import { b, c as d } from './b.mjs';
import * as e from "https://esm.sh/e.mjs";
import "/side-effect.mjs";
export * from "/v135/a.mjs";
const lazy = () => import("./lazy.mjs");
const notAnImport = obj.import("nope");
"#;
        assert_eq!(
            scan_imports(source),
            vec![
                "/v135/a.mjs",
                "./b.mjs",
                "https://esm.sh/e.mjs",
                "/side-effect.mjs",
                "./lazy.mjs",
            ]
        );
    }
}
