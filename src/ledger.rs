use serde::{Deserialize, Serialize};

/// A package resolved and cached for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPackage {
    /// Exact string the guest requested; identity of the record
    pub spec: String,
    /// Index document URL after redirects
    pub resolved_url: String,
    /// Module the index re-exports (or the index itself)
    pub entry_url: String,
    /// Hex sha256 of the entry source
    pub sha256: String,
    pub size_bytes: u64,
    /// RFC 3339 timestamp
    pub installed_at: String,
}

/// Install ledger owned by the caller between runs
///
/// Kept sorted and unique by `spec`. The sandbox only appends to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredState")]
pub struct RuntimeState {
    packages: Vec<InstalledPackage>,
}

/// Persisted shape; may come back unsorted or with duplicates
#[derive(Deserialize)]
struct StoredState {
    #[serde(default)]
    packages: Vec<InstalledPackage>,
}

impl From<StoredState> for RuntimeState {
    fn from(stored: StoredState) -> Self {
        Self::from_packages(stored.packages)
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from records in any order; later duplicates of a spec are dropped
    pub fn from_packages(packages: impl IntoIterator<Item = InstalledPackage>) -> Self {
        let mut state = Self::new();
        for package in packages {
            state.insert(package);
        }
        state
    }

    pub fn get(&self, spec: &str) -> Option<&InstalledPackage> {
        self.position(spec).ok().map(|idx| &self.packages[idx])
    }

    pub fn contains(&self, spec: &str) -> bool {
        self.position(spec).is_ok()
    }

    /// Insert keeping order; returns false if the spec was already present
    pub fn insert(&mut self, package: InstalledPackage) -> bool {
        match self.position(&package.spec) {
            Ok(_) => false,
            Err(idx) => {
                self.packages.insert(idx, package);
                true
            }
        }
    }

    pub fn packages(&self) -> &[InstalledPackage] {
        &self.packages
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Case-insensitive substring filter on `spec`, in ledger order
    pub fn search(&self, query: Option<&str>) -> Vec<InstalledPackage> {
        let needle = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);

        self.packages
            .iter()
            .filter(|package| match &needle {
                Some(needle) => package.spec.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .cloned()
            .collect()
    }

    fn position(&self, spec: &str) -> Result<usize, usize> {
        self.packages
            .binary_search_by(|package| package.spec.as_str().cmp(spec))
    }
}

#[cfg(test)]
pub(crate) fn sample_package(spec: &str) -> InstalledPackage {
    InstalledPackage {
        spec: spec.to_string(),
        resolved_url: format!("https://esm.sh/{spec}"),
        entry_url: format!("https://esm.sh/{spec}/es2022/{spec}.mjs"),
        sha256: "00".repeat(32),
        size_bytes: 42,
        installed_at: "2024-01-01T00:00:00+00:00".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_sorted_and_unique() {
        let mut state = RuntimeState::new();
        assert!(state.insert(sample_package("zod")));
        assert!(state.insert(sample_package("left-pad")));
        assert!(state.insert(sample_package("dayjs")));
        assert!(!state.insert(sample_package("zod")));

        let specs: Vec<_> = state.packages().iter().map(|p| p.spec.as_str()).collect();
        assert_eq!(specs, vec!["dayjs", "left-pad", "zod"]);
    }

    #[test]
    fn test_search_filters_case_insensitive() {
        let state = RuntimeState::from_packages([
            sample_package("lodash-es"),
            sample_package("Lodash"),
            sample_package("zod"),
        ]);

        let found: Vec<_> = state
            .search(Some("LODASH"))
            .into_iter()
            .map(|p| p.spec)
            .collect();
        assert_eq!(found, vec!["Lodash", "lodash-es"]);
        assert_eq!(state.search(Some("  ")).len(), 3);
        assert_eq!(state.search(None).len(), 3);
    }

    #[test]
    fn test_serde_round_trip_shape() {
        let state = RuntimeState::from_packages([sample_package("left-pad")]);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["packages"][0]["entryUrl"], "https://esm.sh/left-pad/es2022/left-pad.mjs");
        assert_eq!(value["packages"][0]["sizeBytes"], 42);

        let empty: RuntimeState = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());

        let unsorted = serde_json::json!({
            "packages": [sample_package("zod"), sample_package("dayjs"), sample_package("zod")]
        });
        let state: RuntimeState = serde_json::from_value(unsorted).unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.packages()[0].spec, "dayjs");
    }
}
