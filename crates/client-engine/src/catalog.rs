use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::{LogLevel, StageKind};
use crate::platform::{Analysis, PlatformClient};
use crate::report::Reporter;

/// Read-only mapping `analysis code → { display name → version code }`,
/// populated once per run.
#[derive(Debug, Default)]
pub(crate) struct AnalysisCatalog {
    versions: HashMap<String, HashMap<String, String>>,
}

impl AnalysisCatalog {
    pub(crate) fn from_analyses(list: Vec<Analysis>) -> Self {
        let mut versions: HashMap<String, HashMap<String, String>> = HashMap::new();
        for analysis in list {
            let entry = versions.entry(analysis.code).or_default();
            for version in analysis.versions {
                entry.insert(version.display_name, version.version_code);
            }
        }
        Self { versions }
    }

    /// The opaque code for a display name, if the catalog knows it.
    pub(crate) fn resolve_version(&self, code: &str, display_name: &str) -> Option<&str> {
        self.versions
            .get(code)?
            .get(display_name)
            .map(String::as_str)
    }

    /// Whether `version` is a known display name or version code for `code`.
    pub(crate) fn has_version(&self, code: &str, version: &str) -> bool {
        let Some(entry) = self.versions.get(code) else {
            return false;
        };
        entry.contains_key(version) || entry.values().any(|v| v == version)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// One-shot catalog fetch. Runs concurrently with the archive and upload
/// stages; publishing on `tx` is what releases the submit stage.
pub(crate) async fn run_resolver(
    client: Arc<dyn PlatformClient>,
    requested: Vec<(String, String)>,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
    tx: watch::Sender<Option<Arc<AnalysisCatalog>>>,
) {
    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        res = client.get_analyses() => res,
    };

    let catalog = match fetched {
        Ok(list) => AnalysisCatalog::from_analyses(list),
        Err(err) => {
            reporter.log(
                LogLevel::Warning,
                &format!("analysis catalog fetch failed, version names pass through: {err:#}"),
                StageKind::Submit,
                "",
            );
            AnalysisCatalog::default()
        }
    };

    if !catalog.is_empty() {
        let mut seen = std::collections::HashSet::new();
        for (code, version) in &requested {
            if !seen.insert((code.clone(), version.clone())) {
                continue;
            }
            if !catalog.has_version(code, version) {
                reporter.log(
                    LogLevel::Warning,
                    &format!("analysis version {version:?} not found in catalog for {code:?}"),
                    StageKind::Submit,
                    "",
                );
            }
        }
    }

    let _ = tx.send(Some(Arc::new(catalog)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AnalysisVersion;

    fn catalog() -> AnalysisCatalog {
        AnalysisCatalog::from_analyses(vec![Analysis {
            code: "openfoam".to_string(),
            versions: vec![
                AnalysisVersion {
                    display_name: "v2012".to_string(),
                    version_code: "abc123".to_string(),
                },
                AnalysisVersion {
                    display_name: "v2306".to_string(),
                    version_code: "def456".to_string(),
                },
            ],
        }])
    }

    #[test]
    fn display_names_resolve_to_version_codes() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_version("openfoam", "v2012"), Some("abc123"));
        assert_eq!(catalog.resolve_version("openfoam", "v9999"), None);
        assert_eq!(catalog.resolve_version("starccm", "v2012"), None);
    }

    #[test]
    fn has_version_accepts_display_names_and_codes() {
        let catalog = catalog();
        assert!(catalog.has_version("openfoam", "v2306"));
        assert!(catalog.has_version("openfoam", "def456"));
        assert!(!catalog.has_version("openfoam", "ghi789"));
        assert!(!catalog.has_version("starccm", "v2012"));
    }
}
