//! `package.json` rewriting for the `updating-deps` step.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{CascadeError, CascadeResult};

/// Manifest sections searched for a substituted package.
pub const DEPENDENCY_SECTIONS: [&str; 3] = ["dependencies", "devDependencies", "peerDependencies"];

pub const MANIFEST_FILE: &str = "package.json";

/// Replace `spec` with `version`, keeping a leading `^` or `~`.
pub fn rewrite_spec(spec: &str, version: &str) -> String {
    match spec.chars().next() {
        Some(op @ ('^' | '~')) => format!("{op}{version}"),
        _ => version.to_string(),
    }
}

/// Apply `(package, version)` pairs to a parsed manifest.
///
/// Returns the number of entries changed.
pub fn apply_versions(manifest: &mut Value, versions: &[(String, String)]) -> usize {
    let mut changed = 0;
    for section in DEPENDENCY_SECTIONS {
        let Some(deps) = manifest.get_mut(section).and_then(Value::as_object_mut) else {
            continue;
        };
        for (name, version) in versions {
            if let Some(entry) = deps.get_mut(name) {
                let current = entry.as_str().unwrap_or_default();
                let next = rewrite_spec(current, version);
                if current != next {
                    *entry = Value::String(next);
                    changed += 1;
                }
            }
        }
    }
    changed
}

fn manifest_error(path: &Path, reason: impl std::fmt::Display) -> CascadeError {
    CascadeError::Manifest {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Rewrite `<repo_dir>/package.json` in place.
///
/// Key order is preserved and the file is written back with two-space
/// indentation and a trailing newline. The file is left untouched when
/// nothing changes.
pub async fn update_manifest(repo_dir: &Path, versions: &[(String, String)]) -> CascadeResult<usize> {
    let path: PathBuf = repo_dir.join(MANIFEST_FILE);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| manifest_error(&path, e))?;
    let mut manifest: Value = serde_json::from_str(&raw).map_err(|e| manifest_error(&path, e))?;
    if !manifest.is_object() {
        return Err(manifest_error(&path, "top level is not an object"));
    }

    let changed = apply_versions(&mut manifest, versions);
    if changed > 0 {
        let mut out = serde_json::to_string_pretty(&manifest)?;
        out.push('\n');
        tokio::fs::write(&path, out)
            .await
            .map_err(|e| manifest_error(&path, e))?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rewrite_spec_keeps_range_operator() {
        assert_eq!(rewrite_spec("^1.0.0", "1.2.0"), "^1.2.0");
        assert_eq!(rewrite_spec("~1.0.0", "1.2.0"), "~1.2.0");
        assert_eq!(rewrite_spec("1.0.0", "1.2.0"), "1.2.0");
        assert_eq!(rewrite_spec(">=1", "2.0.0"), "2.0.0");
    }

    #[test]
    fn test_apply_versions_hits_every_section() {
        let mut manifest = json!({
            "name": "lib-c",
            "dependencies": { "@acme/lib-a": "^1.0.0", "lodash": "^4.0.0" },
            "devDependencies": { "@acme/lib-a": "~1.0.0" },
            "peerDependencies": { "@acme/lib-b": "1.0.0" }
        });
        let changed = apply_versions(
            &mut manifest,
            &pairs(&[("@acme/lib-a", "1.3.0"), ("@acme/lib-b", "2.0.0")]),
        );
        assert_eq!(changed, 3);
        assert_eq!(manifest["dependencies"]["@acme/lib-a"], "^1.3.0");
        assert_eq!(manifest["dependencies"]["lodash"], "^4.0.0");
        assert_eq!(manifest["devDependencies"]["@acme/lib-a"], "~1.3.0");
        assert_eq!(manifest["peerDependencies"]["@acme/lib-b"], "2.0.0");
    }

    #[tokio::test]
    async fn test_update_manifest_preserves_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        tokio::fs::write(
            &path,
            r#"{"name":"lib-b","version":"1.0.0","dependencies":{"zeta":"1.0.0","@acme/lib-a":"^1.0.0"}}"#,
        )
        .await
        .unwrap();

        let changed = update_manifest(dir.path(), &pairs(&[("@acme/lib-a", "1.1.0")]))
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.find("\"name\"").unwrap() < text.find("\"version\"").unwrap());
        assert!(text.find("\"zeta\"").unwrap() < text.find("\"@acme/lib-a\"").unwrap());
        assert!(text.contains("\"@acme/lib-a\": \"^1.1.0\""));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = update_manifest(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, CascadeError::Manifest { .. }));
    }

    #[tokio::test]
    async fn test_no_change_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        let original = r#"{"dependencies":{"a":"^2.0.0"}}"#;
        tokio::fs::write(&path, original).await.unwrap();
        let changed = update_manifest(dir.path(), &pairs(&[("a", "2.0.0")]))
            .await
            .unwrap();
        assert_eq!(changed, 0);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), original);
    }
}
