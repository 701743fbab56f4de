use std::collections::BTreeMap;
use std::path::Path;

/// Project env files in increasing precedence.
const ENV_FILES: [&str; 2] = [".env", ".env.project"];

/// Read `KEY=VALUE` pairs from `.env` and then `.env.project` under `root`.
/// Values from `.env.project` override those from `.env`.
pub fn load_project_env(root: &Path) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for name in ENV_FILES {
        vars.extend(read_env_file(&root.join(name)));
    }
    vars
}

/// Pairs from one dotenv file. A missing file is empty; unreadable files
/// and malformed lines are logged and skipped.
pub fn read_env_file(path: &Path) -> Vec<(String, String)> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Vec::new(),
        Err(e) => {
            tracing::warn!("failed to read {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    iter.filter_map(|item| match item {
        Ok(pair) => Some(pair),
        Err(e) => {
            tracing::warn!("skipping line in {}: {}", path.display(), e);
            None
        }
    })
    .collect()
}

/// Look up a single key with project files taking precedence over the
/// process environment. Empty values count as unset.
pub fn lookup(root: &Path, key: &str) -> Option<String> {
    ENV_FILES
        .iter()
        .rev()
        .find_map(|name| {
            read_env_file(&root.join(name))
                .into_iter()
                .find(|(k, v)| k == key && !v.is_empty())
                .map(|(_, v)| v)
        })
        .or_else(|| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn env_file_handles_comments_and_quotes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".env");
        std::fs::write(&path, "# comment\n\nA=1\nB=\"two words\"\nC='three'\n").unwrap();

        let parsed = read_env_file(&path);
        assert_eq!(
            parsed,
            vec![
                ("A".into(), "1".into()),
                ("B".into(), "two words".into()),
                ("C".into(), "three".into()),
            ]
        );
    }

    #[test]
    fn missing_env_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read_env_file(&tmp.path().join(".env")).is_empty());
        assert!(load_project_env(tmp.path()).is_empty());
    }

    #[test]
    fn project_file_overrides_dotenv() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".env"), "KEY=global\nONLY_GLOBAL=yes\n").unwrap();
        std::fs::write(tmp.path().join(".env.project"), "KEY=project\n").unwrap();

        let vars = load_project_env(tmp.path());
        assert_eq!(vars.get("KEY").map(String::as_str), Some("project"));
        assert_eq!(vars.get("ONLY_GLOBAL").map(String::as_str), Some("yes"));
    }

    #[test]
    fn lookup_prefers_project_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".env"), "ARTEL_TEST_KEY=from-env-file\n").unwrap();
        std::fs::write(tmp.path().join(".env.project"), "ARTEL_TEST_KEY=from-project\n").unwrap();
        assert_eq!(
            lookup(tmp.path(), "ARTEL_TEST_KEY").as_deref(),
            Some("from-project")
        );
    }

    #[test]
    fn lookup_skips_empty_project_value() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(".env"), "ARTEL_EMPTY_KEY=fallback\n").unwrap();
        std::fs::write(tmp.path().join(".env.project"), "ARTEL_EMPTY_KEY=\n").unwrap();
        assert_eq!(
            lookup(tmp.path(), "ARTEL_EMPTY_KEY").as_deref(),
            Some("fallback")
        );
    }
}
