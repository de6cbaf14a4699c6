//! Path normalization and project identifiers.
//!
//! Two encodings of a project path live side by side:
//! - the producer's on-disk directory name (`/Users/foo/app` → `-Users-foo-app`),
//!   which is lossy and only decoded best-effort;
//! - the project id used by this crate's read API, a base64url slug of the
//!   normalized path, which round-trips exactly and is safe in URLs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::path::PathBuf;

/// `~/.claude/history.jsonl`, the append-only prompt log.
pub fn default_history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("history.jsonl"))
}

/// `~/.claude/projects`, the root of per-project transcript folders.
pub fn default_projects_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("projects"))
}

/// Canonicalize a project path string without touching the filesystem.
///
/// Backslashes become `/`, repeated separators and `.` segments collapse,
/// and a trailing separator is dropped (the root `/` is kept).
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return String::new();
    }

    let absolute = unified.starts_with('/');
    let joined = unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");

    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// URL-safe, reversible identifier for a project path.
pub fn project_id(path: &str) -> String {
    URL_SAFE_NO_PAD.encode(normalize_path(path))
}

/// Inverse of [`project_id`]. Returns `None` for ids this crate never issued.
pub fn project_path_from_id(id: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(id).ok()?;
    String::from_utf8(bytes).ok()
}

/// Human-readable project name: the last non-empty path segment.
pub fn display_name(path: &str) -> String {
    let normalized = normalize_path(path);
    normalized
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or(normalized)
}

/// Directory name the log producer uses for a project path.
pub fn encode_dir_name(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Resolved project path information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProject {
    /// The full filesystem path (e.g., "/Users/foo/my-project")
    pub full_path: String,
    /// Human-readable display name (e.g., "my-project")
    pub display_name: String,
}

/// Best-effort decode of an on-disk project directory name.
///
/// Hyphens in real directory names are indistinguishable from encoded
/// separators, so several joinings are generated and the first one that
/// exists on this machine wins. Otherwise the all-separators reading is used.
pub async fn resolve_dir_name(encoded_name: &str) -> ResolvedProject {
    if encoded_name.is_empty() {
        return ResolvedProject {
            full_path: String::new(),
            display_name: String::new(),
        };
    }

    let variants = join_variants(encoded_name);
    let mut chosen = None;
    for variant in &variants {
        if tokio::fs::try_exists(variant).await.unwrap_or(false) {
            chosen = Some(variant.clone());
            break;
        }
    }
    let chosen = chosen
        .or_else(|| variants.first().cloned())
        .unwrap_or_default();

    ResolvedProject {
        display_name: display_name(&chosen),
        full_path: chosen,
    }
}

/// Candidate paths for an encoded directory name, most literal first.
///
/// `-Users-foo-my-project` yields `/Users/foo/my/project`, then variants
/// that keep the last two, three or four segments hyphenated.
pub fn join_variants(encoded_name: &str) -> Vec<String> {
    let name = encoded_name.strip_prefix('-').unwrap_or(encoded_name);
    if name.is_empty() {
        return vec!["/".to_string()];
    }

    let parts: Vec<&str> = name.split('-').collect();
    let mut variants = vec![format!("/{}", parts.join("/"))];

    for kept in 2..=4 {
        if parts.len() < kept + 1 {
            break;
        }
        let split = parts.len() - kept;
        let variant = format!("/{}/{}", parts[..split].join("/"), parts[split..].join("-"));
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }

    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/Users/foo/app/"), "/Users/foo/app");
        assert_eq!(normalize_path("/Users//foo/./app"), "/Users/foo/app");
        assert_eq!(normalize_path("C:\\work\\app"), "C:/work/app");
        assert_eq!(normalize_path("  /p  "), "/p");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_project_id_round_trip() {
        let id = project_id("/Users/foo/my project/");
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(project_path_from_id(&id).as_deref(), Some("/Users/foo/my project"));
    }

    #[test]
    fn test_project_id_rejects_garbage() {
        assert_eq!(project_path_from_id("!!not-base64!!"), None);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("/Users/foo/my-project"), "my-project");
        assert_eq!(display_name("/Users/foo/my-project/"), "my-project");
        assert_eq!(display_name("/"), "/");
    }

    #[test]
    fn test_encode_dir_name() {
        assert_eq!(encode_dir_name("/Users/foo/my_app"), "-Users-foo-my-app");
    }

    #[test]
    fn test_join_variants() {
        let variants = join_variants("-Users-foo-my-project");
        assert_eq!(variants[0], "/Users/foo/my/project");
        assert!(variants.contains(&"/Users/foo/my-project".to_string()));
        assert!(variants.contains(&"/Users/foo-my-project".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_dir_name_fallback() {
        let resolved = resolve_dir_name("proj-a").await;
        assert_eq!(resolved.full_path, "/proj/a");
        assert_eq!(resolved.display_name, "a");
        assert_eq!(resolve_dir_name("").await.full_path, "");
    }

    #[tokio::test]
    async fn test_resolve_dir_name_prefers_existing_directory() {
        let tmp = tempfile::Builder::new().prefix("resolve").tempdir().unwrap();
        // Hyphens or dots above the project are not recoverable from the encoding.
        let base = tmp.path().to_string_lossy();
        if !base.chars().all(|c| c == '/' || c.is_ascii_alphanumeric()) {
            return;
        }
        let real = tmp.path().join("my-project");
        std::fs::create_dir_all(&real).unwrap();
        let encoded = encode_dir_name(&real.to_string_lossy());

        let resolved = resolve_dir_name(&encoded).await;
        assert_eq!(resolved.full_path, real.to_string_lossy());
        assert_eq!(resolved.display_name, "my-project");
    }
}
