// Model store - the managed directory of GGUF files
// Listing, discovery across well-known folders, and guarded deletion

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// File extension of model artifacts (compared case-insensitively)
pub const MODEL_EXTENSION: &str = "gguf";

/// Environment variables that point straight at a model file, first match wins
pub const MODEL_PATH_ENV_VARS: [&str; 3] = ["THONNY_LLAMA_MODEL", "LLAMA_MODEL_PATH", "LLAMA_CPP_MODEL"];

/// Overrides the user data root
pub const USER_DIR_ENV_VAR: &str = "THONNY_USER_DIR";

/// A model file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl ModelArtifact {
    fn from_path(path: PathBuf) -> Option<Self> {
        let metadata = fs::metadata(&path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let file_name = path.file_name()?.to_string_lossy().into_owned();
        Some(Self {
            size_bytes: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
            file_name,
        })
    }

    pub fn size_mib(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

pub fn has_model_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION))
        .unwrap_or(false)
}

/// Regular file with the model extension
pub fn is_probably_model(path: &Path) -> bool {
    has_model_extension(path) && path.is_file()
}

/// The managed models directory.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the host's standard models directory.
    pub fn discover() -> Self {
        Self::new(default_models_dir())
    }

    pub fn resolve_directory(&self) -> &Path {
        &self.dir
    }

    /// Artifacts sorted by file name; empty when the directory does not exist.
    pub fn list_artifacts(&self) -> Vec<ModelArtifact> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut artifacts: Vec<ModelArtifact> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| has_model_extension(path))
            .filter_map(ModelArtifact::from_path)
            .collect();
        artifacts.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        artifacts
    }

    /// Path of the only artifact, if there is exactly one.
    pub fn single_artifact(&self) -> Option<PathBuf> {
        let mut artifacts = self.list_artifacts();
        if artifacts.len() == 1 {
            artifacts.pop().map(|a| a.path)
        } else {
            None
        }
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Whether `path` lies strictly inside the store directory, after
    /// resolving `.` and `..` lexically.
    pub fn contains(&self, path: &Path) -> bool {
        let (Some(dir), Some(candidate)) = (absolute_normalized(&self.dir), absolute_normalized(path)) else {
            return false;
        };
        candidate != dir && candidate.starts_with(&dir)
    }

    /// Whether the folder holding `target` is the store directory or below
    /// it once symlinks are resolved.
    fn resolves_inside(&self, target: &Path) -> bool {
        let Some(parent) = target.parent() else {
            return false;
        };
        match (fs::canonicalize(&self.dir), fs::canonicalize(parent)) {
            (Ok(dir), Ok(parent)) => parent.starts_with(dir),
            _ => false,
        }
    }

    /// Delete an artifact from the store. Returns false, without touching the
    /// filesystem, for anything outside the directory (lexically or through
    /// a symlinked folder), without the model extension, or not a regular
    /// file.
    pub fn delete(&self, path: &Path) -> bool {
        if !self.contains(path) {
            log::warn!("Refusing to delete {}: outside {}", path.display(), self.dir.display());
            return false;
        }
        let Some(target) = absolute_normalized(path) else {
            return false;
        };
        if !self.resolves_inside(&target) {
            log::warn!(
                "Refusing to delete {}: resolves outside {}",
                target.display(),
                self.dir.display()
            );
            return false;
        }
        if !has_model_extension(&target) {
            log::warn!("Refusing to delete {}: not a model file", target.display());
            return false;
        }
        // symlink_metadata so a link inside the store never deletes its target
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.file_type().is_file() => {}
            _ => return false,
        }
        match fs::remove_file(&target) {
            Ok(()) => {
                log::info!("Deleted model file: {}", target.display());
                true
            }
            Err(e) => {
                log::error!("Failed to delete {}: {}", target.display(), e);
                false
            }
        }
    }

    /// The store directory followed by the usual places people keep GGUF files.
    pub fn default_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.dir.clone()];
        if let Some(home) = dirs::home_dir() {
            paths.extend(
                [
                    "models",
                    "Models",
                    "Documents/models",
                    "Documents/Models",
                    "Downloads",
                    ".cache/llama.cpp",
                    ".local/share/llama.cpp",
                    "Library/Application Support/llama.cpp",
                ]
                .iter()
                .map(|rel| home.join(rel)),
            );
        }
        paths
    }

    /// Environment override first, then the newest file in the search paths.
    pub fn find_local_model(&self) -> Option<PathBuf> {
        env_model_override().or_else(|| auto_detect(&self.default_search_paths()))
    }
}

/// Most recently modified model file across `search_paths` (non-recursive).
/// Unreadable or missing directories are skipped.
pub fn auto_detect(search_paths: &[PathBuf]) -> Option<PathBuf> {
    let mut best: Option<ModelArtifact> = None;
    for dir in search_paths {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping {}: {}", dir.display(), e);
                continue;
            }
        };
        for artifact in entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| has_model_extension(path))
            .filter_map(ModelArtifact::from_path)
        {
            // Ties keep the earlier candidate so repeated scans agree
            let newer = best
                .as_ref()
                .map(|b| artifact.modified > b.modified)
                .unwrap_or(true);
            if newer {
                best = Some(artifact);
            }
        }
    }
    best.map(|a| a.path)
}

/// Model file named by one of the override variables, if it exists.
pub fn env_model_override() -> Option<PathBuf> {
    let value = MODEL_PATH_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())?;
    let path = PathBuf::from(value);
    if is_probably_model(&path) {
        Some(path)
    } else {
        log::warn!("Ignoring model override {}: not a .gguf file", path.display());
        None
    }
}

/// `<user data root>/models`
pub fn default_models_dir() -> PathBuf {
    user_data_dir().join("models")
}

/// `THONNY_USER_DIR`, else the per-OS configuration folder.
pub fn user_data_dir() -> PathBuf {
    if let Some(dir) = non_empty_env(USER_DIR_ENV_VAR) {
        return expand_home(&dir);
    }
    let home = dirs::home_dir().unwrap_or_default();
    if cfg!(target_os = "windows") {
        non_empty_env("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("AppData").join("Roaming"))
            .join("Thonny")
    } else if cfg!(target_os = "macos") {
        home.join("Library").join("Thonny")
    } else {
        non_empty_env("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".config"))
            .join("Thonny")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') => {
            let home = dirs::home_dir().unwrap_or_default();
            home.join(rest.trim_start_matches(['/', '\\']))
        }
        _ => PathBuf::from(path),
    }
}

/// Absolute path with `.` and `..` removed, without touching the filesystem.
fn absolute_normalized(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(path: &Path, bytes: usize) {
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .unwrap();
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path().join("models"));
        assert!(store.list_artifacts().is_empty());
        assert_eq!(store.single_artifact(), None);
    }

    #[test]
    fn empty_directory_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path());
        assert!(store.list_artifacts().is_empty());
    }

    #[test]
    fn lists_only_models_sorted_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("zeta.gguf"), 3);
        touch(&tmp.path().join("Alpha.GGUF"), 5);
        touch(&tmp.path().join("notes.txt"), 1);
        fs::create_dir(tmp.path().join("dir.gguf")).unwrap();

        let store = ModelStore::new(tmp.path());
        let artifacts = store.list_artifacts();
        let names: Vec<_> = artifacts.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["Alpha.GGUF", "zeta.gguf"]);
        assert_eq!(artifacts[0].size_bytes, 5);
        assert_eq!(store.single_artifact(), None);
    }

    #[test]
    fn single_artifact_when_exactly_one() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("only.gguf"), 1);
        let store = ModelStore::new(tmp.path());
        assert_eq!(store.single_artifact(), Some(tmp.path().join("only.gguf")));
    }

    #[test]
    fn delete_removes_model_inside_store() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tiny.gguf");
        touch(&path, 8);

        let store = ModelStore::new(tmp.path());
        assert!(store.delete(&path));
        assert!(!path.exists());
        assert!(!store.delete(&path));
    }

    #[test]
    fn delete_rejects_paths_outside_store() {
        let tmp = tempfile::tempdir().unwrap();
        let models = tmp.path().join("models");
        fs::create_dir(&models).unwrap();
        let outside = tmp.path().join("secret.gguf");
        touch(&outside, 4);

        let store = ModelStore::new(&models);
        assert!(!store.delete(&outside));
        assert!(!store.delete(&models.join("..").join("secret.gguf")));
        assert!(!store.delete(&models.join("sub/../../secret.gguf")));
        assert!(!store.delete(&models));
        assert!(outside.exists());
    }

    #[test]
    fn delete_rejects_sibling_with_common_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let models = tmp.path().join("models");
        let sibling = tmp.path().join("models-old");
        fs::create_dir(&models).unwrap();
        fs::create_dir(&sibling).unwrap();
        let victim = sibling.join("x.gguf");
        touch(&victim, 1);

        let store = ModelStore::new(&models);
        assert!(!store.delete(&victim));
        assert!(victim.exists());
    }

    #[cfg(unix)]
    #[test]
    fn delete_rejects_files_behind_a_symlinked_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let models = tmp.path().join("models");
        let elsewhere = tmp.path().join("elsewhere");
        fs::create_dir(&models).unwrap();
        fs::create_dir(&elsewhere).unwrap();
        let victim = elsewhere.join("victim.gguf");
        touch(&victim, 4);
        std::os::unix::fs::symlink(&elsewhere, models.join("link")).unwrap();

        let store = ModelStore::new(&models);
        assert!(store.contains(&models.join("link").join("victim.gguf")));
        assert!(!store.delete(&models.join("link").join("victim.gguf")));
        assert!(victim.exists());
    }

    #[cfg(unix)]
    #[test]
    fn delete_works_through_a_symlinked_store_root() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real-models");
        fs::create_dir(&real).unwrap();
        let model = real.join("tiny.gguf");
        touch(&model, 4);
        let alias = tmp.path().join("models");
        std::os::unix::fs::symlink(&real, &alias).unwrap();

        let store = ModelStore::new(&alias);
        assert!(store.delete(&alias.join("tiny.gguf")));
        assert!(!model.exists());
    }

    #[test]
    fn delete_rejects_non_models_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let text = tmp.path().join("readme.txt");
        touch(&text, 1);
        let dir = tmp.path().join("folder.gguf");
        fs::create_dir(&dir).unwrap();

        let store = ModelStore::new(tmp.path());
        assert!(!store.delete(&text));
        assert!(!store.delete(&dir));
        assert!(!store.delete(&tmp.path().join("missing.gguf")));
        assert!(text.exists());
        assert!(dir.exists());
    }

    #[test]
    fn traversal_normalizes_back_inside() {
        let tmp = tempfile::tempdir().unwrap();
        let models = tmp.path().join("models");
        fs::create_dir_all(models.join("sub")).unwrap();
        let path = models.join("a.gguf");
        touch(&path, 1);

        let store = ModelStore::new(&models);
        assert!(store.delete(&models.join("sub").join("..").join("a.gguf")));
        assert!(!path.exists());
    }

    #[test]
    fn auto_detect_picks_newest_across_directories() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let old = a.path().join("old.gguf");
        let newest = b.path().join("new.gguf");
        let middle = a.path().join("mid.GGUF");
        let ignored = b.path().join("newer.bin");
        for p in [&old, &newest, &middle, &ignored] {
            touch(p, 1);
        }
        set_mtime(&old, 1_000);
        set_mtime(&middle, 2_000);
        set_mtime(&newest, 3_000);
        set_mtime(&ignored, 9_000);

        let paths = vec![
            a.path().join("does-not-exist"),
            a.path().to_path_buf(),
            b.path().to_path_buf(),
        ];
        for _ in 0..3 {
            assert_eq!(auto_detect(&paths), Some(newest.clone()));
        }
    }

    #[test]
    fn auto_detect_without_candidates() {
        let a = tempfile::tempdir().unwrap();
        touch(&a.path().join("weights.bin"), 1);
        assert_eq!(auto_detect(&[a.path().to_path_buf()]), None);
        assert_eq!(auto_detect(&[]), None);
    }

    #[test]
    fn search_paths_start_with_store() {
        let store = ModelStore::new("/opt/models");
        assert_eq!(store.default_search_paths()[0], PathBuf::from("/opt/models"));
    }

    #[test]
    fn normalization_is_lexical() {
        let normalized = absolute_normalized(Path::new("/a/b/./c/../d.gguf")).unwrap();
        assert_eq!(normalized, PathBuf::from("/a/b/d.gguf"));
    }
}
