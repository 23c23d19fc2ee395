use camino::Utf8PathBuf;
use std::cell::RefCell;

thread_local! {
    static THREAD_HOME: RefCell<Option<Utf8PathBuf>> = const { RefCell::new(None) };
}

/// Resolve studyweave home:
/// 1) thread-local override (tests use this)
/// 2) env `STUDYWEAVE_HOME`
/// 3) default ".studyweave"
#[must_use]
pub fn studyweave_home() -> Utf8PathBuf {
    if let Some(tl) = THREAD_HOME.with(|tl| tl.borrow().clone()) {
        return tl;
    }
    if let Ok(p) = std::env::var("STUDYWEAVE_HOME") {
        return Utf8PathBuf::from(p);
    }
    Utf8PathBuf::from(".studyweave")
}

/// Returns `<STUDYWEAVE_HOME>/cache`
#[must_use]
pub fn cache_dir() -> Utf8PathBuf {
    studyweave_home().join("cache")
}

/// User-level config file, consulted when no project config is found.
///
/// `~/.config/studyweave/config.toml` on Linux, the platform equivalent
/// elsewhere. Skipped entirely while `STUDYWEAVE_HOME` or a test home is set.
#[must_use]
pub fn user_config_file() -> Option<std::path::PathBuf> {
    let overridden = THREAD_HOME.with(|tl| tl.borrow().is_some())
        || std::env::var_os("STUDYWEAVE_HOME").is_some();
    if overridden {
        return None;
    }
    dirs::config_dir().map(|dir| dir.join("studyweave").join("config.toml"))
}

/// mkdir -p; treat `AlreadyExists` as success (removes TOCTTOU races)
pub fn ensure_dir_all<P: AsRef<std::path::Path>>(p: P) -> std::io::Result<()> {
    match std::fs::create_dir_all(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// File-name-safe form of an identifier: anything outside `[A-Za-z0-9._-]`
/// becomes `_`, and leading dots are stripped.
#[must_use]
pub fn sanitize_file_stem(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// RAII guard for isolated home that clears thread-local state on drop
#[cfg(any(test, feature = "test-utils"))]
pub struct HomeGuard {
    inner: tempfile::TempDir,
}

#[cfg(any(test, feature = "test-utils"))]
impl Drop for HomeGuard {
    fn drop(&mut self) {
        THREAD_HOME.with(|tl| *tl.borrow_mut() = None);
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl std::ops::Deref for HomeGuard {
    type Target = tempfile::TempDir;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Test helper: gives the current thread a private home under the system temp dir.
#[cfg(any(test, feature = "test-utils"))]
#[must_use]
pub fn with_isolated_home() -> HomeGuard {
    let td = tempfile::TempDir::new().expect("create temp home");
    let p = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).expect("utf-8 temp path");
    THREAD_HOME.with(|tl| *tl.borrow_mut() = Some(p));
    HomeGuard { inner: td }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolated_home_overrides_default() {
        let guard = with_isolated_home();
        let home = studyweave_home();
        assert_eq!(home.as_std_path(), guard.path());
        assert_eq!(cache_dir(), home.join("cache"));
        assert!(user_config_file().is_none());
    }

    #[test]
    fn test_ensure_dir_all_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let nested = temp.path().join("x/y/z");
        ensure_dir_all(&nested).unwrap();
        ensure_dir_all(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("ch-01"), "ch-01");
        assert_eq!(sanitize_file_stem("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_file_stem("Domain Modeling"), "Domain_Modeling");
        assert_eq!(sanitize_file_stem("..."), "_");
    }
}
