use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

/// 访问令牌读写错误。
#[derive(Debug)]
pub enum TokenError {
    Io(io::Error),
    Storage(String),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Io(err) => write!(f, "token file error: {}", err),
            TokenError::Storage(msg) => write!(f, "token storage error: {}", msg),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<io::Error> for TokenError {
    fn from(err: io::Error) -> Self {
        TokenError::Io(err)
    }
}

/// 持久化的 Bearer 令牌。每次请求时重新读取，不在内存里缓存。
pub trait TokenStore: Send + 'static {
    fn load(&self) -> Result<Option<String>, TokenError>;
    fn store(&self, token: &str) -> Result<(), TokenError>;
}

/// 以单个文本文件保存令牌（桌面签到站）。
#[derive(Clone, Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<String>, TokenError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(non_empty(&contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, token: &str) -> Result<(), TokenError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, token.trim())?;
        Ok(())
    }
}

/// 去除空白，空串视为未登录。
pub fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_means_no_token() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path().join("token"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn token_is_read_fresh_on_every_load() {
        let dir = TempDir::new().unwrap();
        let store = FileTokenStore::new(dir.path().join("auth").join("token"));
        store.store("  first-token \n").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("first-token"));

        fs::write(store.path(), "second-token").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("second-token"));

        fs::write(store.path(), "   ").unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
