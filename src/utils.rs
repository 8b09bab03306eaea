use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a source's raw frame stream lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locator {
    /// Named FIFO or plain file carrying raw frames
    Path(PathBuf),
    /// `tcp://host:port` byte stream
    Tcp(String),
    /// Built-in test pattern generator, `pattern://<n>`
    Pattern(u32),
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidConfig("empty source locator".into()));
        }

        if let Some(addr) = raw.strip_prefix("tcp://") {
            if addr.rsplit_once(':').is_none() {
                return Err(Error::InvalidConfig(format!(
                    "tcp locator needs host:port, got {}",
                    raw
                )));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }

        if let Some(pattern) = raw.strip_prefix("pattern://") {
            let n = pattern
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("bad pattern locator: {}", raw)))?;
            return Ok(Self::Pattern(n));
        }

        let path = raw.strip_prefix("file://").unwrap_or(raw);
        Ok(Self::Path(PathBuf::from(path)))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            Self::Pattern(n) => write!(f, "pattern://{}", n),
        }
    }
}

/// Name given to source `index` when none is configured.
pub fn default_source_name(index: usize) -> String {
    format!("apphost{}", index + 1)
}

/// FIFO the producing process writes raw frames into.
pub fn default_fifo_path(service_name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/shm/{}_video.fifo", service_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locators() {
        assert_eq!(
            Locator::parse("/dev/shm/apphost1_video.fifo").unwrap(),
            Locator::Path(PathBuf::from("/dev/shm/apphost1_video.fifo"))
        );
        assert_eq!(
            Locator::parse("file:///tmp/a.raw").unwrap(),
            Locator::Path(PathBuf::from("/tmp/a.raw"))
        );
        assert_eq!(
            Locator::parse("tcp://127.0.0.1:2001").unwrap(),
            Locator::Tcp("127.0.0.1:2001".into())
        );
        assert_eq!(Locator::parse("pattern://3").unwrap(), Locator::Pattern(3));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Locator::parse("").is_err());
        assert!(Locator::parse("tcp://nohost").is_err());
        assert!(Locator::parse("pattern://x").is_err());
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(default_source_name(0), "apphost1");
        assert_eq!(
            default_fifo_path("apphost2"),
            PathBuf::from("/dev/shm/apphost2_video.fifo")
        );
        assert_eq!(
            Locator::parse("pattern://7").unwrap().to_string(),
            "pattern://7"
        );
    }
}
