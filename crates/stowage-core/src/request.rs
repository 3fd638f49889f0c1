//! Save and restore requests.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Request to archive a directory under a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    /// Store location (bucket) to write to.
    pub location: String,
    /// Directory on disk to cache.
    pub dir: PathBuf,
    /// Cache key.
    pub key: String,
}

impl SaveRequest {
    pub fn new(
        location: impl Into<String>,
        dir: impl Into<PathBuf>,
        key: impl Into<String>,
    ) -> Result<Self> {
        let request = Self {
            location: location.into(),
            dir: dir.into(),
            key: key.into(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        require_location(&self.location)?;
        require_dir(&self.dir)?;
        if self.key.is_empty() {
            return Err(Error::InvalidRequest("missing key".into()));
        }
        Ok(())
    }
}

/// Request to restore the freshest of several candidate keys into a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Store location (bucket) to read from.
    pub location: String,
    /// Directory on disk to restore into.
    pub dir: PathBuf,
    /// Candidate keys, most specific first.
    pub keys: Vec<String>,
}

impl RestoreRequest {
    pub fn new(
        location: impl Into<String>,
        dir: impl Into<PathBuf>,
        keys: Vec<String>,
    ) -> Result<Self> {
        let request = Self {
            location: location.into(),
            dir: dir.into(),
            keys,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<()> {
        require_location(&self.location)?;
        require_dir(&self.dir)?;
        if self.keys.is_empty() {
            return Err(Error::InvalidRequest(
                "expected at least one cache key".into(),
            ));
        }
        if let Some(pos) = self.keys.iter().position(String::is_empty) {
            return Err(Error::InvalidRequest(format!(
                "cache key at position {} is empty",
                pos
            )));
        }
        Ok(())
    }
}

fn require_location(location: &str) -> Result<()> {
    if location.is_empty() {
        return Err(Error::InvalidRequest("missing bucket".into()));
    }
    Ok(())
}

fn require_dir(dir: &std::path::Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(Error::InvalidRequest("missing directory".into()));
    }
    Ok(())
}
