use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one image on the remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(u64);

impl DatasetId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for DatasetId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image:{}", self.0)
    }
}

/// Error returned when an object string does not name an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDatasetIdError {
    #[error("expected an image object such as Image:42, got {0:?}")]
    WrongType(String),

    #[error("invalid image id {0:?}")]
    InvalidId(String),
}

/// Parses `Image:42` (type prefix is case-insensitive) or a bare `42`.
impl FromStr for DatasetId {
    type Err = ParseDatasetIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let id = match s.split_once(':') {
            Some((kind, id)) if kind.eq_ignore_ascii_case("image") => id,
            Some(_) => return Err(ParseDatasetIdError::WrongType(s.to_string())),
            None => s,
        };

        id.trim()
            .parse::<u64>()
            .map(DatasetId)
            .map_err(|_| ParseDatasetIdError::InvalidId(id.to_string()))
    }
}
