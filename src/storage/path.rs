//! S3 location parsing.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{QuarryError, Result};

fn s3_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^s3a?://(?P<bucket>[a-z0-9][a-z0-9.-]*)/?(?P<key>.*)$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// A bucket plus key prefix, e.g. `s3://results/athena/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S3Path {
    bucket: String,
    key: String,
}

impl S3Path {
    /// Parses an `s3://` (or `s3a://`) URL.
    pub fn parse(url: &str) -> Result<Self> {
        let captures = s3_url_pattern().captures(url.trim()).ok_or_else(|| {
            QuarryError::config(format!("Provided path ('{url}') can't be parsed as an S3 URL"))
        })?;

        Ok(Self {
            bucket: captures["bucket"].to_string(),
            key: normalize_key(&captures["key"]),
        })
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key (or key prefix) inside the bucket, without leading or trailing `/`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends a path segment (which may itself contain `/`).
    pub fn join(&self, segment: &str) -> Self {
        let segment = normalize_key(segment);
        let key = match (self.key.is_empty(), segment.is_empty()) {
            (_, true) => self.key.clone(),
            (true, false) => segment,
            (false, false) => format!("{}/{}", self.key, segment),
        };
        Self {
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// Returns the URL with a trailing `/`, as the service expects for
    /// directory-like locations.
    pub fn as_directory(&self) -> String {
        let mut url = self.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }
}

fn normalize_key(key: &str) -> String {
    key.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl FromStr for S3Path {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for S3Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.key)
        }
    }
}
