//! Entry name handling with safety against path traversal (zip slip).
//!
//! Names read from an archive are untrusted bytes: they may contain `..`
//! segments, absolute paths, backslash separators or drive letters.
//! [`ZipFilePath`] reduces them to a relative, forward-slash form that
//! cannot resolve above the directory it is joined onto. A trailing slash
//! survives normalisation, since that is what marks directory entries.

use crate::errors::{Error, Result};
use std::borrow::Cow;

/// A normalised entry name within a zip archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZipFilePath<'a> {
    data: Cow<'a, str>,
}

impl<'a> ZipFilePath<'a> {
    /// Creates a normalised path from raw archive bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the name contains invalid UTF-8 sequences.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        let name = std::str::from_utf8(data).map_err(Error::InvalidUtf8)?;
        Ok(Self::from_str(name))
    }

    /// Creates a normalised path from a UTF-8 string. Names already in
    /// normal form are borrowed rather than copied.
    #[allow(clippy::should_implement_trait)] // FromStr cannot borrow its input
    pub fn from_str(name: &'a str) -> Self {
        let data = if is_normalized(name) {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(normalize(name))
        };
        ZipFilePath { data }
    }

    /// Returns true if the path represents a directory, determined by a
    /// trailing forward slash.
    pub fn is_dir(&self) -> bool {
        self.data.ends_with('/')
    }

    /// Returns the length of the path in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the path is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Determines whether the name needs the UTF-8 general purpose flag
    /// when written.
    ///
    /// Anything outside the printable code points shared with CP-437,
    /// `[0x20, 0x7d]`, needs the flag. So does a backslash, which several
    /// legacy code pages reassign to other glyphs.
    pub(crate) fn needs_utf8_encoding(&self) -> bool {
        self.data
            .chars()
            .any(|ch| !(0x20..=0x7d).contains(&(ch as u32)) || ch == '\\')
    }

    /// Consumes self to return the underlying string.
    pub fn into_string(self) -> String {
        self.data.into_owned()
    }
}

impl AsRef<str> for ZipFilePath<'_> {
    fn as_ref(&self) -> &str {
        self.data.as_ref()
    }
}

impl std::fmt::Display for ZipFilePath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.data.as_ref())
    }
}

/// True when a name needs no rewriting: forward slashes only, no drive
/// prefix, not absolute, and every segment a plain file name. An empty
/// final segment is the trailing slash of a directory name and is fine;
/// an empty segment anywhere else is a doubled slash.
fn is_normalized(name: &str) -> bool {
    if name.contains(['\\', ':']) || name.starts_with('/') {
        return false;
    }

    let mut segments = name.split('/').peekable();
    while let Some(segment) = segments.next() {
        match segment {
            "." | ".." => return false,
            "" if segments.peek().is_some() => return false,
            _ => {}
        }
    }
    true
}

/// Rewrites a denormalised or hostile name. Backslashes count as
/// separators, anything up to the last colon is a drive or device prefix
/// and is dropped, and `.`/`..` segments are resolved against a segment
/// stack so the result can never climb above the root.
fn normalize(name: &str) -> String {
    let unified = name.replace('\\', "/");
    let trimmed = match unified.rsplit_once(':') {
        Some((_, rest)) => rest,
        None => unified.as_str(),
    };
    let is_dir = trimmed.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut result = segments.join("/");
    if is_dir && !result.is_empty() {
        result.push('/');
    }
    result
}
