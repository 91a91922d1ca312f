//! Object key validation and canonicalization.
//!
//! Every user-supplied key passes through [`normalize_key`] before it
//! reaches the coordinator:
//!
//! - only ASCII letters, digits, space, backslash and `. _ / : -` are
//!   accepted;
//! - any run of two or more `/` collapses to a single `/`;
//! - one leading and one trailing `/` are stripped.
//!
//! A key that is empty after stripping is rejected.

use crate::errors::UploadError;

/// Maximum key length in bytes accepted by S3-compatible stores.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Return `true` if `c` belongs to the allowed key alphabet.
fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '\\' | '/' | '.' | '_' | ':' | '-')
}

/// Check a candidate key against the allowed alphabet without modifying it.
pub fn is_valid_key(name: &str) -> bool {
    name.chars().all(is_allowed_char)
}

/// Collapse every run of two or more slashes into one.
fn collapse_separators(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_slash = false;
    for c in name.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Validate and canonicalize an object key.
///
/// Fails with [`UploadError::InvalidName`] carrying the original input
/// when the key contains a character outside the alphabet, exceeds
/// [`MAX_KEY_LENGTH`], or is empty once the outer separators are removed.
pub fn normalize_key(name: &str) -> Result<String, UploadError> {
    let invalid = || UploadError::InvalidName {
        name: name.to_string(),
    };

    if !is_valid_key(name) || name.len() > MAX_KEY_LENGTH {
        return Err(invalid());
    }

    let collapsed = collapse_separators(name);
    let trimmed = collapsed.strip_prefix('/').unwrap_or(&collapsed);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(invalid());
    }

    Ok(trimmed.to_string())
}
