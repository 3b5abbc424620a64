use serde::{Deserialize, Serialize};

/// Name used when nothing survives directory stripping.
pub const PLACEHOLDER_NAME: &str = "file";
/// Stands in for each run of disallowed characters.
pub const REPLACEMENT: char = '_';

/// Which characters may appear in a landed filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilenamePolicy {
    /// Anything printable except slashes; C0 and C1 control ranges are out.
    #[default]
    Permissive,
    /// ASCII alphanumerics plus `+ - = _ .` and space.
    Strict,
}

impl FilenamePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "permissive" => Some(Self::Permissive),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }

    pub fn allows(self, ch: char) -> bool {
        match self {
            Self::Permissive => {
                let code = ch as u32;
                !(code <= 0x1f || (0x7f..=0x9f).contains(&code) || ch == '/' || ch == '\\')
            }
            Self::Strict => {
                ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '=' | '_' | '.' | ' ')
            }
        }
    }
}

/// Keep only the final path segment, splitting on both slash kinds.
pub fn strip_dirs(raw: &str) -> &str {
    let tail = raw.rsplit('/').next().unwrap_or(raw);
    let tail = tail.rsplit('\\').next().unwrap_or(tail);
    if tail.is_empty() { PLACEHOLDER_NAME } else { tail }
}

/// Collapse every maximal run of disallowed characters into one `_`.
pub fn clean_filename(name: &str, policy: FilenamePolicy) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for ch in name.chars() {
        if policy.allows(ch) {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push(REPLACEMENT);
            in_run = true;
        }
    }
    out
}

/// Map a client-supplied path to a basename that is safe to create in the
/// incoming directory. Total: always returns a non-empty name.
pub fn sanitize(raw: &str, policy: FilenamePolicy) -> String {
    let cleaned = clean_filename(strip_dirs(raw), policy);
    match cleaned.as_str() {
        "" | "." | ".." => PLACEHOLDER_NAME.to_string(),
        _ => cleaned,
    }
}
