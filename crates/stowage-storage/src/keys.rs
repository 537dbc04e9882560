//! Path templates for stored objects.
//!
//! A template is a `/`-separated path with tokens:
//!
//! | token | value |
//! |---|---|
//! | `$DOMAIN` | tenant id |
//! | `$Y` `$M` `$D` `$H` `$m` | UTC year, month, day, hour, minute |
//! | `$CHANNEL` | file channel, `undef` when absent |
//! | `$MIME` | declared MIME type |
//!
//! Anything else, including unknown `$` words, is copied verbatim.

use chrono::{DateTime, Datelike, Timelike, Utc};
use stowage_core::FileMetadata;

use crate::error::{StorageError, StorageResult};

const UNDEFINED_CHANNEL: &str = "undef";

/// Longest tokens first so `$MIME` is not read as `$M` + `IME`.
const TOKENS: [&str; 8] = ["$DOMAIN", "$CHANNEL", "$MIME", "$Y", "$M", "$D", "$H", "$m"];

/// Substitute every token of `pattern` for `file` at time `now`.
pub fn render_pattern(pattern: &str, file: &FileMetadata, now: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(pattern.len() + 16);
    let mut rest = pattern;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match TOKENS.iter().find(|t| tail.starts_with(*t)) {
            Some(token) => {
                match *token {
                    "$DOMAIN" => out.push_str(&file.tenant_id.to_string()),
                    "$CHANNEL" => out.push_str(file.channel.as_deref().unwrap_or(UNDEFINED_CHANNEL)),
                    "$MIME" => out.push_str(&file.mime_type),
                    "$Y" => out.push_str(&now.year().to_string()),
                    "$M" => out.push_str(&now.month().to_string()),
                    "$D" => out.push_str(&now.day().to_string()),
                    "$H" => out.push_str(&now.hour().to_string()),
                    _ => out.push_str(&now.minute().to_string()),
                }
                rest = &tail[token.len()..];
            }
            None => {
                out.push('$');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Normalise a rendered directory: drop empty and `.` segments, refuse `..`.
pub fn clean_directory(rendered: &str) -> StorageResult<String> {
    let mut parts = Vec::new();
    for segment in rendered.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(StorageError::InvalidKey(format!(
                    "path resolves outside storage root: {}",
                    rendered
                )))
            }
            s => parts.push(s),
        }
    }
    Ok(parts.join("/"))
}

/// Object name of `file`, refusing names that would escape their directory.
pub fn object_name(file: &FileMetadata) -> StorageResult<String> {
    let name = file.store_name();
    if matches!(name.as_str(), "" | "." | "..") || name.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidKey(format!(
            "object name contains invalid characters: {}",
            name
        )));
    }
    Ok(name)
}

/// Join a cleaned directory and an object name with `/`.
pub fn join_key(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", directory, name)
    }
}
