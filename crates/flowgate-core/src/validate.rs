//! Request input validation.
//!
//! Every mutating operation validates before touching remote state, so a bad
//! request never starts a run or burns a transfer. Validators normalize
//! where it is safe (lower-casing ids, trimming text) and reject otherwise.

use crate::error::{FlowError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

pub const PROMPT_MIN_CHARS: usize = 10;
pub const PROMPT_MAX_CHARS: usize = 50_000;
pub const MESSAGE_MAX_CHARS: usize = 10_000;
pub const MAX_EXPECTED_FILES: usize = 20;

pub const ALLOWED_MODELS: &[&str] = &[
    "claude-sonnet-4",
    "claude-haiku-3",
    "claude-opus-3",
    "gpt-4",
    "gpt-3.5-turbo",
];
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";

static SESSION_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("session id regex")
});

static FILE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+\.[a-zA-Z0-9]+$").expect("file name regex"));

static SCRIPT_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script>").expect("script tag regex")
});

/// Normalize and check a session id: canonical lower-case v4 UUID.
pub fn session_id(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_lowercase();
    if !SESSION_ID_RE.is_match(&normalized) {
        return Err(FlowError::Validation("invalid session id".into()));
    }
    Ok(normalized)
}

/// Opaque run ids share the session id format.
pub fn run_id(raw: &str) -> Result<String> {
    session_id(raw).map_err(|_| FlowError::Validation("invalid run id".into()))
}

/// Strip executable fragments a prompt must never carry downstream.
fn strip_active_content(raw: &str) -> String {
    let stripped = SCRIPT_TAG_RE.replace_all(raw, "");
    stripped.replace("javascript:", "").trim().to_string()
}

pub fn prompt(raw: &str) -> Result<String> {
    let cleaned = strip_active_content(raw);
    let len = cleaned.chars().count();
    if len < PROMPT_MIN_CHARS {
        return Err(FlowError::Validation(format!(
            "prompt must be at least {} characters",
            PROMPT_MIN_CHARS
        )));
    }
    if len > PROMPT_MAX_CHARS {
        return Err(FlowError::Validation(format!(
            "prompt must be at most {} characters",
            PROMPT_MAX_CHARS
        )));
    }
    Ok(cleaned)
}

pub fn chat_message(raw: &str) -> Result<String> {
    let cleaned = strip_active_content(raw);
    let len = cleaned.chars().count();
    if len == 0 {
        return Err(FlowError::Validation("message must not be empty".into()));
    }
    if len > MESSAGE_MAX_CHARS {
        return Err(FlowError::Validation(format!(
            "message must be at most {} characters",
            MESSAGE_MAX_CHARS
        )));
    }
    Ok(cleaned)
}

/// A single output file name: `name.ext`, no separators, no traversal.
pub fn file_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.contains("..") || trimmed.contains('/') || trimmed.contains('\\') {
        return Err(FlowError::Validation(format!(
            "invalid file name '{}'",
            trimmed
        )));
    }
    if !FILE_NAME_RE.is_match(trimmed) {
        return Err(FlowError::Validation(format!(
            "invalid file name '{}'",
            trimmed
        )));
    }
    Ok(trimmed.to_lowercase())
}

/// The expected-file list for a phase: bounded, well-formed, duplicate-free.
pub fn expected_files(raw: &[String]) -> Result<Vec<String>> {
    if raw.len() > MAX_EXPECTED_FILES {
        return Err(FlowError::Validation(format!(
            "at most {} expected files per phase",
            MAX_EXPECTED_FILES
        )));
    }
    let mut seen = Vec::with_capacity(raw.len());
    for name in raw {
        let normalized = file_name(name)?;
        if seen.contains(&normalized) {
            return Err(FlowError::Validation(format!(
                "duplicate expected file '{}'",
                normalized
            )));
        }
        seen.push(normalized);
    }
    Ok(seen)
}

/// Resolve the model for a run. Absent means the configured default;
/// anything off the allow list is rejected.
pub fn model(raw: Option<&str>) -> Result<String> {
    match raw {
        None => Ok(DEFAULT_MODEL.to_string()),
        Some(name) => {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Ok(DEFAULT_MODEL.to_string());
            }
            if ALLOWED_MODELS.contains(&trimmed) {
                Ok(trimmed.to_string())
            } else {
                Err(FlowError::Validation(format!(
                    "model '{}' is not supported",
                    trimmed
                )))
            }
        }
    }
}
