use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use ammonia::Builder;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::{MAX_USERNAME_LENGTH, MIN_USERNAME_LENGTH};
use crate::core::errors::{CoreError, Result};

/// Time source for every timestamp the engine writes.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Strips all markup, leaving plain text.
pub fn sanitize_text(text: &str) -> String {
    Builder::default()
        .tags(HashSet::new())
        .clean(text)
        .to_string()
        .trim()
        .to_string()
}

/// Sanitises optional free text and enforces a length limit. Blank text becomes `None`.
pub fn clean_optional_text(field: &str, text: Option<&str>, max_len: usize) -> Result<Option<String>> {
    let Some(raw) = text else {
        return Ok(None);
    };
    if raw.chars().count() > max_len {
        return Err(CoreError::InvalidInput(format!("{} too long (max {} chars)", field, max_len)));
    }
    let clean = sanitize_text(raw);
    Ok(if clean.is_empty() { None } else { Some(clean) })
}

fn username_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("Regex should compile"))
}

pub fn normalize_username(raw: &str) -> Result<String> {
    let username = raw.trim();
    let len = username.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&len) {
        return Err(CoreError::InvalidInput(format!(
            "Username must be {}-{} characters",
            MIN_USERNAME_LENGTH, MAX_USERNAME_LENGTH
        )));
    }
    if !username_regex().is_match(username) {
        return Err(CoreError::InvalidInput(
            "Username may only contain letters, digits, '_', '.' and '-'".to_string(),
        ));
    }
    Ok(username.to_string())
}

pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(CoreError::InvalidInput("Email is required".to_string())),
    }
}

/// Trims and collapses inner whitespace.
pub fn normalize_species(raw: &str) -> Result<String> {
    let species = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if species.is_empty() {
        return Err(CoreError::InvalidInput("Species is required".to_string()));
    }
    Ok(species)
}
