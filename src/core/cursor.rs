//! Opaque pagination cursors.
//!
//! A cursor carries the sort key of the last item a caller has seen, so the next page
//! starts strictly after it no matter what was inserted in the meantime.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{CoreError, Result};
use crate::models::models::{CatchId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CursorKey {
    Personal {
        logged_at: DateTime<Utc>,
        id: CatchId,
    },
    Nearby {
        /// `f64::to_bits` of the distance, so it survives the round trip exactly.
        distance_bits: u64,
        logged_at: DateTime<Utc>,
        id: CatchId,
    },
    Leaderboard {
        points: u64,
        username: String,
        id: UserId,
    },
}

pub fn encode(key: &CursorKey) -> Result<String> {
    let json = serde_json::to_vec(key).map_err(|_| CoreError::InvalidCursor)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode(raw: &str) -> Result<CursorKey> {
    let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).map_err(|_| CoreError::InvalidCursor)?;
    serde_json::from_slice(&bytes).map_err(|_| CoreError::InvalidCursor)
}

/// Decodes an optional cursor, keeping only keys of the expected mode.
pub fn decode_as<T>(raw: Option<&str>, pick: impl FnOnce(CursorKey) -> Option<T>) -> Result<Option<T>> {
    match raw {
        None => Ok(None),
        Some(raw) => pick(decode(raw)?).map(Some).ok_or(CoreError::InvalidCursor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_survives_exactly() {
        let distance = 1234.567_890_123_f64 / 3.0;
        let key = CursorKey::Nearby {
            distance_bits: distance.to_bits(),
            logged_at: Utc::now(),
            id: CatchId::new(),
        };
        let raw = encode(&key).unwrap();
        match decode(&raw).unwrap() {
            CursorKey::Nearby { distance_bits, .. } => assert_eq!(f64::from_bits(distance_bits), distance),
            other => panic!("wrong mode: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode("not a cursor!"), Err(CoreError::InvalidCursor)));
        let not_json = URL_SAFE_NO_PAD.encode(b"{oops");
        assert!(matches!(decode(&not_json), Err(CoreError::InvalidCursor)));
    }

    #[test]
    fn wrong_mode_is_rejected() {
        let key = CursorKey::Leaderboard {
            points: 3,
            username: "finn".to_string(),
            id: UserId::new(),
        };
        let raw = encode(&key).unwrap();
        let picked = decode_as(Some(raw.as_str()), |k| match k {
            CursorKey::Personal { logged_at, id } => Some((logged_at, id)),
            _ => None,
        });
        assert!(matches!(picked, Err(CoreError::InvalidCursor)));
    }
}
