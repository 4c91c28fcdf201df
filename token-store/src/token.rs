use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::EXPIRY_SKEW_SECS;

/// Persisted token material for one endpoint.
///
/// `expires_at` is absolute RFC 3339 so the on-disk form stays meaningful
/// across restarts, unlike the relative `expires_in` the token endpoint
/// returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub issuer: String,
    pub scope: String,
    pub session_id: String,
}

impl Token {
    /// Whether the access token is expired or within the refresh skew.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Utc::now())
    }

    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_at: DateTime<Utc>) -> Token {
        Token {
            access_token: "at".into(),
            refresh_token: None,
            expires_at,
            id_token: None,
            issuer: "https://idp.example".into(),
            scope: "openid".into(),
            session_id: "s".into(),
        }
    }

    #[test]
    fn refresh_applies_sixty_second_skew() {
        let now = Utc::now();
        assert!(!token(now + Duration::seconds(120)).needs_refresh_at(now));
        assert!(token(now + Duration::seconds(30)).needs_refresh_at(now));
        assert!(token(now - Duration::seconds(1)).needs_refresh_at(now));
    }

    #[test]
    fn expires_at_round_trips_as_rfc3339() {
        let original = token(Utc::now());
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("expires_at"));
        let parsed: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
