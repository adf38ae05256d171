//! JWT claims.

use serde::{Deserialize, Serialize};

/// Claims carried in a Harbor bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The user id this token authenticates.
    pub sub: String,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }
}
