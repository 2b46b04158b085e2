//! Access tokens and session refresh.
//!
//! Access is a short-lived HS256 JWT carried as a bearer header (or a
//! `token` query parameter on the WebSocket route). The refresh
//! credential is not a JWT at all: it is the id of a server-side record,
//! carried in an HttpOnly cookie and rotated on every use, so a stolen
//! cookie dies the first time either party refreshes.
//!
//! Sign-in itself happens against an external identity provider and is
//! out of scope here; this module only verifies, refreshes, and revokes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::{extract::FromRequestParts, Extension, Json};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::DbHandle;
use crate::error::AppError;
use crate::repo::Repository;
use crate::state::AppState;

const REFRESH_COOKIE: &str = "refresh_id";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id, as a string.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

pub fn issue_access_token(
    secret: &str,
    user_id: i64,
    email: Option<&str>,
    ttl_secs: i64,
) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl_secs)).timestamp(),
        email: email.map(str::to_string),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

/// Decode and verify. The raw error is returned so callers can tell an
/// expired signature apart from a malformed token; the two get
/// different close codes on the WebSocket side.
pub fn decode_access_token(
    secret: &str,
    token: &str,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

pub fn user_id_from_claims(claims: &Claims) -> Result<i64, AppError> {
    claims
        .sub
        .parse::<i64>()
        .map_err(|_| AppError::Unauthorized("Invalid token payload".into()))
}

// ═══════════════════════════════════════════════════════════════
// Bearer guard
// ═══════════════════════════════════════════════════════════════

/// Extractor for authenticated routes; rejects with 401 before the
/// handler body runs.
pub struct CurrentUser {
    pub user_id: i64,
    pub email: Option<String>,
}

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| AppError::Unauthorized("Missing credentials".into()))?;

        let claims = decode_access_token(&state.config.jwt_secret, token)
            .map_err(|_| AppError::Unauthorized("Invalid access token".into()))?;
        let user_id = user_id_from_claims(&claims)?;

        Ok(CurrentUser {
            user_id,
            email: claims.email,
        })
    }
}

// ═══════════════════════════════════════════════════════════════
// Refresh / logout
// ═══════════════════════════════════════════════════════════════

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn refresh_cookie(id: i64, max_age_secs: i64) -> String {
    format!("{REFRESH_COOKIE}={id}; Max-Age={max_age_secs}; Path=/; HttpOnly; SameSite=Lax")
}

fn clear_refresh_cookie() -> String {
    format!("{REFRESH_COOKIE}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax")
}

/// `POST /api/auth/refresh` — rotate the refresh record and mint a new
/// access token. Any defect in the cookie (absent, unknown, expired,
/// revoked) reads the same from outside.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Extension(db): Extension<Arc<DbHandle>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let refresh_id: i64 = read_cookie(&headers, REFRESH_COOKIE)
        .ok_or_else(|| AppError::Unauthorized("Missing refresh token".into()))?
        .parse()
        .map_err(|_| AppError::Unauthorized("Invalid or expired refresh token".into()))?;

    let repo = Repository::new(db);
    let record = repo
        .get_refresh_token(refresh_id)
        .await?
        .filter(|r| !r.revoked && r.expires_at >= Utc::now())
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired refresh token".into()))?;

    let expires_at = Utc::now() + Duration::seconds(state.config.refresh_ttl);
    let new_id = repo
        .rotate_refresh_token(record.id, record.user_id, record.email.as_deref(), expires_at)
        .await?;
    tracing::info!(user_id = record.user_id, "refresh token rotated");

    let access_token = issue_access_token(
        &state.config.jwt_secret,
        record.user_id,
        record.email.as_deref(),
        state.config.access_ttl,
    )?;

    let body = Json(json!({
        "access_token": access_token,
        "token_type": "bearer",
        "user": { "id": record.user_id, "email": record.email },
    }));
    let cookie = refresh_cookie(new_id, state.config.refresh_ttl);
    Ok(([(header::SET_COOKIE, cookie)], body).into_response())
}

/// `POST /api/auth/logout` — drop the refresh record (if any) and clear
/// the cookie. Always succeeds.
pub async fn logout(
    Extension(db): Extension<Arc<DbHandle>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(raw_id) = read_cookie(&headers, REFRESH_COOKIE) {
        if let Ok(id) = raw_id.parse::<i64>() {
            let repo = Repository::new(db);
            repo.delete_refresh_token(id).await?;
        }
    }
    let body = Json(json!({ "ok": true }));
    Ok(([(header::SET_COOKIE, clear_refresh_cookie())], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::errors::ErrorKind;

    const SECRET: &str = "test-secret";

    #[test]
    fn token_round_trip_preserves_identity() {
        let token = issue_access_token(SECRET, 42, Some("p@example.com"), 60).unwrap();
        let claims = decode_access_token(SECRET, &token).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.email.as_deref(), Some("p@example.com"));
        assert!(claims.exp > Utc::now().timestamp());
        assert_eq!(user_id_from_claims(&claims).unwrap(), 42);
    }

    #[test]
    fn expired_token_reports_expired_signature() {
        let token = issue_access_token(SECRET, 42, None, -10).unwrap();
        let err = decode_access_token(SECRET, &token).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ExpiredSignature));
    }

    #[test]
    fn garbage_token_is_not_reported_as_expired() {
        let err = decode_access_token(SECRET, "not-a-jwt").unwrap_err();
        assert!(!matches!(err.kind(), ErrorKind::ExpiredSignature));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = issue_access_token(SECRET, 42, None, 60).unwrap();
        assert!(decode_access_token("other-secret", &token).is_err());
    }

    #[test]
    fn non_integer_subject_is_rejected() {
        let claims = Claims {
            sub: "abc".into(),
            iat: 0,
            exp: 0,
            email: None,
        };
        assert!(matches!(
            user_id_from_claims(&claims),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; refresh_id=17; lang=fr"),
        );
        assert_eq!(read_cookie(&headers, "refresh_id").as_deref(), Some("17"));
        assert_eq!(read_cookie(&headers, "session"), None);
    }

    #[test]
    fn refresh_cookie_attributes() {
        let set = refresh_cookie(17, 1209600);
        assert!(set.starts_with("refresh_id=17;"));
        assert!(set.contains("HttpOnly"));
        assert!(set.contains("Max-Age=1209600"));

        let clear = clear_refresh_cookie();
        assert!(clear.contains("Max-Age=0"));
    }
}
