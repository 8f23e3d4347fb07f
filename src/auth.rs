use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::db::Database;
use crate::errors::{FsError, FsResult};
use crate::models::User;

/// Verify an HTTP Basic `Authorization` header against the users table.
/// Account management lives outside this service; this is just the
/// credential check the WebDAV endpoint delegates to.
pub async fn verify_basic(db: &Database, headers: &HeaderMap) -> FsResult<User> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(FsError::Unauthorized)?;

    let (scheme, param) = header.split_once(' ').ok_or(FsError::Unauthorized)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(FsError::Unauthorized);
    }

    let decoded = STANDARD
        .decode(param.trim())
        .map_err(|_| FsError::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| FsError::Unauthorized)?;
    let (username, password) = decoded.split_once(':').ok_or(FsError::Unauthorized)?;

    let user = db
        .get_user_by_username(username)
        .await
        .map_err(|e| FsError::internal(e.to_string()))?
        .ok_or(FsError::Unauthorized)?;
    if user.disabled {
        return Err(FsError::Unauthorized);
    }

    let valid = bcrypt::verify(password, &user.password_hash).unwrap_or(false);
    if !valid {
        return Err(FsError::Unauthorized);
    }
    Ok(user)
}
