use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::{config::JwtConfig, error::AppError, state::AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Claims {
    pub user_id: String,
    pub token_type: TokenType,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Identity of the caller, placed in request extensions by
/// `authentication_middleware`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_lifetime_seconds: i64,
    refresh_token_lifetime_seconds: i64,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        JwtService {
            encoding_key: EncodingKey::from_secret(config.secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret_key.as_bytes()),
            access_token_lifetime_seconds: config.access_token_lifetime_seconds,
            refresh_token_lifetime_seconds: config.refresh_token_lifetime_seconds,
        }
    }

    pub fn issue_pair(&self, user_id: &str) -> Result<TokenPair, AppError> {
        Ok(TokenPair {
            access: self.issue(user_id, TokenType::Access, self.access_token_lifetime_seconds)?,
            refresh: self.issue(user_id, TokenType::Refresh, self.refresh_token_lifetime_seconds)?,
        })
    }

    fn issue(&self, user_id: &str, token_type: TokenType, lifetime_seconds: i64) -> Result<String, AppError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_string(),
            token_type,
            exp: now + lifetime_seconds,
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
    }

    pub fn decode(&self, token: &str, expected: TokenType) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(token_data) => {
                if token_data.claims.token_type != expected {
                    event!(Level::DEBUG, "Rejected {:?} token where {:?} was expected", token_data.claims.token_type, expected);
                    return Err(AppError::Unauthorized(String::from("Token has wrong type")));
                }
                Ok(token_data.claims)
            }
            Err(e) => {
                event!(Level::DEBUG, "Failed to decode token: {}", e);
                Err(AppError::Unauthorized(String::from("Token is invalid or expired")))
            }
        }
    }
}

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed_hash) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok(),
        Err(e) => {
            event!(Level::WARN, "Stored password hash could not be parsed: {}", e);
            false
        }
    }
}

pub async fn authentication_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Get the Authorization header
    let token = match request.headers().get("Authorization") {
        Some(auth_header) => match auth_header.to_str() {
            // Pull the token from 'Bearer <token>'
            Ok(auth_header_str) => match auth_header_str.split_once(' ') {
                Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
                    token.trim().to_string()
                }
                _ => {
                    event!(Level::DEBUG, "Auth header is not a bearer token");
                    return Err(AppError::Unauthorized(String::from("Authorization header must be 'Bearer <token>'")));
                }
            },
            Err(_) => {
                event!(Level::DEBUG, "Auth header not formatted correctly");
                return Err(AppError::Unauthorized(String::from("Authorization header must be 'Bearer <token>'")));
            }
        },
        None => {
            event!(Level::DEBUG, "No auth header found");
            return Err(AppError::Unauthorized(String::from("Authentication credentials were not provided")));
        }
    };

    let claims = state.jwt_service.decode(&token, TokenType::Access)?;
    request.extensions_mut().insert(AuthenticatedUser { user_id: claims.user_id });

    Ok(next.run(request).await)
}
