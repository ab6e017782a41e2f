use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use moka::sync::Cache;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::GatewayError;

const IDENTITY_CACHE_TTL: Duration = Duration::from_secs(60);
const IDENTITY_CACHE_CAPACITY: u64 = 10_000;

/// Who is behind a verified token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    /// Role principals, prefixed with `r/`
    pub prpls: Vec<String>,
    /// Expiry as seconds since the epoch
    pub expires_at: i64,
}

impl Identity {
    fn is_expired(&self) -> bool {
        self.expires_at <= chrono::Utc::now().timestamp()
    }
}

/// Verifies auth tokens and remembers the identities behind them for a short while
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Option<String>,
    cookie_name: String,
    cache: Cache<String, Identity>,
}

impl TokenVerifier {
    pub fn new(secret: Option<String>, cookie_name: &str) -> Self {
        if secret.is_none() {
            warn!("No JWT secret configured, every connection will be rejected");
        }
        Self {
            secret,
            cookie_name: cookie_name.to_string(),
            cache: Cache::builder()
                .max_capacity(IDENTITY_CACHE_CAPACITY)
                .time_to_live(IDENTITY_CACHE_TTL)
                .build(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.auth_jwt_secret.clone(), &config.auth_cookie_name)
    }

    /// Get the auth token from the auth cookie, falling back to a bearer header
    pub fn token_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        for value in headers.get_all(header::COOKIE) {
            let Ok(cookie_header) = value.to_str() else {
                continue;
            };
            for cookie in cookie::Cookie::split_parse(cookie_header).flatten() {
                if cookie.name() == self.cookie_name && !cookie.value().is_empty() {
                    return Some(cookie.value().to_string());
                }
            }
        }

        let auth_header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        auth_header
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .filter(|token| !token.is_empty())
    }

    /// Check signature and expiry of `token` and extract the identity it carries
    pub fn verify(&self, token: &str) -> Result<Identity, GatewayError> {
        if let Some(identity) = self.cache.get(token) {
            if !identity.is_expired() {
                return Ok(identity);
            }
            self.cache.invalidate(token);
        }

        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| GatewayError::AuthenticationFailure("no JWT secret configured".to_string()))?;
        let token_data = validate_jwt(token, secret)
            .map_err(|e| GatewayError::AuthenticationFailure(format!("JWT validation failed: {}", e)))?;

        let uid = token_data
            .claims
            .get("sub")
            .and_then(|v| v.as_str())
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| GatewayError::AuthenticationFailure("token has no subject".to_string()))?
            .to_string();

        let prpls = match token_data.claims.get("roles").and_then(|v| v.as_array()) {
            Some(roles) => roles
                .iter()
                .filter_map(|r| r.as_str())
                .map(|role| format!("r/{}", role))
                .collect(),
            None => Vec::new(),
        };
        let expires_at = token_data.claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);

        info!("JWT token validated successfully for user: {}", uid);
        let identity = Identity { uid, prpls, expires_at };
        self.cache.insert(token.to_string(), identity.clone());
        Ok(identity)
    }

    pub fn cached_identities(&self) -> u64 {
        self.cache.run_pending_tasks();
        let count = self.cache.entry_count();
        debug!("{} identities cached", count);
        count
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}
