use std::{env, fmt::Display, str::FromStr};

use thiserror::Error;

pub const DEFAULT_DB_NAME: &str = "multiservice_platform";
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Environment variable {0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub connection_string: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub auth_source: String,
    pub database: String,
}

impl MongoConfig {
    /// Builds the URI handed to the driver. An explicit connection string wins
    /// over the individual host/port/credential settings.
    pub fn connection_uri(&self) -> String {
        if let Some(connection_string) = &self.connection_string {
            return connection_string.clone();
        }

        if self.username.is_empty() {
            format!("mongodb://{}:{}/", self.host, self.port)
        } else {
            format!(
                "mongodb://{}:{}@{}:{}/?authSource={}",
                urlencoding::encode(&self.username),
                urlencoding::encode(&self.password),
                self.host,
                self.port,
                self.auth_source
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret_key: String,
    pub access_token_lifetime_seconds: i64,
    pub refresh_token_lifetime_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct RabbitMqConfig {
    pub uri: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mongo: MongoConfig,
    pub jwt: JwtConfig,
    pub rabbitmq: Option<RabbitMqConfig>,
    pub port: u16,
    pub log_path: Option<String>,
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads every setting through `lookup` so tests can feed a fixed map
    /// instead of mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mongo = MongoConfig {
            connection_string: non_empty(lookup("MONGODB_CONNECTION_STRING")),
            host: lookup("MONGODB_HOST").unwrap_or_else(|| String::from("localhost")),
            port: parse_or(&lookup, "MONGODB_PORT", 27017)?,
            username: lookup("MONGODB_USERNAME").unwrap_or_default(),
            password: lookup("MONGODB_PASSWORD").unwrap_or_default(),
            auth_source: lookup("MONGODB_AUTH_SOURCE").unwrap_or_else(|| String::from("admin")),
            database: non_empty(lookup("MONGODB_DB_NAME"))
                .unwrap_or_else(|| String::from(DEFAULT_DB_NAME)),
        };

        let jwt = JwtConfig {
            secret_key: non_empty(lookup("SECRET_KEY")).ok_or(ConfigError::Missing("SECRET_KEY"))?,
            access_token_lifetime_seconds: parse_or(&lookup, "JWT_ACCESS_TOKEN_LIFETIME_SECONDS", 24 * 60 * 60)?,
            refresh_token_lifetime_seconds: parse_or(&lookup, "JWT_REFRESH_TOKEN_LIFETIME_SECONDS", 30 * 24 * 60 * 60)?,
        };

        let rabbitmq = match non_empty(lookup("RABBITMQ_URI")) {
            Some(uri) => Some(RabbitMqConfig {
                uri,
                port: parse_or(&lookup, "RABBITMQ_PORT", 5672)?,
                username: lookup("RABBITMQ_USER").unwrap_or_else(|| String::from("guest")),
                password: lookup("RABBITMQ_PASS").unwrap_or_else(|| String::from("guest")),
            }),
            None => None,
        };

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|| String::from(DEFAULT_CORS_ORIGINS))
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Config {
            mongo,
            jwt,
            rabbitmq,
            port: parse_or(&lookup, "AXUM_PORT", 8000)?,
            log_path: non_empty(lookup("LOG_PATH")),
            cors_allowed_origins,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match non_empty(lookup(key)) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
