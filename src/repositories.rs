use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, DateTime},
    error::{ErrorKind, WriteFailure},
    Client, Collection, Database,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::{
    domain::{BlacklistedToken, GeoPoint, LoginAttempt, User},
    error::RepositoryError,
};

pub const USERS_COLLECTION: &str = "users";
pub const LOGIN_ATTEMPTS_COLLECTION: &str = "login_attempts";
pub const TOKEN_BLACKLIST_COLLECTION: &str = "token_blacklist";
const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug)]
pub struct MongoDbInitializationInfo {
    pub uri: String,
    pub database: String,
}

pub async fn connect(info: &MongoDbInitializationInfo) -> Result<(Client, Database), RepositoryError> {
    let client = Client::with_uri_str(&info.uri).await?;
    let database = client.database(&info.database);
    database.run_command(doc! {"ping": 1}).await?;

    event!(Level::INFO, "Connected to MongoDB database {}", info.database);
    Ok((client, database))
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: User) -> Result<User, RepositoryError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;
    async fn find_by_phone_number(&self, phone_number: &str) -> Result<Option<User>, RepositoryError>;
    async fn find_by_referral_code(&self, referral_code: &str) -> Result<Option<User>, RepositoryError>;
    async fn find_by_email_verification_token(&self, token: &str) -> Result<Option<User>, RepositoryError>;
    async fn find_by_password_reset_token(&self, token: &str) -> Result<Option<User>, RepositoryError>;
    async fn update(&self, user: User) -> Result<User, RepositoryError>;
    /// Active users located within `radius_km` of `point`, nearest first.
    async fn find_nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<User>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoginAttemptRepository: Send + Sync {
    async fn record(&self, attempt: LoginAttempt) -> Result<(), RepositoryError>;
    async fn count_recent_failures(&self, email: &str, since: DateTime) -> Result<u64, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenBlacklistRepository: Send + Sync {
    /// Fails with `Conflict` when the token was already blacklisted, so
    /// two concurrent exchanges of one token cannot both succeed.
    async fn add(&self, token: BlacklistedToken) -> Result<(), RepositoryError>;
    async fn contains(&self, jti: &str) -> Result<bool, RepositoryError>;
}

#[derive(Clone, Default)]
pub struct InMemoryUserRepository {
    users: Arc<Mutex<HashMap<String, User>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        InMemoryUserRepository {
            users: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn find_where<P>(&self, predicate: P) -> Result<Option<User>, RepositoryError>
    where
        P: Fn(&User) -> bool + Send,
    {
        let lock = self.users.lock().await;
        Ok(lock.values().find(|user| predicate(user)).cloned())
    }
}

fn conflict_between(candidate: &User, existing: &User) -> Option<RepositoryError> {
    if candidate.id == existing.id {
        return None;
    }

    if candidate.email == existing.email {
        Some(RepositoryError::Conflict(String::from("User with this email already exists")))
    } else if candidate.phone_number == existing.phone_number {
        Some(RepositoryError::Conflict(String::from("User with this phone number already exists")))
    } else {
        None
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        let mut lock = self.users.lock().await;

        if lock.contains_key(&user.id) {
            return Err(RepositoryError::Conflict(format!("User with id {} already exists", user.id)));
        }
        if let Some(conflict) = lock.values().find_map(|existing| conflict_between(&user, existing)) {
            return Err(conflict);
        }

        lock.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError> {
        let lock = self.users.lock().await;
        Ok(lock.get(id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        self.find_where(|user| user.email == email).await
    }

    async fn find_by_phone_number(&self, phone_number: &str) -> Result<Option<User>, RepositoryError> {
        self.find_where(|user| user.phone_number == phone_number).await
    }

    async fn find_by_referral_code(&self, referral_code: &str) -> Result<Option<User>, RepositoryError> {
        self.find_where(|user| user.profile.referral_code.as_deref() == Some(referral_code))
            .await
    }

    async fn find_by_email_verification_token(&self, token: &str) -> Result<Option<User>, RepositoryError> {
        self.find_where(|user| user.email_verification_token.as_deref() == Some(token))
            .await
    }

    async fn find_by_password_reset_token(&self, token: &str) -> Result<Option<User>, RepositoryError> {
        self.find_where(|user| user.password_reset_token.as_deref() == Some(token))
            .await
    }

    async fn update(&self, user: User) -> Result<User, RepositoryError> {
        let mut lock = self.users.lock().await;

        if !lock.contains_key(&user.id) {
            return Err(RepositoryError::NotFound(format!("User with id {}", user.id)));
        }
        if let Some(conflict) = lock.values().find_map(|existing| conflict_between(&user, existing)) {
            return Err(conflict);
        }

        lock.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn find_nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<User>, RepositoryError> {
        let lock = self.users.lock().await;

        let mut nearby: Vec<(f64, User)> = lock
            .values()
            .filter(|user| user.is_active && user.id != exclude_id)
            .filter_map(|user| {
                user.current_location
                    .map(|location| (location.distance_km(&point), user.clone()))
            })
            .filter(|(distance, _)| *distance <= radius_km)
            .collect();

        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(nearby.into_iter().take(limit).map(|(_, user)| user).collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLoginAttemptRepository {
    attempts: Arc<Mutex<Vec<LoginAttempt>>>,
}

impl InMemoryLoginAttemptRepository {
    pub fn new() -> Self {
        InMemoryLoginAttemptRepository {
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub async fn attempts(&self) -> Vec<LoginAttempt> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl LoginAttemptRepository for InMemoryLoginAttemptRepository {
    async fn record(&self, attempt: LoginAttempt) -> Result<(), RepositoryError> {
        let mut lock = self.attempts.lock().await;
        lock.push(attempt);
        Ok(())
    }

    async fn count_recent_failures(&self, email: &str, since: DateTime) -> Result<u64, RepositoryError> {
        let lock = self.attempts.lock().await;
        Ok(lock
            .iter()
            .filter(|attempt| attempt.email == email && !attempt.success && attempt.attempted_at >= since)
            .count() as u64)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTokenBlacklistRepository {
    tokens: Arc<Mutex<HashMap<String, BlacklistedToken>>>,
}

impl InMemoryTokenBlacklistRepository {
    pub fn new() -> Self {
        InMemoryTokenBlacklistRepository {
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl TokenBlacklistRepository for InMemoryTokenBlacklistRepository {
    async fn add(&self, token: BlacklistedToken) -> Result<(), RepositoryError> {
        let mut lock = self.tokens.lock().await;
        if lock.contains_key(&token.jti) {
            return Err(RepositoryError::Conflict(String::from("Token is blacklisted")));
        }
        lock.insert(token.jti.clone(), token);
        Ok(())
    }

    async fn contains(&self, jti: &str) -> Result<bool, RepositoryError> {
        Ok(self.tokens.lock().await.contains_key(jti))
    }
}

#[derive(Clone)]
pub struct MongoDbUserRepository {
    user_collection: Collection<User>,
}

impl MongoDbUserRepository {
    pub fn new(database: &Database) -> Self {
        MongoDbUserRepository {
            user_collection: database.collection(USERS_COLLECTION),
        }
    }

    async fn find_one_by(&self, field: &str, value: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.user_collection.find_one(doc! {field: value}).await?)
    }
}

/// Client-facing message for a unique index violation on `users`, or `None`
/// when the write error is something else.
fn duplicate_key_message(code: i32, message: &str) -> Option<&'static str> {
    if code != DUPLICATE_KEY_CODE {
        return None;
    }

    if message.contains("phone_number") {
        Some("User with this phone number already exists")
    } else if message.contains("referral_code") {
        Some("Referral code already in use")
    } else {
        Some("User with this email already exists")
    }
}

fn map_write_error(e: mongodb::error::Error) -> RepositoryError {
    if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = e.kind.as_ref() {
        if let Some(message) = duplicate_key_message(write_error.code, &write_error.message) {
            return RepositoryError::Conflict(String::from(message));
        }
    }

    event!(Level::WARN, "MongoDB write failed: {}", e);
    RepositoryError::from(e)
}

#[async_trait]
impl UserRepository for MongoDbUserRepository {
    async fn create(&self, user: User) -> Result<User, RepositoryError> {
        self.user_collection
            .insert_one(&user)
            .await
            .map_err(map_write_error)?;

        Ok(user)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError> {
        self.find_one_by("_id", id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        self.find_one_by("email", email).await
    }

    async fn find_by_phone_number(&self, phone_number: &str) -> Result<Option<User>, RepositoryError> {
        self.find_one_by("phone_number", phone_number).await
    }

    async fn find_by_referral_code(&self, referral_code: &str) -> Result<Option<User>, RepositoryError> {
        self.find_one_by("profile.referral_code", referral_code).await
    }

    async fn find_by_email_verification_token(&self, token: &str) -> Result<Option<User>, RepositoryError> {
        self.find_one_by("email_verification_token", token).await
    }

    async fn find_by_password_reset_token(&self, token: &str) -> Result<Option<User>, RepositoryError> {
        self.find_one_by("password_reset_token", token).await
    }

    async fn update(&self, user: User) -> Result<User, RepositoryError> {
        let result = self
            .user_collection
            .replace_one(doc! {"_id": &user.id}, &user)
            .await
            .map_err(map_write_error)?;

        if result.matched_count == 0 {
            return Err(RepositoryError::NotFound(format!("User with id {}", user.id)));
        }

        Ok(user)
    }

    async fn find_nearby(
        &self,
        point: GeoPoint,
        radius_km: f64,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<User>, RepositoryError> {
        // $nearSphere already orders the cursor by distance.
        let filter = doc! {
            "current_location": {
                "$nearSphere": {
                    "$geometry": {
                        "type": "Point",
                        "coordinates": [point.longitude(), point.latitude()],
                    },
                    "$maxDistance": radius_km * 1000.0,
                }
            },
            "is_active": true,
            "_id": {"$ne": exclude_id},
        };

        let mut cursor = self.user_collection.find(filter).limit(limit as i64).await?;
        let mut users = Vec::new();
        while let Some(user) = cursor.try_next().await? {
            users.push(user);
        }

        Ok(users)
    }
}

#[derive(Clone)]
pub struct MongoDbLoginAttemptRepository {
    attempt_collection: Collection<LoginAttempt>,
}

impl MongoDbLoginAttemptRepository {
    pub fn new(database: &Database) -> Self {
        MongoDbLoginAttemptRepository {
            attempt_collection: database.collection(LOGIN_ATTEMPTS_COLLECTION),
        }
    }
}

#[async_trait]
impl LoginAttemptRepository for MongoDbLoginAttemptRepository {
    async fn record(&self, attempt: LoginAttempt) -> Result<(), RepositoryError> {
        self.attempt_collection.insert_one(&attempt).await?;
        Ok(())
    }

    async fn count_recent_failures(&self, email: &str, since: DateTime) -> Result<u64, RepositoryError> {
        Ok(self
            .attempt_collection
            .count_documents(doc! {
                "email": email,
                "success": false,
                "attempted_at": {"$gte": since},
            })
            .await?)
    }
}

#[derive(Clone)]
pub struct MongoDbTokenBlacklistRepository {
    token_collection: Collection<BlacklistedToken>,
}

impl MongoDbTokenBlacklistRepository {
    pub fn new(database: &Database) -> Self {
        MongoDbTokenBlacklistRepository {
            token_collection: database.collection(TOKEN_BLACKLIST_COLLECTION),
        }
    }
}

#[async_trait]
impl TokenBlacklistRepository for MongoDbTokenBlacklistRepository {
    async fn add(&self, token: BlacklistedToken) -> Result<(), RepositoryError> {
        match self.token_collection.insert_one(&token).await {
            Ok(_) => Ok(()),
            Err(e) => match e.kind.as_ref() {
                ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY_CODE => {
                    Err(RepositoryError::Conflict(String::from("Token is blacklisted")))
                }
                _ => Err(RepositoryError::from(e)),
            },
        }
    }

    async fn contains(&self, jti: &str) -> Result<bool, RepositoryError> {
        Ok(self.token_collection.find_one(doc! {"_id": jti}).await?.is_some())
    }
}
