use std::sync::Arc;

use chrono::NaiveDate;
use mongodb::bson::DateTime;
use serde_valid::Validate;
use tracing::{event, Level};

use crate::{
    auth::{hash_password, verify_password, Claims, JwtService, TokenPair, TokenType},
    domain::{
        generate_referral_code, generate_token, normalize_email, BlacklistedToken, LoginAttempt, User, UserAddress,
        UserType,
    },
    dtos::{
        to_point, AddAddressRequest, AddressListResponse, AddressResponse, AuthResponse, LoginRequest, LogoutRequest,
        MessageResponse, NearbyUserResponse, NearbyUsersParams, NearbyUsersResponse, PasswordResetConfirmRequest,
        PasswordResetRequest, RegisterRequest, Response, UpdateProfileRequest, UserResponse, VerifyEmailRequest,
    },
    error::{AppError, RepositoryError},
    events::Event,
    metrics::{LoginOutcome, MetricsService},
    uow::RepositoryContext,
};

pub const MAX_FAILED_LOGIN_ATTEMPTS: u64 = 5;
const FAILED_LOGIN_WINDOW_MILLIS: i64 = 60 * 60 * 1000;
pub const NEARBY_USERS_PAGE_SIZE: usize = 20;
pub const DEFAULT_NEARBY_RADIUS_KM: f64 = 5.0;
pub const MAX_NEARBY_RADIUS_KM: f64 = 50.0;
const REFERRAL_CODE_ATTEMPTS: usize = 10;

// traits
pub trait Command {}
pub trait Query {}

pub trait CommandHandler<C: Command, R: Response> {
    async fn handle(&self, input: &C) -> Result<R, AppError>;
}

pub trait QueryHandler<Q: Query, R: Response> {
    async fn handle(&self, input: &Q) -> Result<R, AppError>;
}

// commands
pub struct RegisterUserCommand {
    pub request: RegisterRequest,
}
impl Command for RegisterUserCommand {}

pub struct LoginCommand {
    pub request: LoginRequest,
    pub ip_address: String,
    pub user_agent: Option<String>,
}
impl Command for LoginCommand {}

pub struct RefreshTokenCommand {
    pub refresh: String,
}
impl Command for RefreshTokenCommand {}

pub struct LogoutCommand {
    pub request: LogoutRequest,
}
impl Command for LogoutCommand {}

pub struct UpdateProfileCommand {
    pub user_id: String,
    pub request: UpdateProfileRequest,
}
impl Command for UpdateProfileCommand {}

pub struct AddAddressCommand {
    pub user_id: String,
    pub request: AddAddressRequest,
}
impl Command for AddAddressCommand {}

pub struct VerifyEmailCommand {
    pub request: VerifyEmailRequest,
}
impl Command for VerifyEmailCommand {}

pub struct RequestPasswordResetCommand {
    pub request: PasswordResetRequest,
}
impl Command for RequestPasswordResetCommand {}

pub struct ConfirmPasswordResetCommand {
    pub request: PasswordResetConfirmRequest,
}
impl Command for ConfirmPasswordResetCommand {}

// queries
pub struct GetProfileQuery {
    pub user_id: String,
}
impl Query for GetProfileQuery {}

pub struct ListAddressesQuery {
    pub user_id: String,
}
impl Query for ListAddressesQuery {}

pub struct NearbyUsersQuery {
    pub user_id: String,
    pub params: NearbyUsersParams,
}
impl Query for NearbyUsersQuery {}

/// Loads the caller behind a valid access token. A token for a user that no
/// longer exists is treated as unauthenticated.
async fn load_active_user(uow: &RepositoryContext, user_id: &str) -> Result<User, AppError> {
    match uow.user_repository.find_by_id(user_id).await? {
        Some(user) if user.is_active => Ok(user),
        Some(_) => Err(AppError::AccountDisabled),
        None => {
            event!(Level::WARN, "Token presented for unknown user {}", user_id);
            Err(AppError::Unauthorized(String::from("User not found")))
        }
    }
}

/// Names are stored trimmed, so a whitespace-only name counts as empty.
fn trimmed_name(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{} may not be blank", field)));
    }
    Ok(trimmed.to_string())
}

/// Marks a refresh token as used. Only the first caller for a given `jti`
/// succeeds.
async fn blacklist_refresh_token(uow: &RepositoryContext, claims: &Claims) -> Result<(), AppError> {
    let token = BlacklistedToken::new(&claims.jti, &claims.user_id, claims.exp);
    match uow.token_blacklist_repository.add(token).await {
        Ok(()) => Ok(()),
        Err(RepositoryError::Conflict(_)) => {
            event!(Level::WARN, "Blacklisted refresh token presented for user {}", claims.user_id);
            Err(AppError::Unauthorized(String::from("Token is blacklisted")))
        }
        Err(e) => Err(e.into()),
    }
}

// command handlers
pub struct RegisterUserCommandHandler {
    uow: Arc<RepositoryContext>,
    jwt_service: Arc<JwtService>,
    metrics: Arc<dyn MetricsService>,
}

impl RegisterUserCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>, jwt_service: Arc<JwtService>, metrics: Arc<dyn MetricsService>) -> Self {
        RegisterUserCommandHandler {
            uow,
            jwt_service,
            metrics,
        }
    }

    async fn unique_referral_code(&self) -> Result<String, AppError> {
        for _ in 0..REFERRAL_CODE_ATTEMPTS {
            let code = generate_referral_code();
            if self.uow.user_repository.find_by_referral_code(&code).await?.is_none() {
                return Ok(code);
            }
        }

        Err(AppError::Internal(String::from("Could not allocate a unique referral code")))
    }
}

impl CommandHandler<RegisterUserCommand, AuthResponse> for RegisterUserCommandHandler {
    async fn handle(&self, input: &RegisterUserCommand) -> Result<AuthResponse, AppError> {
        let request = &input.request;
        request.validate()?;

        if request.password != request.password_confirm {
            return Err(AppError::Validation(String::from("Passwords do not match")));
        }
        if request.user_type == UserType::Admin {
            return Err(AppError::Validation(String::from("Admin accounts cannot be self-registered")));
        }
        let first_name = trimmed_name("first_name", &request.first_name)?;
        let last_name = trimmed_name("last_name", &request.last_name)?;

        let email = normalize_email(&request.email);
        if self.uow.user_repository.find_by_email(&email).await?.is_some() {
            return Err(AppError::AlreadyExists(String::from("User with this email already exists")));
        }
        if self.uow.user_repository.find_by_phone_number(&request.phone_number).await?.is_some() {
            return Err(AppError::AlreadyExists(String::from("User with this phone number already exists")));
        }

        let mut user = User::new(
            &email,
            request.phone_number.clone(),
            hash_password(&request.password)?,
            first_name,
            last_name,
            request.user_type,
        );
        if user.user_type == UserType::Customer {
            user.profile.referral_code = Some(self.unique_referral_code().await?);
        }
        let verification_token = generate_token();
        user.email_verification_token = Some(verification_token.clone());

        let mut uow = self.uow.begin();
        uow.add_event(Event::UserRegistered {
            user_id: user.id.clone(),
            email: user.email.clone(),
            user_type: user.user_type,
            email_verification_token: verification_token,
        });

        match self.uow.user_repository.create(user).await {
            Ok(created) => {
                uow.commit().await;
                self.metrics.registration();
                event!(Level::INFO, "Registered user {} as {:?}", created.id, created.user_type);

                Ok(AuthResponse {
                    message: String::from("User registered successfully"),
                    tokens: self.jwt_service.issue_pair(&created.id)?,
                    user: UserResponse::from(&created),
                })
            }
            Err(e) => {
                uow.rollback();
                event!(Level::WARN, "Error occurred while registering user: {}", e);
                Err(e.into())
            }
        }
    }
}

pub struct LoginCommandHandler {
    uow: Arc<RepositoryContext>,
    jwt_service: Arc<JwtService>,
    metrics: Arc<dyn MetricsService>,
}

impl LoginCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>, jwt_service: Arc<JwtService>, metrics: Arc<dyn MetricsService>) -> Self {
        LoginCommandHandler {
            uow,
            jwt_service,
            metrics,
        }
    }

    async fn record(&self, input: &LoginCommand, failure_reason: Option<&str>) -> Result<(), AppError> {
        let attempt = LoginAttempt::new(
            &input.request.email,
            input.ip_address.clone(),
            input.user_agent.clone(),
            failure_reason,
        );
        self.uow.login_attempt_repository.record(attempt).await?;

        if let Some(reason) = failure_reason {
            self.metrics.login(LoginOutcome::Failure);
            event!(Level::INFO, "Failed login for {} from {}: {}", input.request.email, input.ip_address, reason);
        }
        Ok(())
    }
}

impl CommandHandler<LoginCommand, AuthResponse> for LoginCommandHandler {
    async fn handle(&self, input: &LoginCommand) -> Result<AuthResponse, AppError> {
        input.request.validate()?;
        let email = normalize_email(&input.request.email);

        let window_start = DateTime::from_millis(DateTime::now().timestamp_millis() - FAILED_LOGIN_WINDOW_MILLIS);
        let recent_failures = self
            .uow
            .login_attempt_repository
            .count_recent_failures(&email, window_start)
            .await?;
        if recent_failures >= MAX_FAILED_LOGIN_ATTEMPTS {
            self.metrics.login(LoginOutcome::Blocked);
            event!(Level::WARN, "Login blocked for {} after {} failures", email, recent_failures);
            return Err(AppError::TooManyAttempts);
        }

        let mut user = match self.uow.user_repository.find_by_email(&email).await? {
            Some(user) if verify_password(&input.request.password, &user.password) => user,
            Some(_) => {
                self.record(input, Some("invalid_password")).await?;
                return Err(AppError::InvalidCredentials);
            }
            None => {
                self.record(input, Some("unknown_email")).await?;
                return Err(AppError::InvalidCredentials);
            }
        };

        if !user.is_active {
            self.record(input, Some("inactive_account")).await?;
            return Err(AppError::AccountDisabled);
        }

        self.record(input, None).await?;
        user.last_login = Some(DateTime::now());
        user.touch();
        let user = self.uow.user_repository.update(user).await?;
        self.metrics.login(LoginOutcome::Success);

        Ok(AuthResponse {
            message: String::from("Login successful"),
            tokens: self.jwt_service.issue_pair(&user.id)?,
            user: UserResponse::from(&user),
        })
    }
}

pub struct RefreshTokenCommandHandler {
    uow: Arc<RepositoryContext>,
    jwt_service: Arc<JwtService>,
    metrics: Arc<dyn MetricsService>,
}

impl RefreshTokenCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>, jwt_service: Arc<JwtService>, metrics: Arc<dyn MetricsService>) -> Self {
        RefreshTokenCommandHandler {
            uow,
            jwt_service,
            metrics,
        }
    }
}

impl CommandHandler<RefreshTokenCommand, TokenPair> for RefreshTokenCommandHandler {
    async fn handle(&self, input: &RefreshTokenCommand) -> Result<TokenPair, AppError> {
        let claims = self.jwt_service.decode(&input.refresh, TokenType::Refresh)?;
        if self.uow.token_blacklist_repository.contains(&claims.jti).await? {
            return Err(AppError::Unauthorized(String::from("Token is blacklisted")));
        }
        let user = load_active_user(&self.uow, &claims.user_id).await?;

        // Rotation: the presented token cannot be exchanged again.
        blacklist_refresh_token(&self.uow, &claims).await?;

        self.metrics.token_refresh();
        self.jwt_service.issue_pair(&user.id)
    }
}

pub struct LogoutCommandHandler {
    uow: Arc<RepositoryContext>,
    jwt_service: Arc<JwtService>,
}

impl LogoutCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>, jwt_service: Arc<JwtService>) -> Self {
        LogoutCommandHandler { uow, jwt_service }
    }
}

impl CommandHandler<LogoutCommand, MessageResponse> for LogoutCommandHandler {
    async fn handle(&self, input: &LogoutCommand) -> Result<MessageResponse, AppError> {
        input.request.validate()?;
        let claims = self.jwt_service.decode(&input.request.refresh, TokenType::Refresh)?;

        blacklist_refresh_token(&self.uow, &claims).await?;
        event!(Level::INFO, "User {} logged out", claims.user_id);

        Ok(MessageResponse {
            message: String::from("Successfully logged out"),
        })
    }
}

pub struct UpdateProfileCommandHandler {
    uow: Arc<RepositoryContext>,
}

impl UpdateProfileCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        UpdateProfileCommandHandler { uow }
    }
}

fn parse_date_of_birth(raw: &str) -> Result<String, AppError> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::Validation(String::from("date_of_birth must be formatted YYYY-MM-DD")))?;

    if date >= chrono::Utc::now().date_naive() {
        return Err(AppError::Validation(String::from("date_of_birth must be in the past")));
    }
    Ok(date.format("%Y-%m-%d").to_string())
}

impl CommandHandler<UpdateProfileCommand, UserResponse> for UpdateProfileCommandHandler {
    async fn handle(&self, input: &UpdateProfileCommand) -> Result<UserResponse, AppError> {
        let request = &input.request;
        request.validate()?;
        if let Some(preferences) = &request.preferences {
            preferences.validate()?;
        }

        let mut user = load_active_user(&self.uow, &input.user_id).await?;

        if let Some(phone_number) = &request.phone_number {
            if *phone_number != user.phone_number {
                if let Some(holder) = self.uow.user_repository.find_by_phone_number(phone_number).await? {
                    if holder.id != user.id {
                        return Err(AppError::AlreadyExists(String::from(
                            "User with this phone number already exists",
                        )));
                    }
                }
                user.phone_number = phone_number.clone();
                user.phone_verified = false;
            }
        }
        if let Some(first_name) = &request.first_name {
            user.first_name = trimmed_name("first_name", first_name)?;
        }
        if let Some(last_name) = &request.last_name {
            user.last_name = trimmed_name("last_name", last_name)?;
        }
        if let Some(date_of_birth) = &request.date_of_birth {
            user.date_of_birth = Some(parse_date_of_birth(date_of_birth)?);
        }
        if let Some(gender) = request.gender {
            user.gender = Some(gender);
        }
        if let Some(city) = &request.city {
            user.city = Some(city.clone());
        }
        if let Some(state) = &request.state {
            user.state = Some(state.clone());
        }
        if let Some(country) = &request.country {
            user.country = country.clone();
        }
        if let Some(language) = &request.preferred_language {
            user.preferred_language = language.clone();
        }
        if let Some(location) = request.current_location {
            user.current_location = Some(location.to_point()?);
        }

        if let Some(preferences) = &request.preferences {
            let profile = &mut user.profile;
            if let Some(cuisines) = &preferences.favorite_cuisines {
                profile.favorite_cuisines = cuisines.clone();
            }
            if let Some(restrictions) = &preferences.dietary_restrictions {
                profile.dietary_restrictions = restrictions.clone();
            }
            if let Some(method) = &preferences.preferred_payment_method {
                profile.preferred_payment_method = method.clone();
            }
            if let Some(flag) = preferences.push_notifications {
                profile.push_notifications = flag;
            }
            if let Some(flag) = preferences.email_notifications {
                profile.email_notifications = flag;
            }
            if let Some(flag) = preferences.sms_notifications {
                profile.sms_notifications = flag;
            }
            if let Some(flag) = preferences.marketing_emails {
                profile.marketing_emails = flag;
            }
            profile.updated_at = DateTime::now();
        }

        user.touch();
        let updated = self.uow.user_repository.update(user).await?;
        event!(Level::DEBUG, "Updated profile of user {}", updated.id);

        Ok(UserResponse::from(&updated))
    }
}

pub struct AddAddressCommandHandler {
    uow: Arc<RepositoryContext>,
}

impl AddAddressCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        AddAddressCommandHandler { uow }
    }
}

impl CommandHandler<AddAddressCommand, AddressResponse> for AddAddressCommandHandler {
    async fn handle(&self, input: &AddAddressCommand) -> Result<AddressResponse, AppError> {
        let request = &input.request;
        request.validate()?;
        let location = request.location.map(|l| l.to_point()).transpose()?;

        let mut user = load_active_user(&self.uow, &input.user_id).await?;

        let now = DateTime::now();
        let added = user.add_address(UserAddress {
            id: uuid::Uuid::new_v4().to_string(),
            address_type: request.address_type,
            label: request.label.clone(),
            street_address: request.street_address.clone(),
            apartment_number: request.apartment_number.clone(),
            landmark: request.landmark.clone(),
            city: request.city.clone(),
            state: request.state.clone(),
            postal_code: request.postal_code.clone(),
            country: request.country.clone().unwrap_or_else(|| String::from("India")),
            location,
            is_default: request.is_default,
            created_at: now,
            updated_at: now,
        });

        self.uow.user_repository.update(user).await?;
        Ok(AddressResponse::from(&added))
    }
}

pub struct VerifyEmailCommandHandler {
    uow: Arc<RepositoryContext>,
}

impl VerifyEmailCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        VerifyEmailCommandHandler { uow }
    }
}

impl CommandHandler<VerifyEmailCommand, MessageResponse> for VerifyEmailCommandHandler {
    async fn handle(&self, input: &VerifyEmailCommand) -> Result<MessageResponse, AppError> {
        input.request.validate()?;

        let mut user = self
            .uow
            .user_repository
            .find_by_email_verification_token(&input.request.token)
            .await?
            .ok_or_else(|| AppError::Validation(String::from("Invalid verification token")))?;

        user.email_verified = true;
        user.email_verification_token = None;
        user.touch();

        let mut uow = self.uow.begin();
        uow.add_event(Event::EmailVerified { user_id: user.id.clone() });
        match self.uow.user_repository.update(user).await {
            Ok(_) => {
                uow.commit().await;
                Ok(MessageResponse {
                    message: String::from("Email verified successfully"),
                })
            }
            Err(e) => {
                uow.rollback();
                Err(e.into())
            }
        }
    }
}

pub struct RequestPasswordResetCommandHandler {
    uow: Arc<RepositoryContext>,
}

impl RequestPasswordResetCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        RequestPasswordResetCommandHandler { uow }
    }
}

impl CommandHandler<RequestPasswordResetCommand, MessageResponse> for RequestPasswordResetCommandHandler {
    async fn handle(&self, input: &RequestPasswordResetCommand) -> Result<MessageResponse, AppError> {
        input.request.validate()?;
        let email = normalize_email(&input.request.email);

        // The answer is identical whether or not the account exists.
        match self.uow.user_repository.find_by_email(&email).await? {
            Some(mut user) if user.is_active => {
                let token = user.start_password_reset();

                let mut uow = self.uow.begin();
                uow.add_event(Event::PasswordResetRequested {
                    user_id: user.id.clone(),
                    email: user.email.clone(),
                    token,
                });
                match self.uow.user_repository.update(user).await {
                    Ok(_) => {
                        uow.commit().await;
                    }
                    Err(e) => {
                        uow.rollback();
                        return Err(e.into());
                    }
                }
            }
            _ => event!(Level::DEBUG, "Password reset requested for unknown or inactive account"),
        }

        Ok(MessageResponse {
            message: String::from("If an account exists for this email, a password reset link has been sent"),
        })
    }
}

pub struct ConfirmPasswordResetCommandHandler {
    uow: Arc<RepositoryContext>,
}

impl ConfirmPasswordResetCommandHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        ConfirmPasswordResetCommandHandler { uow }
    }
}

impl CommandHandler<ConfirmPasswordResetCommand, MessageResponse> for ConfirmPasswordResetCommandHandler {
    async fn handle(&self, input: &ConfirmPasswordResetCommand) -> Result<MessageResponse, AppError> {
        let request = &input.request;
        request.validate()?;
        if request.new_password != request.new_password_confirm {
            return Err(AppError::Validation(String::from("Passwords do not match")));
        }

        let invalid = || AppError::Validation(String::from("Invalid or expired reset token"));
        let mut user = self
            .uow
            .user_repository
            .find_by_password_reset_token(&request.token)
            .await?
            .ok_or_else(invalid)?;
        if user.password_reset_expired(DateTime::now()) {
            return Err(invalid());
        }

        user.password = hash_password(&request.new_password)?;
        user.password_reset_token = None;
        user.password_reset_expires = None;
        user.touch();

        let mut uow = self.uow.begin();
        uow.add_event(Event::PasswordChanged { user_id: user.id.clone() });
        match self.uow.user_repository.update(user).await {
            Ok(_) => {
                uow.commit().await;
                Ok(MessageResponse {
                    message: String::from("Password has been reset successfully"),
                })
            }
            Err(e) => {
                uow.rollback();
                Err(e.into())
            }
        }
    }
}

// query handlers
pub struct GetProfileQueryHandler {
    uow: Arc<RepositoryContext>,
}

impl GetProfileQueryHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        GetProfileQueryHandler { uow }
    }
}

impl QueryHandler<GetProfileQuery, UserResponse> for GetProfileQueryHandler {
    async fn handle(&self, input: &GetProfileQuery) -> Result<UserResponse, AppError> {
        let user = load_active_user(&self.uow, &input.user_id).await?;
        Ok(UserResponse::from(&user))
    }
}

pub struct ListAddressesQueryHandler {
    uow: Arc<RepositoryContext>,
}

impl ListAddressesQueryHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        ListAddressesQueryHandler { uow }
    }
}

impl QueryHandler<ListAddressesQuery, AddressListResponse> for ListAddressesQueryHandler {
    async fn handle(&self, input: &ListAddressesQuery) -> Result<AddressListResponse, AppError> {
        let user = load_active_user(&self.uow, &input.user_id).await?;
        Ok(AddressListResponse {
            addresses: user.addresses.iter().map(AddressResponse::from).collect(),
        })
    }
}

pub struct NearbyUsersQueryHandler {
    uow: Arc<RepositoryContext>,
}

impl NearbyUsersQueryHandler {
    pub fn new(uow: Arc<RepositoryContext>) -> Self {
        NearbyUsersQueryHandler { uow }
    }
}

impl QueryHandler<NearbyUsersQuery, NearbyUsersResponse> for NearbyUsersQueryHandler {
    async fn handle(&self, input: &NearbyUsersQuery) -> Result<NearbyUsersResponse, AppError> {
        let (lat, lng) = match (input.params.lat, input.params.lng) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => {
                return Err(AppError::Validation(String::from(
                    "lat and lng query parameters are required",
                )))
            }
        };
        let radius_km = input.params.radius.unwrap_or(DEFAULT_NEARBY_RADIUS_KM);
        if !(radius_km > 0.0 && radius_km <= MAX_NEARBY_RADIUS_KM) {
            return Err(AppError::Validation(format!(
                "radius must be greater than 0 and at most {} km",
                MAX_NEARBY_RADIUS_KM
            )));
        }
        let origin = to_point(lat, lng)?;

        load_active_user(&self.uow, &input.user_id).await?;
        let users = self
            .uow
            .user_repository
            .find_nearby(origin, radius_km, &input.user_id, NEARBY_USERS_PAGE_SIZE)
            .await?;

        let results: Vec<NearbyUserResponse> = users
            .iter()
            .filter_map(|user| {
                user.current_location.map(|location| NearbyUserResponse {
                    id: user.id.clone(),
                    full_name: user.full_name(),
                    user_type: user.user_type,
                    city: user.city.clone(),
                    distance_km: (location.distance_km(&origin) * 100.0).round() / 100.0,
                })
            })
            .collect();

        Ok(NearbyUsersResponse {
            count: results.len(),
            radius_km,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::fixtures::jwt_config,
        domain::{AddressType, GeoPoint},
        dtos::{LocationInput, PreferencesInput},
        error::RepositoryError,
        events::InMemoryMessageBroker,
        metrics::PrometheusMetricsService,
        repositories::{
            InMemoryLoginAttemptRepository, InMemoryTokenBlacklistRepository, InMemoryUserRepository,
            MockLoginAttemptRepository, MockUserRepository, UserRepository,
        },
    };

    struct Harness {
        uow: Arc<RepositoryContext>,
        users: InMemoryUserRepository,
        attempts: InMemoryLoginAttemptRepository,
        broker: Arc<InMemoryMessageBroker>,
        jwt_service: Arc<JwtService>,
        metrics: Arc<PrometheusMetricsService>,
    }

    impl Harness {
        fn new() -> Self {
            let users = InMemoryUserRepository::new();
            let attempts = InMemoryLoginAttemptRepository::new();
            let broker = Arc::new(InMemoryMessageBroker::new());
            let uow = Arc::new(RepositoryContext::new(
                Arc::new(users.clone()),
                Arc::new(attempts.clone()),
                Arc::new(InMemoryTokenBlacklistRepository::new()),
                broker.clone(),
            ));

            Harness {
                uow,
                users,
                attempts,
                broker,
                jwt_service: Arc::new(JwtService::new(&jwt_config())),
                metrics: Arc::new(PrometheusMetricsService::new().unwrap()),
            }
        }

        fn register_handler(&self) -> RegisterUserCommandHandler {
            RegisterUserCommandHandler::new(self.uow.clone(), self.jwt_service.clone(), self.metrics.clone())
        }

        fn login_handler(&self) -> LoginCommandHandler {
            LoginCommandHandler::new(self.uow.clone(), self.jwt_service.clone(), self.metrics.clone())
        }

        async fn register(&self, email: &str, phone_number: &str) -> AuthResponse {
            self.register_handler()
                .handle(&RegisterUserCommand {
                    request: register_request(email, phone_number),
                })
                .await
                .unwrap()
        }

        async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, AppError> {
            self.login_handler()
                .handle(&LoginCommand {
                    request: LoginRequest {
                        email: email.to_string(),
                        password: password.to_string(),
                    },
                    ip_address: String::from("203.0.113.7"),
                    user_agent: Some(String::from("tests")),
                })
                .await
        }
    }

    fn register_request(email: &str, phone_number: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            phone_number: phone_number.to_string(),
            password: String::from("correct-password"),
            password_confirm: String::from("correct-password"),
            first_name: String::from("Asha"),
            last_name: String::from("Rao"),
            user_type: UserType::Customer,
        }
    }

    fn context_with(users: MockUserRepository, attempts: MockLoginAttemptRepository) -> Arc<RepositoryContext> {
        Arc::new(RepositoryContext::new(
            Arc::new(users),
            Arc::new(attempts),
            Arc::new(InMemoryTokenBlacklistRepository::new()),
            Arc::new(InMemoryMessageBroker::new()),
        ))
    }

    #[tokio::test]
    async fn register_stores_user_and_issues_tokens() {
        let harness = Harness::new();
        let response = harness.register("Asha@Example.com", "+919876543210").await;

        assert_eq!(response.message, "User registered successfully");
        assert_eq!(response.user.email, "asha@example.com");
        assert_eq!(response.user.profile.referral_code.as_ref().map(String::len), Some(8));

        let claims = harness.jwt_service.decode(&response.tokens.access, TokenType::Access).unwrap();
        assert_eq!(claims.user_id, response.user.id);

        let stored = harness.users.find_by_id(&response.user.id).await.unwrap().unwrap();
        assert!(stored.password.starts_with("$argon2id$"));
        assert!(stored.email_verification_token.is_some());
    }

    #[tokio::test]
    async fn register_publishes_user_registered_event() {
        let harness = Harness::new();
        let response = harness.register("asha@example.com", "+919876543210").await;

        let published = harness.broker.published().await;
        assert_eq!(published.len(), 1);
        match &published[0].1 {
            Event::UserRegistered { user_id, email, email_verification_token, .. } => {
                assert_eq!(user_id, &response.user.id);
                assert_eq!(email, "asha@example.com");
                let stored = harness.users.find_by_id(user_id).await.unwrap().unwrap();
                assert_eq!(stored.email_verification_token.as_ref(), Some(email_verification_token));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn vendors_do_not_get_referral_codes() {
        let harness = Harness::new();
        let response = harness
            .register_handler()
            .handle(&RegisterUserCommand {
                request: RegisterRequest {
                    user_type: UserType::Vendor,
                    ..register_request("vendor@example.com", "+919876543210")
                },
            })
            .await
            .unwrap();

        assert_eq!(response.user.user_type, UserType::Vendor);
        assert!(response.user.profile.referral_code.is_none());
    }

    #[tokio::test]
    async fn register_rejects_mismatched_passwords_and_admins() {
        let harness = Harness::new();

        let mismatch = harness
            .register_handler()
            .handle(&RegisterUserCommand {
                request: RegisterRequest {
                    password_confirm: String::from("something-else"),
                    ..register_request("a@example.com", "+911111111111")
                },
            })
            .await;
        assert!(matches!(mismatch, Err(AppError::Validation(m)) if m == "Passwords do not match"));

        let admin = harness
            .register_handler()
            .handle(&RegisterUserCommand {
                request: RegisterRequest {
                    user_type: UserType::Admin,
                    ..register_request("a@example.com", "+911111111111")
                },
            })
            .await;
        assert!(matches!(admin, Err(AppError::Validation(_))));
        assert!(harness.broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn register_rejects_whitespace_only_names() {
        let harness = Harness::new();
        let handler = harness.register_handler();

        let mut request = register_request("a@example.com", "+911111111111");
        request.first_name = String::from("   ");
        let blank_first = handler.handle(&RegisterUserCommand { request }).await;
        assert!(matches!(blank_first, Err(AppError::Validation(message)) if message == "first_name may not be blank"));

        let mut request = register_request("a@example.com", "+911111111111");
        request.last_name = String::from("\t \n");
        let blank_last = handler.handle(&RegisterUserCommand { request }).await;
        assert!(matches!(blank_last, Err(AppError::Validation(message)) if message == "last_name may not be blank"));

        let mut request = register_request("a@example.com", "+911111111111");
        request.first_name = String::from("  Asha ");
        let padded = handler.handle(&RegisterUserCommand { request }).await.unwrap();
        assert_eq!(padded.user.first_name, "Asha");
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email_or_phone() {
        let harness = Harness::new();
        harness.register("a@example.com", "+911111111111").await;

        let same_email = harness
            .register_handler()
            .handle(&RegisterUserCommand {
                request: register_request("A@EXAMPLE.COM", "+912222222222"),
            })
            .await;
        assert!(matches!(same_email, Err(AppError::AlreadyExists(m)) if m.contains("email")));

        let same_phone = harness
            .register_handler()
            .handle(&RegisterUserCommand {
                request: register_request("b@example.com", "+911111111111"),
            })
            .await;
        assert!(matches!(same_phone, Err(AppError::AlreadyExists(m)) if m.contains("phone")));
    }

    #[tokio::test]
    async fn register_surfaces_database_failures() {
        let mut users = MockUserRepository::new();
        users
            .expect_find_by_email()
            .returning(|_| Err(RepositoryError::Database(String::from("connection reset"))));
        users.expect_create().never();

        let handler = RegisterUserCommandHandler::new(
            context_with(users, MockLoginAttemptRepository::new()),
            Arc::new(JwtService::new(&jwt_config())),
            Arc::new(PrometheusMetricsService::new().unwrap()),
        );
        let result = handler
            .handle(&RegisterUserCommand {
                request: register_request("a@example.com", "+911111111111"),
            })
            .await;

        assert!(matches!(result, Err(AppError::Repository(RepositoryError::Database(_)))));
    }

    #[tokio::test]
    async fn register_rolls_back_events_when_insert_conflicts() {
        let mut users = MockUserRepository::new();
        users.expect_find_by_email().returning(|_| Ok(None));
        users.expect_find_by_phone_number().returning(|_| Ok(None));
        users.expect_find_by_referral_code().returning(|_| Ok(None));
        users
            .expect_create()
            .returning(|_| Err(RepositoryError::Conflict(String::from("User with this email already exists"))));

        let broker = Arc::new(InMemoryMessageBroker::new());
        let uow = Arc::new(RepositoryContext::new(
            Arc::new(users),
            Arc::new(MockLoginAttemptRepository::new()),
            Arc::new(InMemoryTokenBlacklistRepository::new()),
            broker.clone(),
        ));
        let handler = RegisterUserCommandHandler::new(
            uow,
            Arc::new(JwtService::new(&jwt_config())),
            Arc::new(PrometheusMetricsService::new().unwrap()),
        );

        let result = handler
            .handle(&RegisterUserCommand {
                request: register_request("a@example.com", "+911111111111"),
            })
            .await;

        assert!(matches!(result, Err(AppError::Repository(RepositoryError::Conflict(_)))));
        assert!(broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn login_succeeds_and_records_attempt() {
        let harness = Harness::new();
        harness.register("a@example.com", "+911111111111").await;

        let response = harness.login("A@example.com", "correct-password").await.unwrap();

        assert_eq!(response.message, "Login successful");
        assert!(response.user.last_login.is_some());
        let attempts = harness.attempts.attempts().await;
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].success);
        assert_eq!(attempts[0].ip_address, "203.0.113.7");
    }

    #[tokio::test]
    async fn login_with_wrong_password_or_unknown_email_fails() {
        let harness = Harness::new();
        harness.register("a@example.com", "+911111111111").await;

        assert!(matches!(harness.login("a@example.com", "wrong-password").await, Err(AppError::InvalidCredentials)));
        assert!(matches!(harness.login("nobody@example.com", "whatever1").await, Err(AppError::InvalidCredentials)));

        let reasons: Vec<_> = harness
            .attempts
            .attempts()
            .await
            .into_iter()
            .filter_map(|a| a.failure_reason)
            .collect();
        assert_eq!(reasons, vec!["invalid_password", "unknown_email"]);
    }

    #[tokio::test]
    async fn login_blocks_after_repeated_failures() {
        let harness = Harness::new();
        harness.register("a@example.com", "+911111111111").await;

        for _ in 0..MAX_FAILED_LOGIN_ATTEMPTS {
            assert!(matches!(harness.login("a@example.com", "wrong-password").await, Err(AppError::InvalidCredentials)));
        }

        let blocked = harness.login("a@example.com", "correct-password").await;
        assert!(matches!(blocked, Err(AppError::TooManyAttempts)));
    }

    #[tokio::test]
    async fn login_is_blocked_before_user_lookup() {
        let mut attempts = MockLoginAttemptRepository::new();
        attempts
            .expect_count_recent_failures()
            .returning(|_, _| Ok(MAX_FAILED_LOGIN_ATTEMPTS));
        attempts.expect_record().never();
        let mut users = MockUserRepository::new();
        users.expect_find_by_email().never();

        let handler = LoginCommandHandler::new(
            context_with(users, attempts),
            Arc::new(JwtService::new(&jwt_config())),
            Arc::new(PrometheusMetricsService::new().unwrap()),
        );
        let result = handler
            .handle(&LoginCommand {
                request: LoginRequest {
                    email: String::from("a@example.com"),
                    password: String::from("whatever"),
                },
                ip_address: String::from("unknown"),
                user_agent: None,
            })
            .await;

        assert!(matches!(result, Err(AppError::TooManyAttempts)));
    }

    #[tokio::test]
    async fn inactive_account_cannot_log_in() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let mut stored = harness.users.find_by_id(&registered.user.id).await.unwrap().unwrap();
        stored.is_active = false;
        harness.users.update(stored).await.unwrap();

        assert!(matches!(harness.login("a@example.com", "correct-password").await, Err(AppError::AccountDisabled)));
    }

    #[tokio::test]
    async fn refresh_rotates_token_pair() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let handler = RefreshTokenCommandHandler::new(harness.uow.clone(), harness.jwt_service.clone(), harness.metrics.clone());

        let pair = handler
            .handle(&RefreshTokenCommand {
                refresh: registered.tokens.refresh.clone(),
            })
            .await
            .unwrap();
        assert_ne!(pair.refresh, registered.tokens.refresh);
        assert_eq!(
            harness.jwt_service.decode(&pair.access, TokenType::Access).unwrap().user_id,
            registered.user.id
        );

        let with_access = handler
            .handle(&RefreshTokenCommand {
                refresh: registered.tokens.access,
            })
            .await;
        assert!(matches!(with_access, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn rotated_refresh_token_cannot_be_replayed() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let handler = RefreshTokenCommandHandler::new(harness.uow.clone(), harness.jwt_service.clone(), harness.metrics.clone());

        let rotated = handler
            .handle(&RefreshTokenCommand {
                refresh: registered.tokens.refresh.clone(),
            })
            .await
            .unwrap();

        let replayed = handler
            .handle(&RefreshTokenCommand {
                refresh: registered.tokens.refresh,
            })
            .await;
        assert!(matches!(replayed, Err(AppError::Unauthorized(message)) if message == "Token is blacklisted"));

        let next = handler
            .handle(&RefreshTokenCommand {
                refresh: rotated.refresh.clone(),
            })
            .await
            .unwrap();
        assert_ne!(next.refresh, rotated.refresh);
    }

    #[tokio::test]
    async fn logout_blacklists_the_refresh_token() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let logout = LogoutCommandHandler::new(harness.uow.clone(), harness.jwt_service.clone());
        let command = LogoutCommand {
            request: LogoutRequest {
                refresh: registered.tokens.refresh.clone(),
            },
        };

        let response = logout.handle(&command).await.unwrap();
        assert_eq!(response.message, "Successfully logged out");

        let refreshed = RefreshTokenCommandHandler::new(harness.uow.clone(), harness.jwt_service.clone(), harness.metrics.clone())
            .handle(&RefreshTokenCommand {
                refresh: registered.tokens.refresh,
            })
            .await;
        assert!(matches!(refreshed, Err(AppError::Unauthorized(_))));

        let again = logout.handle(&command).await;
        assert!(matches!(again, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn logout_rejects_access_tokens_and_empty_input() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let logout = LogoutCommandHandler::new(harness.uow.clone(), harness.jwt_service.clone());

        let with_access = logout
            .handle(&LogoutCommand {
                request: LogoutRequest {
                    refresh: registered.tokens.access,
                },
            })
            .await;
        assert!(matches!(with_access, Err(AppError::Unauthorized(_))));

        let empty = logout
            .handle(&LogoutCommand {
                request: LogoutRequest { refresh: String::new() },
            })
            .await;
        assert!(matches!(empty, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn update_profile_applies_only_present_fields() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let handler = UpdateProfileCommandHandler::new(harness.uow.clone());

        let updated = handler
            .handle(&UpdateProfileCommand {
                user_id: registered.user.id.clone(),
                request: UpdateProfileRequest {
                    city: Some(String::from("Bengaluru")),
                    date_of_birth: Some(String::from("1990-04-12")),
                    current_location: Some(LocationInput { lat: 12.97, lng: 77.59 }),
                    preferences: Some(PreferencesInput {
                        favorite_cuisines: Some(vec![String::from("south_indian")]),
                        marketing_emails: Some(true),
                        ..PreferencesInput::default()
                    }),
                    ..UpdateProfileRequest::default()
                },
            })
            .await
            .unwrap();

        assert_eq!(updated.city.as_deref(), Some("Bengaluru"));
        assert_eq!(updated.first_name, "Asha");
        assert_eq!(updated.date_of_birth.as_deref(), Some("1990-04-12"));
        assert_eq!(updated.current_location.unwrap().lng, 77.59);
        assert_eq!(updated.profile.favorite_cuisines, vec!["south_indian"]);
        assert!(updated.profile.marketing_emails);
        assert!(updated.profile.sms_notifications);
    }

    #[tokio::test]
    async fn update_profile_validates_input() {
        let harness = Harness::new();
        let first = harness.register("a@example.com", "+911111111111").await;
        harness.register("b@example.com", "+912222222222").await;
        let handler = UpdateProfileCommandHandler::new(harness.uow.clone());

        let taken_phone = handler
            .handle(&UpdateProfileCommand {
                user_id: first.user.id.clone(),
                request: UpdateProfileRequest {
                    phone_number: Some(String::from("+912222222222")),
                    ..UpdateProfileRequest::default()
                },
            })
            .await;
        assert!(matches!(taken_phone, Err(AppError::AlreadyExists(_))));

        let bad_date = handler
            .handle(&UpdateProfileCommand {
                user_id: first.user.id.clone(),
                request: UpdateProfileRequest {
                    date_of_birth: Some(String::from("12/04/1990")),
                    ..UpdateProfileRequest::default()
                },
            })
            .await;
        assert!(matches!(bad_date, Err(AppError::Validation(_))));

        let bad_location = handler
            .handle(&UpdateProfileCommand {
                user_id: first.user.id,
                request: UpdateProfileRequest {
                    current_location: Some(LocationInput { lat: 120.0, lng: 0.0 }),
                    ..UpdateProfileRequest::default()
                },
            })
            .await;
        assert!(matches!(bad_location, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn update_profile_rejects_whitespace_only_names() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let handler = UpdateProfileCommandHandler::new(harness.uow.clone());

        for request in [
            UpdateProfileRequest {
                first_name: Some(String::from("  ")),
                ..UpdateProfileRequest::default()
            },
            UpdateProfileRequest {
                last_name: Some(String::from(" \t")),
                ..UpdateProfileRequest::default()
            },
        ] {
            let result = handler
                .handle(&UpdateProfileCommand {
                    user_id: registered.user.id.clone(),
                    request,
                })
                .await;
            assert!(matches!(result, Err(AppError::Validation(_))));
        }

        let stored = harness.users.find_by_id(&registered.user.id).await.unwrap().unwrap();
        assert_eq!(stored.first_name, "Asha");
        assert_eq!(stored.last_name, "Rao");
    }

    #[tokio::test]
    async fn profile_of_deleted_user_is_unauthorized() {
        let harness = Harness::new();
        let result = GetProfileQueryHandler::new(harness.uow.clone())
            .handle(&GetProfileQuery {
                user_id: String::from("missing"),
            })
            .await;

        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    fn address_request(label: &str, is_default: bool) -> AddAddressRequest {
        AddAddressRequest {
            address_type: AddressType::Home,
            label: label.to_string(),
            street_address: String::from("12 MG Road"),
            apartment_number: Some(String::from("4B")),
            landmark: None,
            city: String::from("Bengaluru"),
            state: String::from("Karnataka"),
            postal_code: String::from("560001"),
            country: None,
            location: Some(LocationInput { lat: 12.97, lng: 77.59 }),
            is_default,
        }
    }

    #[tokio::test]
    async fn addresses_follow_default_rules() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let add = AddAddressCommandHandler::new(harness.uow.clone());
        let list = ListAddressesQueryHandler::new(harness.uow.clone());

        let home = add
            .handle(&AddAddressCommand {
                user_id: registered.user.id.clone(),
                request: address_request("Home", false),
            })
            .await
            .unwrap();
        assert!(home.is_default);
        assert_eq!(home.country, "India");

        let work = add
            .handle(&AddAddressCommand {
                user_id: registered.user.id.clone(),
                request: address_request("Work", true),
            })
            .await
            .unwrap();
        assert!(work.is_default);

        let listed = list
            .handle(&ListAddressesQuery {
                user_id: registered.user.id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(listed.addresses.len(), 2);
        assert_eq!(listed.addresses.iter().filter(|a| a.is_default).count(), 1);

        let profile = GetProfileQueryHandler::new(harness.uow.clone())
            .handle(&GetProfileQuery {
                user_id: registered.user.id,
            })
            .await
            .unwrap();
        assert_eq!(profile.default_address_id, Some(work.id));
    }

    #[tokio::test]
    async fn nearby_users_are_sorted_and_exclude_caller() {
        let harness = Harness::new();
        let me = harness.register("me@example.com", "+910000000001").await;
        let near = harness.register("near@example.com", "+910000000002").await;
        let far = harness.register("far@example.com", "+910000000003").await;

        for (id, point) in [
            (&me.user.id, GeoPoint::new(12.9716, 77.5946)),
            (&near.user.id, GeoPoint::new(12.9800, 77.6000)),
            (&far.user.id, GeoPoint::new(13.0827, 80.2707)),
        ] {
            let mut stored = harness.users.find_by_id(id).await.unwrap().unwrap();
            stored.current_location = Some(point);
            harness.users.update(stored).await.unwrap();
        }

        let response = NearbyUsersQueryHandler::new(harness.uow.clone())
            .handle(&NearbyUsersQuery {
                user_id: me.user.id.clone(),
                params: NearbyUsersParams {
                    lat: Some(12.9716),
                    lng: Some(77.5946),
                    radius: None,
                },
            })
            .await
            .unwrap();

        assert_eq!(response.radius_km, DEFAULT_NEARBY_RADIUS_KM);
        assert_eq!(response.count, 1);
        assert_eq!(response.results[0].id, near.user.id);
        assert_eq!(response.results[0].full_name, "Asha Rao");
        assert!(response.results[0].distance_km > 0.0 && response.results[0].distance_km < 2.0);
    }

    #[tokio::test]
    async fn nearby_users_validates_parameters() {
        let harness = Harness::new();
        let me = harness.register("me@example.com", "+910000000001").await;
        let handler = NearbyUsersQueryHandler::new(harness.uow.clone());

        for params in [
            NearbyUsersParams { lat: None, lng: Some(77.0), radius: None },
            NearbyUsersParams { lat: Some(12.0), lng: Some(77.0), radius: Some(0.0) },
            NearbyUsersParams { lat: Some(12.0), lng: Some(77.0), radius: Some(51.0) },
            NearbyUsersParams { lat: Some(-91.0), lng: Some(77.0), radius: Some(1.0) },
        ] {
            let result = handler
                .handle(&NearbyUsersQuery {
                    user_id: me.user.id.clone(),
                    params,
                })
                .await;
            assert!(matches!(result, Err(AppError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn verify_email_consumes_token_once() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let token = harness
            .users
            .find_by_id(&registered.user.id)
            .await
            .unwrap()
            .unwrap()
            .email_verification_token
            .unwrap();
        let handler = VerifyEmailCommandHandler::new(harness.uow.clone());
        let command = VerifyEmailCommand {
            request: VerifyEmailRequest { token },
        };

        handler.handle(&command).await.unwrap();
        let stored = harness.users.find_by_id(&registered.user.id).await.unwrap().unwrap();
        assert!(stored.email_verified);
        assert!(stored.email_verification_token.is_none());
        assert!(matches!(
            harness.broker.published().await.last(),
            Some((_, Event::EmailVerified { .. }))
        ));

        assert!(matches!(handler.handle(&command).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn password_reset_round_trip_changes_password() {
        let harness = Harness::new();
        harness.register("a@example.com", "+911111111111").await;

        let requested = RequestPasswordResetCommandHandler::new(harness.uow.clone())
            .handle(&RequestPasswordResetCommand {
                request: PasswordResetRequest {
                    email: String::from("A@example.com"),
                },
            })
            .await
            .unwrap();
        assert!(requested.message.starts_with("If an account exists"));

        let token = match harness.broker.published().await.last() {
            Some((_, Event::PasswordResetRequested { token, .. })) => token.clone(),
            other => panic!("unexpected event {:?}", other),
        };

        ConfirmPasswordResetCommandHandler::new(harness.uow.clone())
            .handle(&ConfirmPasswordResetCommand {
                request: PasswordResetConfirmRequest {
                    token: token.clone(),
                    new_password: String::from("brand-new-password"),
                    new_password_confirm: String::from("brand-new-password"),
                },
            })
            .await
            .unwrap();

        assert!(harness.login("a@example.com", "brand-new-password").await.is_ok());
        assert!(harness.users.find_by_password_reset_token(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn password_reset_for_unknown_email_answers_the_same() {
        let harness = Harness::new();
        let response = RequestPasswordResetCommandHandler::new(harness.uow.clone())
            .handle(&RequestPasswordResetCommand {
                request: PasswordResetRequest {
                    email: String::from("ghost@example.com"),
                },
            })
            .await
            .unwrap();

        assert!(response.message.starts_with("If an account exists"));
        assert!(harness.broker.published().await.is_empty());
    }

    #[tokio::test]
    async fn expired_reset_token_is_rejected() {
        let harness = Harness::new();
        let registered = harness.register("a@example.com", "+911111111111").await;
        let mut stored = harness.users.find_by_id(&registered.user.id).await.unwrap().unwrap();
        let token = stored.start_password_reset();
        stored.password_reset_expires = Some(DateTime::from_millis(DateTime::now().timestamp_millis() - 1_000));
        harness.users.update(stored).await.unwrap();

        let result = ConfirmPasswordResetCommandHandler::new(harness.uow.clone())
            .handle(&ConfirmPasswordResetCommand {
                request: PasswordResetConfirmRequest {
                    token,
                    new_password: String::from("brand-new-password"),
                    new_password_confirm: String::from("brand-new-password"),
                },
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(m)) if m == "Invalid or expired reset token"));
    }
}
