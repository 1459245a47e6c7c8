use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;

use crate::{
    auth::TokenPair,
    domain::{AddressType, Gender, GeoPoint, User, UserAddress, UserProfile, UserType},
    error::AppError,
};

pub trait Response {}

// requests
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RegisterRequest {
    #[validate(pattern = r"^[^@\s]+@[^@\s]+\.[^@\s]+$")]
    #[validate(max_length = 254)]
    pub email: String,
    #[validate(pattern = r"^\+?[0-9]{7,15}$")]
    pub phone_number: String,
    #[validate(min_length = 8)]
    #[validate(max_length = 128)]
    pub password: String,
    pub password_confirm: String,
    #[validate(min_length = 1)]
    #[validate(max_length = 30)]
    pub first_name: String,
    #[validate(min_length = 1)]
    #[validate(max_length = 30)]
    pub last_name: String,
    #[serde(default)]
    pub user_type: UserType,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoginRequest {
    #[validate(min_length = 1)]
    pub email: String,
    #[validate(min_length = 1)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshTokenRequest {
    pub refresh: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LogoutRequest {
    #[validate(min_length = 1)]
    pub refresh: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LocationInput {
    pub lat: f64,
    pub lng: f64,
}

impl LocationInput {
    pub fn to_point(self) -> Result<GeoPoint, AppError> {
        to_point(self.lat, self.lng)
    }
}

pub fn to_point(lat: f64, lng: f64) -> Result<GeoPoint, AppError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(AppError::Validation(String::from("lat must be between -90 and 90")));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(AppError::Validation(String::from("lng must be between -180 and 180")));
    }
    Ok(GeoPoint::new(lat, lng))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct PreferencesInput {
    pub favorite_cuisines: Option<Vec<String>>,
    pub dietary_restrictions: Option<Vec<String>>,
    #[validate(min_length = 1)]
    #[validate(max_length = 50)]
    pub preferred_payment_method: Option<String>,
    pub push_notifications: Option<bool>,
    pub email_notifications: Option<bool>,
    pub sms_notifications: Option<bool>,
    pub marketing_emails: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(min_length = 1)]
    #[validate(max_length = 30)]
    pub first_name: Option<String>,
    #[validate(min_length = 1)]
    #[validate(max_length = 30)]
    pub last_name: Option<String>,
    #[validate(pattern = r"^\+?[0-9]{7,15}$")]
    pub phone_number: Option<String>,
    /// `YYYY-MM-DD`
    pub date_of_birth: Option<String>,
    pub gender: Option<Gender>,
    #[validate(max_length = 100)]
    pub city: Option<String>,
    #[validate(max_length = 100)]
    pub state: Option<String>,
    #[validate(max_length = 100)]
    pub country: Option<String>,
    #[validate(min_length = 2)]
    #[validate(max_length = 10)]
    pub preferred_language: Option<String>,
    pub current_location: Option<LocationInput>,
    pub preferences: Option<PreferencesInput>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AddAddressRequest {
    pub address_type: AddressType,
    #[validate(min_length = 1)]
    #[validate(max_length = 50)]
    pub label: String,
    #[validate(min_length = 1)]
    #[validate(max_length = 255)]
    pub street_address: String,
    #[validate(max_length = 50)]
    pub apartment_number: Option<String>,
    #[validate(max_length = 100)]
    pub landmark: Option<String>,
    #[validate(min_length = 1)]
    #[validate(max_length = 100)]
    pub city: String,
    #[validate(min_length = 1)]
    #[validate(max_length = 100)]
    pub state: String,
    #[validate(min_length = 1)]
    #[validate(max_length = 10)]
    pub postal_code: String,
    #[validate(max_length = 100)]
    pub country: Option<String>,
    pub location: Option<LocationInput>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NearbyUsersParams {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub radius: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VerifyEmailRequest {
    #[validate(min_length = 1)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PasswordResetRequest {
    #[validate(min_length = 1)]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PasswordResetConfirmRequest {
    #[validate(min_length = 1)]
    pub token: String,
    #[validate(min_length = 8)]
    #[validate(max_length = 128)]
    pub new_password: String,
    pub new_password_confirm: String,
}

// responses
fn rfc3339(date: DateTime) -> String {
    date.try_to_rfc3339_string().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocationResponse {
    pub lat: f64,
    pub lng: f64,
}

impl From<&GeoPoint> for LocationResponse {
    fn from(point: &GeoPoint) -> Self {
        LocationResponse {
            lat: point.latitude(),
            lng: point.longitude(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddressResponse {
    pub id: String,
    pub address_type: AddressType,
    pub label: String,
    pub street_address: String,
    pub apartment_number: Option<String>,
    pub landmark: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub location: Option<LocationResponse>,
    pub is_default: bool,
    pub created_at: String,
    pub updated_at: String,
}
impl Response for AddressResponse {}

impl From<&UserAddress> for AddressResponse {
    fn from(address: &UserAddress) -> Self {
        AddressResponse {
            id: address.id.clone(),
            address_type: address.address_type,
            label: address.label.clone(),
            street_address: address.street_address.clone(),
            apartment_number: address.apartment_number.clone(),
            landmark: address.landmark.clone(),
            city: address.city.clone(),
            state: address.state.clone(),
            postal_code: address.postal_code.clone(),
            country: address.country.clone(),
            location: address.location.as_ref().map(LocationResponse::from),
            is_default: address.is_default,
            created_at: rfc3339(address.created_at),
            updated_at: rfc3339(address.updated_at),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileResponse {
    pub favorite_cuisines: Vec<String>,
    pub dietary_restrictions: Vec<String>,
    pub preferred_payment_method: String,
    pub total_orders: u32,
    pub total_spent: f64,
    pub loyalty_points: u32,
    pub referral_code: Option<String>,
    pub push_notifications: bool,
    pub email_notifications: bool,
    pub sms_notifications: bool,
    pub marketing_emails: bool,
}

impl From<&UserProfile> for ProfileResponse {
    fn from(profile: &UserProfile) -> Self {
        ProfileResponse {
            favorite_cuisines: profile.favorite_cuisines.clone(),
            dietary_restrictions: profile.dietary_restrictions.clone(),
            preferred_payment_method: profile.preferred_payment_method.clone(),
            total_orders: profile.total_orders,
            total_spent: profile.total_spent,
            loyalty_points: profile.loyalty_points,
            referral_code: profile.referral_code.clone(),
            push_notifications: profile.push_notifications,
            email_notifications: profile.email_notifications,
            sms_notifications: profile.sms_notifications,
            marketing_emails: profile.marketing_emails,
        }
    }
}

/// Public view of a user. Password hashes and one-time tokens never leave
/// the service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub phone_number: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub user_type: UserType,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub is_active: bool,
    pub date_of_birth: Option<String>,
    pub gender: Option<Gender>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: String,
    pub preferred_language: String,
    pub current_location: Option<LocationResponse>,
    pub addresses: Vec<AddressResponse>,
    pub default_address_id: Option<String>,
    pub profile: ProfileResponse,
    pub date_joined: String,
    pub last_login: Option<String>,
}
impl Response for UserResponse {}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id.clone(),
            email: user.email.clone(),
            phone_number: user.phone_number.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            full_name: user.full_name(),
            user_type: user.user_type,
            email_verified: user.email_verified,
            phone_verified: user.phone_verified,
            is_active: user.is_active,
            date_of_birth: user.date_of_birth.clone(),
            gender: user.gender,
            city: user.city.clone(),
            state: user.state.clone(),
            country: user.country.clone(),
            preferred_language: user.preferred_language.clone(),
            current_location: user.current_location.as_ref().map(LocationResponse::from),
            addresses: user.addresses.iter().map(AddressResponse::from).collect(),
            default_address_id: user.default_address().map(|address| address.id.clone()),
            profile: ProfileResponse::from(&user.profile),
            date_joined: rfc3339(user.date_joined),
            last_login: user.last_login.map(rfc3339),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthResponse {
    pub message: String,
    pub user: UserResponse,
    pub tokens: TokenPair,
}
impl Response for AuthResponse {}

impl Response for TokenPair {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddressListResponse {
    pub addresses: Vec<AddressResponse>,
}
impl Response for AddressListResponse {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NearbyUserResponse {
    pub id: String,
    pub full_name: String,
    pub user_type: UserType,
    pub city: Option<String>,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NearbyUsersResponse {
    pub count: usize,
    pub radius_km: f64,
    pub results: Vec<NearbyUserResponse>,
}
impl Response for NearbyUsersResponse {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
impl Response for MessageResponse {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiError {
    pub error: String,
}
impl Response for ApiError {}
