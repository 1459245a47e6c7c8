use mongodb::bson::DateTime;
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0088;
const REFERRAL_CODE_LENGTH: usize = 8;
const REFERRAL_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const TOKEN_LENGTH: usize = 43;
pub const PASSWORD_RESET_VALIDITY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeoJsonType {
    Point,
}

/// GeoJSON point. Coordinates are stored `[longitude, latitude]` so the
/// document can back a 2dsphere index directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "type")]
    pub kind: GeoJsonType,
    pub coordinates: [f64; 2],
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoPoint {
            kind: GeoJsonType::Point,
            coordinates: [longitude, latitude],
        }
    }

    pub fn latitude(&self) -> f64 {
        self.coordinates[1]
    }

    pub fn longitude(&self) -> f64 {
        self.coordinates[0]
    }

    /// Great-circle distance using the haversine formula.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.latitude().to_radians(), other.latitude().to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude() - self.longitude()).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Customer,
    Vendor,
    DeliveryPartner,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "O")]
    Other,
    #[serde(rename = "N")]
    PreferNotToSay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    Home,
    Work,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAddress {
    pub id: String,
    pub address_type: AddressType,
    pub label: String,
    pub street_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apartment_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmark: Option<String>,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub favorite_cuisines: Vec<String>,
    #[serde(default)]
    pub dietary_restrictions: Vec<String>,
    pub preferred_payment_method: String,
    #[serde(default)]
    pub total_orders: u32,
    #[serde(default)]
    pub total_spent: f64,
    #[serde(default)]
    pub loyalty_points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    pub push_notifications: bool,
    pub email_notifications: bool,
    pub sms_notifications: bool,
    pub marketing_emails: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Default for UserProfile {
    fn default() -> Self {
        let now = DateTime::now();
        UserProfile {
            favorite_cuisines: Vec::new(),
            dietary_restrictions: Vec::new(),
            preferred_payment_method: String::from("razorpay"),
            total_orders: 0,
            total_spent: 0.0,
            loyalty_points: 0,
            referral_code: None,
            push_notifications: true,
            email_notifications: true,
            sms_notifications: true,
            marketing_emails: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    pub phone_number: String,
    pub password: String,
    pub user_type: UserType,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub phone_verified: bool,
    pub is_active: bool,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub country: String,
    pub preferred_language: String,
    #[serde(default)]
    pub addresses: Vec<UserAddress>,
    #[serde(default)]
    pub profile: UserProfile,
    pub date_joined: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime>,
    pub updated_at: DateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_reset_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_reset_expires: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verification_token: Option<String>,
}

impl User {
    pub fn new(
        email: &str,
        phone_number: String,
        password_hash: String,
        first_name: String,
        last_name: String,
        user_type: UserType,
    ) -> Self {
        let now = DateTime::now();
        User {
            id: uuid::Uuid::new_v4().to_string(),
            email: normalize_email(email),
            phone_number,
            password: password_hash,
            user_type,
            first_name,
            last_name,
            date_of_birth: None,
            gender: None,
            email_verified: false,
            phone_verified: false,
            is_active: true,
            is_staff: false,
            is_superuser: false,
            current_location: None,
            city: None,
            state: None,
            country: String::from("India"),
            preferred_language: String::from("en"),
            addresses: Vec::new(),
            profile: UserProfile::default(),
            date_joined: now,
            last_login: None,
            updated_at: now,
            password_reset_token: None,
            password_reset_expires: None,
            email_verification_token: None,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    pub fn touch(&mut self) {
        self.updated_at = DateTime::now();
    }

    /// Appends an address. The first address is always the default, and a new
    /// default clears the flag on every other address.
    pub fn add_address(&mut self, mut address: UserAddress) -> UserAddress {
        if self.addresses.is_empty() {
            address.is_default = true;
        }

        if address.is_default {
            for existing in self.addresses.iter_mut() {
                existing.is_default = false;
            }
        }

        self.addresses.push(address.clone());
        self.touch();
        address
    }

    pub fn default_address(&self) -> Option<&UserAddress> {
        self.addresses
            .iter()
            .find(|address| address.is_default)
            .or_else(|| self.addresses.first())
    }

    pub fn start_password_reset(&mut self) -> String {
        let token = generate_token();
        self.password_reset_token = Some(token.clone());
        self.password_reset_expires = Some(DateTime::from_millis(
            DateTime::now().timestamp_millis() + PASSWORD_RESET_VALIDITY_MILLIS,
        ));
        self.touch();
        token
    }

    pub fn password_reset_expired(&self, at: DateTime) -> bool {
        match self.password_reset_expires {
            Some(expires) => at > expires,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub email: String,
    pub ip_address: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub attempted_at: DateTime,
}

impl LoginAttempt {
    pub fn new(email: &str, ip_address: String, user_agent: Option<String>, failure_reason: Option<&str>) -> Self {
        LoginAttempt {
            email: normalize_email(email),
            ip_address,
            success: failure_reason.is_none(),
            user_agent,
            failure_reason: failure_reason.map(String::from),
            attempted_at: DateTime::now(),
        }
    }
}

/// A refresh token that may no longer be exchanged. Stored until the token
/// would have expired anyway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistedToken {
    #[serde(rename = "_id")]
    pub jti: String,
    pub user_id: String,
    pub blacklisted_at: DateTime,
    pub expires_at: DateTime,
}

impl BlacklistedToken {
    pub fn new(jti: &str, user_id: &str, expires_at_seconds: i64) -> Self {
        BlacklistedToken {
            jti: jti.to_string(),
            user_id: user_id.to_string(),
            blacklisted_at: DateTime::now(),
            expires_at: DateTime::from_millis(expires_at_seconds.saturating_mul(1000)),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn generate_referral_code() -> String {
    let mut rng = rand::rng();
    (0..REFERRAL_CODE_LENGTH)
        .map(|_| REFERRAL_CODE_CHARSET[rng.random_range(0..REFERRAL_CODE_CHARSET.len())] as char)
        .collect()
}

/// URL-safe random token for email verification and password resets.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
