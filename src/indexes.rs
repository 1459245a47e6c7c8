use std::time::Duration;

use mongodb::{
    bson::{doc, Document},
    options::IndexOptions,
    Database, IndexModel,
};
use tracing::{event, Level};

use crate::{
    error::RepositoryError,
    repositories::{LOGIN_ATTEMPTS_COLLECTION, TOKEN_BLACKLIST_COLLECTION, USERS_COLLECTION},
};

pub const RESTAURANTS_COLLECTION: &str = "restaurants";
pub const PRODUCTS_COLLECTION: &str = "products";
pub const ORDERS_COLLECTION: &str = "orders";

const LOGIN_ATTEMPT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexKind {
    Ascending,
    Unique,
    /// Unique over documents that carry the field.
    UniqueSparse,
    Geo2dSphere,
    Text,
    Ttl(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub collection: &'static str,
    pub fields: Vec<&'static str>,
    pub kind: IndexKind,
}

impl IndexSpec {
    fn new(collection: &'static str, fields: &[&'static str], kind: IndexKind) -> Self {
        IndexSpec {
            collection,
            fields: fields.to_vec(),
            kind,
        }
    }

    pub fn keys(&self) -> Document {
        let mut keys = Document::new();
        for field in &self.fields {
            match self.kind {
                IndexKind::Geo2dSphere => keys.insert(*field, "2dsphere"),
                IndexKind::Text => keys.insert(*field, "text"),
                _ => keys.insert(*field, 1),
            };
        }
        keys
    }

    pub fn to_model(&self) -> IndexModel {
        let options = match self.kind {
            IndexKind::Unique => Some(IndexOptions::builder().unique(true).build()),
            IndexKind::UniqueSparse => Some(IndexOptions::builder().unique(true).sparse(true).build()),
            IndexKind::Ttl(retention) => Some(IndexOptions::builder().expire_after(retention).build()),
            IndexKind::Ascending | IndexKind::Geo2dSphere | IndexKind::Text => None,
        };

        IndexModel::builder().keys(self.keys()).options(options).build()
    }
}

pub fn index_plan() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new(USERS_COLLECTION, &["email"], IndexKind::Unique),
        IndexSpec::new(USERS_COLLECTION, &["phone_number"], IndexKind::Unique),
        IndexSpec::new(USERS_COLLECTION, &["user_type"], IndexKind::Ascending),
        IndexSpec::new(USERS_COLLECTION, &["date_joined"], IndexKind::Ascending),
        IndexSpec::new(USERS_COLLECTION, &["current_location"], IndexKind::Geo2dSphere),
        IndexSpec::new(USERS_COLLECTION, &["profile.referral_code"], IndexKind::UniqueSparse),
        IndexSpec::new(RESTAURANTS_COLLECTION, &["location"], IndexKind::Geo2dSphere),
        IndexSpec::new(RESTAURANTS_COLLECTION, &["name", "cuisine_types"], IndexKind::Text),
        IndexSpec::new(PRODUCTS_COLLECTION, &["name", "description"], IndexKind::Text),
        IndexSpec::new(ORDERS_COLLECTION, &["delivery_location"], IndexKind::Geo2dSphere),
        IndexSpec::new(ORDERS_COLLECTION, &["user_id"], IndexKind::Ascending),
        IndexSpec::new(ORDERS_COLLECTION, &["created_at"], IndexKind::Ascending),
        IndexSpec::new(LOGIN_ATTEMPTS_COLLECTION, &["email"], IndexKind::Ascending),
        IndexSpec::new(LOGIN_ATTEMPTS_COLLECTION, &["ip_address"], IndexKind::Ascending),
        IndexSpec::new(LOGIN_ATTEMPTS_COLLECTION, &["attempted_at"], IndexKind::Ttl(LOGIN_ATTEMPT_RETENTION)),
        // Entries carry their own expiry date.
        IndexSpec::new(TOKEN_BLACKLIST_COLLECTION, &["expires_at"], IndexKind::Ttl(Duration::ZERO)),
    ]
}

/// Creates every index in the plan. Index creation is idempotent on the
/// server, so this runs on each startup.
pub async fn ensure_indexes(database: &Database) -> Result<(), RepositoryError> {
    for spec in index_plan() {
        let collection = database.collection::<Document>(spec.collection);
        match collection.create_index(spec.to_model()).await {
            Ok(result) => {
                event!(Level::DEBUG, "Ensured index {} on {}", result.index_name, spec.collection);
            }
            Err(e) => {
                event!(Level::ERROR, "Failed to create index {:?} on {}: {}", spec.fields, spec.collection, e);
                return Err(RepositoryError::from(e));
            }
        }
    }

    event!(Level::INFO, "MongoDB indexes are in place");
    Ok(())
}
