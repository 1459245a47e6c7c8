use std::sync::Arc;

use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments, ExchangeType, QueueBindArguments, QueueDeclareArguments},
    connection::{Connection, OpenConnectionArguments},
    BasicProperties, DELIVERY_MODE_PERSISTENT,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::{config::RabbitMqConfig, domain::UserType};

pub static USER_REGISTERED_DESTINATION: &str = "accounts.user.registered";
pub static EMAIL_VERIFIED_DESTINATION: &str = "accounts.email.verified";
pub static PASSWORD_RESET_REQUESTED_DESTINATION: &str = "accounts.password.reset.requested";
pub static PASSWORD_CHANGED_DESTINATION: &str = "accounts.password.changed";

// events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user_id: String,
        email: String,
        user_type: UserType,
        email_verification_token: String,
    },
    EmailVerified {
        user_id: String,
    },
    PasswordResetRequested {
        user_id: String,
        email: String,
        token: String,
    },
    PasswordChanged {
        user_id: String,
    },
}

impl Event {
    pub fn destination(&self) -> &'static str {
        match self {
            Event::UserRegistered { .. } => USER_REGISTERED_DESTINATION,
            Event::EmailVerified { .. } => EMAIL_VERIFIED_DESTINATION,
            Event::PasswordResetRequested { .. } => PASSWORD_RESET_REQUESTED_DESTINATION,
            Event::PasswordChanged { .. } => PASSWORD_CHANGED_DESTINATION,
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish_message(&self, event: &Event, destination_name: &str) -> Result<(), String>;
}

// event brokers
pub struct RabbitMqMessageBroker {
    connection: Connection,
}

impl RabbitMqMessageBroker {
    pub async fn new(config: &RabbitMqConfig) -> Result<RabbitMqMessageBroker, String> {
        match Connection::open(&OpenConnectionArguments::new(
            &config.uri,
            config.port,
            &config.username,
            &config.password,
        ))
        .await
        {
            Ok(connection) => match connection.register_callback(DefaultConnectionCallback).await {
                Ok(()) => {
                    event!(Level::INFO, "Connected to RabbitMQ at {}:{}", config.uri, config.port);
                    Ok(RabbitMqMessageBroker { connection })
                }
                Err(e) => Err(format!("Failed to register connection callback: {}", e)),
            },
            Err(e) => Err(format!("Failed to open RabbitMQ connection: {}", e)),
        }
    }

    /// Opens a channel bound to a fanout exchange and a durable queue that
    /// share the destination's name.
    pub async fn get_channel(&self, destination: &str) -> Result<Channel, String> {
        let channel = self
            .connection
            .open_channel(None)
            .await
            .map_err(|e| format!("Failed to get channel: {}", e))?;

        channel
            .register_callback(DefaultChannelCallback)
            .await
            .map_err(|e| format!("Failed to register channel callback: {}", e))?;
        channel
            .exchange_declare(ExchangeDeclareArguments::new(destination, &ExchangeType::Fanout.to_string()))
            .await
            .map_err(|e| format!("Failed to declare exchange {}: {}", destination, e))?;
        channel
            .queue_declare(QueueDeclareArguments::durable_client_named(destination))
            .await
            .map_err(|e| format!("Failed to declare queue {}: {}", destination, e))?;
        channel
            .queue_bind(QueueBindArguments::new(destination, destination, ""))
            .await
            .map_err(|e| format!("Failed to bind queue {}: {}", destination, e))?;

        Ok(channel)
    }
}

#[async_trait]
impl MessageBroker for RabbitMqMessageBroker {
    async fn publish_message(&self, event: &Event, destination_name: &str) -> Result<(), String> {
        let channel = self.get_channel(destination_name).await?;

        let mut delivery_properties = BasicProperties::default();
        delivery_properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        match serde_json::to_string(&event) {
            Ok(x) => {
                event!(Level::DEBUG, "Publishing event to {}", destination_name);
                let result = channel
                    .basic_publish(delivery_properties, x.into_bytes(), BasicPublishArguments::new(destination_name, ""))
                    .await
                    .map_err(|e| format!("Failed to publish event to broker: {}", e));

                if let Err(e) = channel.close().await {
                    event!(Level::WARN, "Failed to close channel: {}", e);
                }
                result
            }
            Err(e) => Err(format!("Failed to serialize event: {}", e)),
        }
    }
}

/// Logs events instead of delivering them. Used when no broker is
/// configured. Test builds also record what was published.
#[derive(Clone, Default)]
pub struct InMemoryMessageBroker {
    published: Arc<Mutex<Vec<(String, Event)>>>,
}

impl InMemoryMessageBroker {
    pub fn new() -> Self {
        InMemoryMessageBroker {
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub async fn published(&self) -> Vec<(String, Event)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl MessageBroker for InMemoryMessageBroker {
    async fn publish_message(&self, event: &Event, destination_name: &str) -> Result<(), String> {
        event!(Level::INFO, "Event for {}: {:?}", destination_name, event);
        if cfg!(test) {
            let mut lock = self.published.lock().await;
            lock.push((destination_name.to_string(), event.clone()));
        }
        Ok(())
    }
}
