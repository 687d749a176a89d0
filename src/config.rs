// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Configuration
//!
//! Connection details and process-wide messaging settings. The dead-letter
//! exchange name lives here instead of in a constant so tests can point every
//! queue at a distinct exchange.

use crate::errors::AmqpError;
use serde::Deserialize;

/// Dead-letter exchange used when none is configured
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "peril_dlx";
/// Prefetch applied by subscriptions when none is configured
pub const DEFAULT_PREFETCH: u16 = 10;

const ENV_HOST: &str = "RABBITMQ_HOST";
const ENV_PORT: &str = "RABBITMQ_PORT";
const ENV_USER: &str = "RABBITMQ_USER";
const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
const ENV_VHOST: &str = "RABBITMQ_VHOST";
const ENV_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";
const ENV_DEAD_LETTER_EXCHANGE: &str = "RABBITMQ_DEAD_LETTER_EXCHANGE";
const ENV_PREFETCH: &str = "RABBITMQ_PREFETCH";

/// Broker connection and messaging settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    pub dead_letter_exchange: String,
    pub prefetch: u16,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            connection_name: "pubsub".to_owned(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_owned(),
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads `RABBITMQ_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(host) = lookup(ENV_HOST) {
            cfg.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            cfg.port = parse_number(ENV_PORT, &port)?;
        }
        if let Some(user) = lookup(ENV_USER) {
            cfg.user = user;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            cfg.password = password;
        }
        if let Some(vhost) = lookup(ENV_VHOST) {
            cfg.vhost = vhost;
        }
        if let Some(name) = lookup(ENV_CONNECTION_NAME) {
            cfg.connection_name = name;
        }
        if let Some(dlx) = lookup(ENV_DEAD_LETTER_EXCHANGE) {
            cfg.dead_letter_exchange = dlx;
        }
        if let Some(prefetch) = lookup(ENV_PREFETCH) {
            cfg.prefetch = parse_number(ENV_PREFETCH, &prefetch)?;
        }

        Ok(cfg)
    }

    /// The AMQP URI for this configuration.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

fn parse_number(key: &str, value: &str) -> Result<u16, AmqpError> {
    value
        .trim()
        .parse()
        .map_err(|_| AmqpError::ConfigError(format!("{key}={value}")))
}
