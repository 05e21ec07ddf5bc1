pub mod env;
pub mod message;
pub mod rabbitmq;
pub mod services;
