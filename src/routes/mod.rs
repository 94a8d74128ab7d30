pub mod admin;
pub mod characters;
pub mod health;
pub mod metrics;
pub mod queues;
