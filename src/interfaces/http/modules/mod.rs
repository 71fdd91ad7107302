pub mod charging;
pub mod health;
pub mod metrics;
