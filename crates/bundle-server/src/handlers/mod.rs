pub mod apps;
pub mod client;
pub mod deployments;
pub mod health;
pub mod readiness;
pub mod releases;
