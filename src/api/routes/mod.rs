pub mod alerts;
pub mod health;
pub mod lifecycle;
pub mod query;
pub mod stats;
pub mod status;
pub mod targets;
