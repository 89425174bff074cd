pub mod asset;
pub mod auth;
pub mod dashboard;
pub mod extract;
pub mod health;
