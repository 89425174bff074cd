pub mod asset;
pub mod error;
pub mod health;
pub mod portfolio;
