pub mod jwks_refresh;
