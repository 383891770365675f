pub mod bundle;
pub mod filter;
pub mod health;
pub mod metrics;
pub mod retry;
pub mod validator;
