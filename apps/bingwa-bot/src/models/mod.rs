pub mod bundle;
pub mod payment;
pub mod session;
pub mod user;
