pub mod admin_service;
pub mod notification_service;
pub mod pay_service;
pub mod session_service;
pub mod store_service;
