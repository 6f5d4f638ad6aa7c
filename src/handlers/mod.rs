pub mod event_handlers;
pub mod health_handlers;
pub mod result_handlers;
