pub mod buf;
pub mod exponential_backoff;
