//! Masking of identifying values before they reach logs or audit events.

pub mod mask;

pub use mask::{anonymize_addr, anonymize_ip, mask_client_ip, mask_token, mask_user};
