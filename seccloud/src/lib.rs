pub mod inspect;
pub mod metrics;
pub mod transfer;
