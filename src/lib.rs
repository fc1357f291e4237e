#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::ignored_unit_patterns
)]

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod model;
pub mod rpc;
pub mod session;
pub mod status;
pub mod store;
