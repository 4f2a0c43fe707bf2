#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gateway_controller_core as core;
pub use gateway_controller_k8s_api as k8s;
pub use gateway_controller_k8s_reconcile as reconcile;

mod args;
mod controllers;

pub use self::args::Args;
