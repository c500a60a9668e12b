#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use netpol_controller_core as core;
pub use netpol_controller_k8s_api as k8s;
pub use netpol_controller_k8s_index as index;

mod args;
mod cache;
mod dns;
mod status;
mod watch;

pub use self::args::Args;
