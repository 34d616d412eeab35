#![allow(dead_code)]

mod harness;
mod http_utils;
mod net;
mod upstream;

pub use harness::*;
pub use http_utils::*;
pub use net::*;
pub use upstream::*;
