extern crate core;

mod pkg_lib;

pub use pkg_lib::*;
