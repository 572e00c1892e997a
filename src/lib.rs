extern crate serde;
extern crate serde_json;

extern crate clap;
extern crate flate2;
extern crate itertools;
#[macro_use]
extern crate lazy_static;
extern crate rand;
extern crate tracing;
extern crate tracing_subscriber;

pub mod abstract_filtering;
pub mod config;
pub mod file_format;
pub mod logging;
pub mod worker;
pub mod worker_error;
