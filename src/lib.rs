#![forbid(unsafe_code)]

pub mod artifact;
pub mod cli;
pub mod combine;
pub mod config;
pub mod driver;
pub mod fetcher;
pub mod formats;
pub mod ledger;
pub mod logging;
pub mod normalize;
pub mod object_store;
pub mod persist;
pub mod prepare;
pub mod replies;
pub mod source;
