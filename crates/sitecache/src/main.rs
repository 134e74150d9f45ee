//! Sitecache.
//!
//! Sitecache keeps the local page cache of the content server healthy. It opens the configured
//! cache directory, removes expired entries on a schedule, and offers a couple of maintenance
//! commands to clean up, invalidate and inspect cached entries by hand.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cache;
mod cli;
mod logging;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
