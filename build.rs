//! Build script for the Hermes engine.
//!
//! Recompile when migration files change so the `SQLx` `migrate!()` macro
//! picks up schema updates.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
