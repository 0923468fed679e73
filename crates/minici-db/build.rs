//! Rebuild when migrations change.
//!
//! `sqlx::migrate!` embeds the migration files at compile time, so cargo has
//! to be told to watch the directory.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
