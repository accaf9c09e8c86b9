//! Build metadata stamped in by `build.rs`, surfaced in startup logs so a
//! deployed binary can be matched back to the commit it was built from.

pub const BUILD_TIMESTAMP: &str = env!("RELAY_BUILD_TIMESTAMP");
pub const RUST_VERSION: &str = env!("RELAY_RUST_VERSION");
pub const GIT_HASH: &str = env!("RELAY_GIT_HASH");

pub fn log_startup_banner(binary: &str) {
    tracing::info!(
        binary,
        git_hash = GIT_HASH,
        rust_version = RUST_VERSION,
        built_at = BUILD_TIMESTAMP,
        "starting"
    );
}
