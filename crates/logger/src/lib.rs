//! Logging bootstrap shared by the binaries.
//!
//! `RUST_LOG` wins when set; otherwise the caller's default directive is used.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_DIRECTIVE: &str = "sync_pipeline=info,bank_sync=info";

/// Initialize tracing. Safe to call more than once; later calls are no-ops.
pub fn init(default_directive: Option<&str>) {
    let directive = default_directive.unwrap_or(DEFAULT_DIRECTIVE).to_string();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| directive.into());

    if tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init(Some("debug"));
        init(None);
    }
}
