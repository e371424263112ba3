//! stderr logging through `env_logger`.

use env_logger::{Builder, Env, Target};

/// Filter used when neither `--log` nor `RUST_LOG` is set
const DEFAULT_FILTER: &str = "info";

fn builder(directives: Option<&str>) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER));
    if let Some(directives) = directives {
        builder.parse_filters(directives);
    }
    builder.format_timestamp_millis().target(Target::Stderr);
    builder
}

/// Install the logger. `directives` overrides `RUST_LOG`.
pub fn init(directives: Option<&str>) -> Result<(), String> {
    builder(directives)
        .try_init()
        .map_err(|e| format!("Failed to install logger: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log, Metadata};

    #[test]
    fn test_filter_directives() {
        let logger = builder(Some("warn,handy_conductor::devops=debug")).build();
        let info_elsewhere = Metadata::builder().level(Level::Info).target("rusqlite").build();
        let debug_here = Metadata::builder()
            .level(Level::Debug)
            .target("handy_conductor::devops::tmux")
            .build();
        assert!(!logger.enabled(&info_elsewhere));
        assert!(logger.enabled(&debug_here));
    }
}
