//! Runtime configuration.
use tracing::Level;

/// Environment variable selecting the log level of the driver.
pub const ENV_TRACING_LEVEL: &str = "DRIP_LOG_LEVEL";
/// Environment variable turning guest exception translation on.
pub const ENV_GUEST_EXCEPTIONS: &str = "DRIP_GUEST_EXCEPTIONS";

const DEFAULT_TRACING_LEVEL: Level = Level::WARN;
/// Guest frames allowed on one logical thread before a stack overflow is
/// raised. Every guest frame is also a host frame.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;
/// Frames allowed past the configured depth while a runtime condition is
/// being turned into a guest throwable.
pub const RESERVED_FRAMES: usize = 32;
/// Host stack budgeted for one guest frame, sized for unoptimized builds.
pub const HOST_STACK_PER_FRAME: usize = 256 * 1024;
// Without a depth limit the host stack is the limit.
const UNBOUNDED_HOST_STACK: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Turn runtime conditions and linkage failures into guest throwables
    /// that bytecode handlers can catch.
    pub guest_exceptions: bool,
    /// `None` means no limit beyond the host stack.
    pub max_call_depth: Option<usize>,
    pub tracing_level: Level,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            guest_exceptions: false,
            max_call_depth: Some(DEFAULT_MAX_CALL_DEPTH),
            tracing_level: DEFAULT_TRACING_LEVEL,
        }
    }
}

impl RuntimeConfig {
    /// Default configuration with overrides taken from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(level) = std::env::var(ENV_TRACING_LEVEL) {
            config.tracing_level = parse_level(&level);
        }
        if let Ok(flag) = std::env::var(ENV_GUEST_EXCEPTIONS) {
            config.guest_exceptions = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        config
    }

    /// Stack size for the host thread running guest code, large enough for
    /// `max_call_depth` guest frames plus the reserved ones.
    pub fn host_stack_size(&self) -> usize {
        match self.max_call_depth {
            Some(depth) => depth
                .saturating_add(RESERVED_FRAMES + 1)
                .saturating_mul(HOST_STACK_PER_FRAME),
            None => UNBOUNDED_HOST_STACK,
        }
    }
}

fn parse_level(value: &str) -> Level {
    if value.eq_ignore_ascii_case("trace") || value == "*" {
        Level::TRACE
    } else if value.eq_ignore_ascii_case("debug") {
        Level::DEBUG
    } else if value.eq_ignore_ascii_case("info") {
        Level::INFO
    } else if value.eq_ignore_ascii_case("warn") {
        Level::WARN
    } else if value.eq_ignore_ascii_case("error") {
        Level::ERROR
    } else {
        DEFAULT_TRACING_LEVEL
    }
}
