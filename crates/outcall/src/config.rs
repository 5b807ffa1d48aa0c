//! Dispatcher configuration

use std::env;
use std::fmt;

/// What to do when a call site's trampoline could not be built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnbuildablePolicy {
    /// Answer from the cached negative entry; never rebuild
    #[default]
    Remember,
    /// Re-run the build on every dispatch of the call site
    Retry,
}

impl UnbuildablePolicy {
    /// Parse `remember` / `retry`
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.to_ascii_lowercase().as_str() {
            "remember" | "cache" => Some(Self::Remember),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for UnbuildablePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnbuildablePolicy::Remember => "remember",
            UnbuildablePolicy::Retry => "retry",
        })
    }
}

/// Code generation optimisation level for trampolines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// No optimisation
    None,
    /// Optimise for speed
    #[default]
    Speed,
    /// Optimise for speed and size
    SpeedAndSize,
}

impl OptLevel {
    /// Parse `none` / `speed` / `speed_and_size`
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "0" => Some(Self::None),
            "speed" | "1" => Some(Self::Speed),
            "speed_and_size" | "2" => Some(Self::SpeedAndSize),
            _ => None,
        }
    }

    /// Value of the code generator's `opt_level` setting
    pub fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_setting())
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Negative-cache behaviour
    pub unbuildable: UnbuildablePolicy,
    /// Bind the C runtime table of [`PreboundSymbols::crt`](crate::PreboundSymbols::crt)
    pub prebind_crt: bool,
    /// Trampoline optimisation level (used when the dispatcher creates its backend)
    pub opt_level: OptLevel,
}

impl DispatchConfig {
    /// Defaults, before any environment overrides
    pub const DEFAULT: Self = Self {
        unbuildable: UnbuildablePolicy::Remember,
        // Dynamic lookup of these is only unreliable on Windows.
        prebind_crt: cfg!(windows),
        opt_level: OptLevel::Speed,
    };

    /// Defaults overridden by `OUTCALL_UNBUILDABLE`, `OUTCALL_PREBIND_CRT`
    /// and `OUTCALL_OPT_LEVEL`. Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str| env::var_os(name).map(|value| value.to_string_lossy().to_string());
        apply_env_overrides(
            Self::DEFAULT,
            var("OUTCALL_UNBUILDABLE").as_deref(),
            var("OUTCALL_PREBIND_CRT").as_deref(),
            var("OUTCALL_OPT_LEVEL").as_deref(),
        )
    }

    /// Same settings with a different negative-cache policy
    #[must_use]
    pub fn with_unbuildable(self, unbuildable: UnbuildablePolicy) -> Self {
        Self { unbuildable, ..self }
    }

    /// Same settings with the C runtime table switched on or off
    #[must_use]
    pub fn with_prebind_crt(self, prebind_crt: bool) -> Self {
        Self { prebind_crt, ..self }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_flag(spec: &str) -> Option<bool> {
    match spec.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(
    mut config: DispatchConfig,
    unbuildable: Option<&str>,
    prebind_crt: Option<&str>,
    opt_level: Option<&str>,
) -> DispatchConfig {
    if let Some(policy) = unbuildable.and_then(UnbuildablePolicy::parse) {
        config.unbuildable = policy;
    }
    if let Some(flag) = prebind_crt.and_then(parse_flag) {
        config.prebind_crt = flag;
    }
    if let Some(level) = opt_level.and_then(OptLevel::parse) {
        config.opt_level = level;
    }
    config
}
