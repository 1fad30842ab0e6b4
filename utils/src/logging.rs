// Leveled logging for the compositor
//
// This is called from every thread in the process, so it keeps no
// mutable state. The active level is latched from MLAND_LOG_LEVEL the
// first time a message is considered.

#[allow(non_camel_case_types)]
pub enum LogLevel {
    debug,
    info,
    warn,
    error,
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::debug => "debug",
            LogLevel::info => "info",
            LogLevel::warn => "warn",
            LogLevel::error => "error",
        }
    }

    /// Numeric levels match the MLAND_LOG_LEVEL contract: 1=debug,
    /// 2=info, 3=warn, 4=error. A lower setting implies all higher
    /// levels.
    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::debug => 1,
            LogLevel::info => 2,
            LogLevel::warn => 3,
            LogLevel::error => 4,
        }
    }
}

/// The compositor validates MLAND_LOG_LEVEL at startup, so anything
/// unparseable here just falls back to the default.
pub fn active_level() -> u32 {
    lazy_static::lazy_static! {
        static ref ACTIVE_LEVEL: u32 = match std::env::var("MLAND_LOG_LEVEL") {
            Ok(val) => match val.trim().parse::<u32>() {
                Ok(lvl @ 1..=4) => lvl,
                _ => LogLevel::info.get_level(),
            },
            Err(_) => LogLevel::info.get_level(),
        };
    }

    *ACTIVE_LEVEL
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => {{
        log::log_internal!(log::LogLevel::debug, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => {{
        log::log_internal!(log::LogLevel::info, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! warn {
    ($($format_args:tt)+) => {{
        log::log_internal!(log::LogLevel::warn, $($format_args)+)
    }};
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => {{
        log::log_internal!(log::LogLevel::error, $($format_args)+)
    }};
}

#[allow(unused_macros)]
#[macro_export]
macro_rules! log_internal {
    ($loglevel:expr, $($format_args:tt)+) => ({
        let level = $loglevel;
        if level.get_level() >= $crate::logging::active_level() {
            println!("[{:?}]<{}> {}:{} - {}",
                log::get_current_millis(),
                level.get_name(),
                file!(),
                line!(),
                format!($($format_args)+)
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::debug.get_level() < LogLevel::info.get_level());
        assert!(LogLevel::info.get_level() < LogLevel::warn.get_level());
        assert!(LogLevel::warn.get_level() < LogLevel::error.get_level());
    }
}
