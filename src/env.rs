// Environment variables related to the compositor
//
// All runtime configuration comes in through these; there are no CLI
// flags. Parsing is split from the env reads so it can be tested.

use mland::display::drm::DrmPaths;
use utils::log;

/// `:`-separated DRM node paths. A plain path is an explicit include,
/// a `!`-prefixed path an explicit exclude. Default: every card node.
pub const DRM_DEVICE_ENV: &str = "MLAND_DRM_DEVICES";

/// Log level, int in 1..=4 (1=debug, 2=info, 3=warn, 4=error).
/// A lower level implies all higher ones. Default: 2.
pub const LOG_LEVEL_ENV: &str = "MLAND_LOG_LEVEL";

/// Non-zero enables the Khronos validation layer and the debug-utils
/// messenger. Default: 0.
pub const VALIDATION_LAYERS_ENV: &str = "MLAND_VALIDATION_LAYERS";

/// Windows to create when falling back to the SDL backend. Default: 1.
pub const MAX_WINDOWS_ENV: &str = "MLAND_SDL_MAX_WINDOWS";

pub fn parse_drm_paths(list: &str) -> DrmPaths {
    let mut paths = DrmPaths::default();
    for entry in list.split(':') {
        if entry.is_empty() {
            continue;
        }
        if let Some(excluded) = entry.strip_prefix('!') {
            if excluded.is_empty() {
                continue;
            }
            log::debug!("Excluding {}", excluded);
            paths.dp_explicit_exclude.push(excluded.to_string());
        } else {
            log::debug!("Including {}", entry);
            paths.dp_explicit_include.push(entry.to_string());
        }
    }
    paths
}

pub fn get_drm_paths() -> DrmPaths {
    match std::env::var(DRM_DEVICE_ENV) {
        Ok(list) => {
            log::debug!("User specified DRM devices: {}", list);
            parse_drm_paths(&list)
        }
        Err(_) => DrmPaths::default(),
    }
}

pub fn parse_log_level(val: &str) -> Option<u32> {
    match val.trim().parse::<u32>() {
        Ok(level @ 1..=4) => Some(level),
        _ => None,
    }
}

/// Validate the log level up front so a typo fails loudly instead of
/// silently logging at the default
pub fn get_log_level() -> anyhow::Result<u32> {
    match std::env::var(LOG_LEVEL_ENV) {
        Ok(val) => parse_log_level(&val)
            .ok_or_else(|| anyhow::anyhow!("Invalid log level: {}", val)),
        Err(_) => Ok(2),
    }
}

fn parse_toggle(val: &str) -> bool {
    val.trim().parse::<u32>().map(|v| v != 0).unwrap_or(false)
}

pub fn get_validation_layers() -> bool {
    match std::env::var(VALIDATION_LAYERS_ENV) {
        Ok(val) => parse_toggle(&val),
        Err(_) => false,
    }
}

pub fn get_max_windows() -> u32 {
    match std::env::var(MAX_WINDOWS_ENV) {
        Ok(val) => val.trim().parse().unwrap_or(1),
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drm_paths_split_into_include_and_exclude() {
        let paths = parse_drm_paths("/dev/dri/card0:!/dev/dri/card1");
        assert_eq!(paths.dp_explicit_include, vec!["/dev/dri/card0"]);
        assert_eq!(paths.dp_explicit_exclude, vec!["/dev/dri/card1"]);
    }

    #[test]
    fn drm_paths_skip_empty_entries() {
        let paths = parse_drm_paths("::/dev/dri/card2::!:");
        assert_eq!(paths.dp_explicit_include, vec!["/dev/dri/card2"]);
        assert!(paths.dp_explicit_exclude.is_empty());

        let empty = parse_drm_paths("");
        assert_eq!(empty, DrmPaths::default());
    }

    #[test]
    fn log_levels_outside_range_are_rejected() {
        assert_eq!(parse_log_level("1"), Some(1));
        assert_eq!(parse_log_level(" 4 "), Some(4));
        assert_eq!(parse_log_level("0"), None);
        assert_eq!(parse_log_level("5"), None);
        assert_eq!(parse_log_level("verbose"), None);
    }

    #[test]
    fn validation_toggle_wants_a_nonzero_int() {
        assert!(parse_toggle("1"));
        assert!(parse_toggle("2"));
        assert!(!parse_toggle("0"));
        assert!(!parse_toggle("yes"));
    }
}
