//! Compatibility date and flag resolution.
//!
//! Some engine behaviours are switched on by default once a worker's
//! compatibility date reaches the date the behaviour shipped. A worker can
//! opt out with the matching disable flag.

use std::collections::BTreeSet;

/// Date used when a worker doesn't declare one.
pub const DEFAULT_COMPATIBILITY_DATE: &str = "2000-01-01";

/// A flag that becomes default-on at a given date.
#[derive(Debug, Clone, Copy)]
pub struct DefaultOnFlag {
    /// Flag enabled when the date is reached.
    pub enable: &'static str,
    /// Flag that opts out.
    pub disable: &'static str,
    /// `YYYY-MM-DD` date from which the flag is on.
    pub date: &'static str,
}

/// Flags that turn on automatically, ordered by date.
pub const DEFAULT_ON_FLAGS: &[DefaultOnFlag] = &[
    DefaultOnFlag {
        enable: "formdata_parser_supports_files",
        disable: "formdata_parser_converts_files_to_strings",
        date: "2021-11-03",
    },
    DefaultOnFlag {
        enable: "fetch_refuses_unknown_protocols",
        disable: "fetch_treats_unknown_protocols_as_http",
        date: "2021-11-10",
    },
    DefaultOnFlag {
        enable: "durable_object_fetch_requires_full_url",
        disable: "durable_object_fetch_allows_relative_url",
        date: "2021-11-10",
    },
    DefaultOnFlag {
        enable: "global_navigator",
        disable: "no_global_navigator",
        date: "2022-03-21",
    },
    DefaultOnFlag {
        enable: "export_commonjs_default",
        disable: "export_commonjs_namespace",
        date: "2022-10-31",
    },
    DefaultOnFlag {
        enable: "url_standard",
        disable: "url_original",
        date: "2022-10-31",
    },
    DefaultOnFlag {
        enable: "streams_enable_constructors",
        disable: "streams_disable_constructors",
        date: "2022-11-30",
    },
    DefaultOnFlag {
        enable: "transformstream_enable_standard_constructor",
        disable: "transformstream_disable_standard_constructor",
        date: "2022-11-30",
    },
    DefaultOnFlag {
        enable: "strict_compression_checks",
        disable: "no_strict_compression_checks",
        date: "2023-08-01",
    },
    DefaultOnFlag {
        enable: "web_socket_compression",
        disable: "no_web_socket_compression",
        date: "2023-08-15",
    },
    DefaultOnFlag {
        enable: "nodejs_compat_populate_process_env",
        disable: "nodejs_compat_do_not_populate_process_env",
        date: "2025-04-01",
    },
];

/// Returns `true` if `date` is a well-formed `YYYY-MM-DD` calendar date.
pub fn is_valid_date(date: &str) -> bool {
    let parts: Vec<&str> = date.split('-').collect();
    let [year, month, day] = parts.as_slice() else {
        return false;
    };
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        return false;
    }
    let (Ok(_), Ok(month), Ok(day)) = (year.parse::<u16>(), month.parse::<u8>(), day.parse::<u8>())
    else {
        return false;
    };
    (1..=12).contains(&month) && (1..=31).contains(&day)
}

/// Resolve the effective flag set for a worker.
///
/// Explicit flags are kept; every default-on flag whose date is on or before
/// `date` is added unless its disable flag is present. The result is sorted.
pub fn resolve_flags(date: &str, explicit: &[String]) -> Vec<String> {
    let mut flags: BTreeSet<String> = explicit.iter().cloned().collect();

    for flag in DEFAULT_ON_FLAGS {
        // ISO dates compare correctly as strings
        if date >= flag.date && !flags.contains(flag.disable) {
            flags.insert(flag.enable.to_string());
        }
    }

    flags.into_iter().collect()
}
