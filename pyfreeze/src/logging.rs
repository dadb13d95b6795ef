// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {log::LevelFilter, std::io::Write};

/// The log level selected by a `silent` value.
pub fn level_for_silent(silent: u8) -> LevelFilter {
    match silent {
        0 => LevelFilter::Info,
        1 | 2 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

/// Initialize the global logger.
///
/// `RUST_LOG` overrides the level derived from `silent`. Records are written
/// to stderr as `<severity>: <message>`.
pub fn init_logging(silent: u8) {
    let log_level = level_for_silent(silent);

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{}: {}",
            record.level().as_str().to_lowercase(),
            record.args()
        )
    });

    // A logger may already be installed when running under tests.
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_levels() {
        assert_eq!(level_for_silent(0), LevelFilter::Info);
        assert_eq!(level_for_silent(1), LevelFilter::Warn);
        assert_eq!(level_for_silent(2), LevelFilter::Warn);
        assert_eq!(level_for_silent(3), LevelFilter::Error);
    }
}
