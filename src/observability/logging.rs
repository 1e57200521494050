use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Install a timestamped, level-colored logger on stdout.
///
/// A second call fails instead of replacing the installed logger.
pub fn init_logging(level: log::Level) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::BrightBlack);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level.to_level_filter())
		// Transport internals are only interesting when debugging them.
		.level_for("hyper", LevelFilter::Warn)
		.level_for("h2", LevelFilter::Warn)
		.chain(std::io::stdout())
		.apply()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn logging_initialization() {
		// Only the first initialisation in a process can succeed.
		let first = super::init_logging(log::Level::Debug);
		let second = super::init_logging(log::Level::Info);
		assert!(first.is_err() || second.is_err());
	}
}
