use hostname;
use log::Level;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::conflict::ConflictPolicy;

/// Profile fields a fresh deployment knows about. Diffs naming anything else
/// are rejected with `UnknownField`.
pub const DEFAULT_PROFILE_FIELDS: &[&str] = &[
	"proxy_rules",
	"dns_settings",
	"routing_rules",
	"split_tunnel_apps",
	"subscriptions",
	"server_profiles",
	"vpn_engine",
];

/// Longest credential lifetime accepted: one year.
pub const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 3600;

/// Runtime configuration for Bifrost.
///
/// Values are loaded from (in order): a config file - in the `/etc/vanopticon/bifrost.json` file,
/// and in the user config folder (optional), and environment variables
/// prefixed with `BFR_` (e.g. `BFR_PORT`).
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Settings {
	pub host: String,
	pub port: u16,
	pub log_level: Level,
	/// Advertised to devices in the authentication response.
	pub sync_endpoint: Url,
	pub token_issuer: String,
	pub access_token_ttl_secs: u64,
	pub refresh_token_ttl_secs: u64,
	/// Base64 signing secret. Generated at boot when unset.
	pub token_secret: Option<String>,
	pub manifest_retention: usize,
	pub storage_limit_bytes: u64,
	pub download_page_size: usize,
	pub profile_fields: Vec<String>,
	pub conflict_policy: ConflictPolicy,
	// Rate limiting: requests-per-second and burst size (tokens)
	pub rate_limit_rps: u32,
	pub rate_limit_burst: u32,
	pub max_body_bytes: usize,
}

impl Default for Settings {
	fn default() -> Self {
		let host = hostname::get()
			.ok()
			.and_then(|s| s.into_string().ok())
			.unwrap_or_else(|| "127.0.0.1".to_string());

		Self {
			host,
			port: 8443,
			log_level: Level::Info,
			sync_endpoint: Url::parse("https://sync.vanopticon.net/v1").unwrap(),
			token_issuer: "bifrost-sync".to_string(),
			access_token_ttl_secs: 3600,
			refresh_token_ttl_secs: 24 * 3600,
			token_secret: None,
			manifest_retention: 100,
			storage_limit_bytes: 10 * 1024 * 1024,
			download_page_size: 100,
			profile_fields: DEFAULT_PROFILE_FIELDS.iter().map(|f| f.to_string()).collect(),
			conflict_policy: ConflictPolicy::default(),
			// sensible defaults for dev: 10 RPS refill, burst up to 100
			rate_limit_rps: 10,
			rate_limit_burst: 100,
			max_body_bytes: 1024 * 1024,
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
	#[error("invalid setting {name}: {reason}")]
	Invalid { name: &'static str, reason: String },
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/bifrost.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("bifrost.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(
		config::Environment::with_prefix("BFR")
			.separator("__")
			.try_parsing(true)
			.list_separator(",")
			.with_list_parse_key("profile_fields"),
	);

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Direct environment variables always win over the layered sources.
	if let Ok(h) = std::env::var("BFR_HOST") {
		if !h.is_empty() {
			s.host = h;
		}
	}
	if let Ok(p) = std::env::var("BFR_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.port = pn;
		}
	}
	if let Ok(l) = std::env::var("BFR_LOG_LEVEL") {
		if !l.is_empty() {
			if let Ok(parsed) = l.parse::<Level>() {
				s.log_level = parsed;
			}
		}
	}
	if let Ok(e) = std::env::var("BFR_SYNC_ENDPOINT") {
		if !e.is_empty() {
			s.sync_endpoint = Url::parse(&e).map_err(|err| SettingsError::Invalid {
				name: "sync_endpoint",
				reason: err.to_string(),
			})?;
		}
	}
	if let Ok(secret) = std::env::var("BFR_TOKEN_SECRET") {
		if !secret.is_empty() {
			s.token_secret = Some(secret);
		}
	}
	if let Ok(fields) = std::env::var("BFR_PROFILE_FIELDS") {
		if !fields.is_empty() {
			s.profile_fields = fields
				.split(',')
				.map(str::trim)
				.filter(|f| !f.is_empty())
				.map(str::to_string)
				.collect();
		}
	}
	if let Ok(p) = std::env::var("BFR_CONFLICT_POLICY") {
		if !p.is_empty() {
			s.conflict_policy = p.parse().map_err(|reason| SettingsError::Invalid {
				name: "conflict_policy",
				reason,
			})?;
		}
	}
	if let Ok(r) = std::env::var("BFR_RATE_LIMIT_RPS") {
		if let Ok(parsed) = r.parse::<u32>() {
			s.rate_limit_rps = parsed;
		}
	}
	if let Ok(b) = std::env::var("BFR_RATE_LIMIT_BURST") {
		if let Ok(parsed) = b.parse::<u32>() {
			s.rate_limit_burst = parsed;
		}
	}

	s.validate()?;
	Ok(s)
}

impl Settings {
	/// Reject combinations the service cannot run with.
	pub fn validate(&self) -> Result<(), SettingsError> {
		if self.manifest_retention == 0 {
			return Err(SettingsError::Invalid {
				name: "manifest_retention",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.download_page_size == 0 {
			return Err(SettingsError::Invalid {
				name: "download_page_size",
				reason: "must be at least 1".to_string(),
			});
		}
		if self.access_token_ttl_secs == 0 || self.refresh_token_ttl_secs < self.access_token_ttl_secs {
			return Err(SettingsError::Invalid {
				name: "refresh_token_ttl_secs",
				reason: "token lifetimes must be non-zero and refresh must outlive access".to_string(),
			});
		}
		if self.refresh_token_ttl_secs > MAX_TOKEN_TTL_SECS {
			return Err(SettingsError::Invalid {
				name: "refresh_token_ttl_secs",
				reason: format!("must not exceed {} seconds", MAX_TOKEN_TTL_SECS),
			});
		}
		if self.profile_fields.is_empty() {
			return Err(SettingsError::Invalid {
				name: "profile_fields",
				reason: "at least one profile field is required".to_string(),
			});
		}
		Ok(())
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::env;

	use log::Level;

	use crate::config::{MAX_TOKEN_TTL_SECS, Settings, load};
	use crate::conflict::ConflictPolicy;

	#[test]
	fn test_load_defaults_and_env_overlay() {
		let keys = [
			"BFR_HOST",
			"BFR_PORT",
			"BFR_LOG_LEVEL",
			"BFR_PROFILE_FIELDS",
			"BFR_CONFLICT_POLICY",
		];
		let originals: Vec<_> = keys.iter().map(|k| (*k, env::var_os(k))).collect();

		for k in keys {
			unsafe { env::remove_var(k) };
		}

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.host, d.host);
		assert_eq!(s.port, d.port);
		assert_eq!(s.log_level, d.log_level);
		assert_eq!(s.manifest_retention, 100);
		assert_eq!(s.conflict_policy, ConflictPolicy::LastWriterWins);

		unsafe { env::set_var("BFR_HOST", "0.0.0.0") };
		unsafe { env::set_var("BFR_PORT", "9090") };
		unsafe { env::set_var("BFR_LOG_LEVEL", "debug") };
		unsafe { env::set_var("BFR_PROFILE_FIELDS", "dns, proxy_rules") };
		unsafe { env::set_var("BFR_CONFLICT_POLICY", "applied_wins") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.host, "0.0.0.0");
		assert_eq!(s2.port, 9090u16);
		assert_eq!(s2.log_level, Level::Debug);
		assert_eq!(s2.profile_fields, vec!["dns".to_string(), "proxy_rules".to_string()]);
		assert_eq!(s2.conflict_policy, ConflictPolicy::AppliedWins);

		for (k, v) in originals {
			match v {
				Some(v) => unsafe { env::set_var(k, v) },
				None => unsafe { env::remove_var(k) },
			}
		}
	}

	#[test]
	fn test_validate_bounds_token_lifetimes() {
		let huge = Settings {
			access_token_ttl_secs: 10_000_000_000_000_000,
			refresh_token_ttl_secs: 10_000_000_000_000_000,
			..Settings::default()
		};
		assert!(huge.validate().is_err());

		let longest = Settings {
			access_token_ttl_secs: MAX_TOKEN_TTL_SECS,
			refresh_token_ttl_secs: MAX_TOKEN_TTL_SECS,
			..Settings::default()
		};
		assert!(longest.validate().is_ok());
	}

	#[test]
	fn test_validate_rejects_zero_retention() {
		let s = Settings {
			manifest_retention: 0,
			..Settings::default()
		};
		assert!(s.validate().is_err());
	}
}
