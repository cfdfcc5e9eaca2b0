use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::Level;

pub const DEFAULT_SSL_CONFIG: &str = "config/ssl_config.toml";
pub const DEFAULT_APP_CONFIG: &str = "config/app_config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: Box<toml::de::Error>,
	},
	#[error("missing config section [{0}]")]
	MissingSection(&'static str),
	#[error("invalid log level {0:?}")]
	InvalidLevel(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslCertificate {
	pub country: String,
	pub state: String,
	pub locality: String,
	pub organization: String,
	pub organizational_unit: String,
	pub common_name: String,
	pub email: String,
	pub validity: Validity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Validity {
	pub validity_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslPrivateKey {
	pub key_algorithm: u32,
	pub key_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslDigest {
	pub digest: String,
}

/// File names for the root pair inside the cache directory.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateFiles {
	pub private_key_name: String,
	pub certificate_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSslConfig {
	ssl_certificate: Option<SslCertificate>,
	ssl_private_key: Option<SslPrivateKey>,
	ssl_digest: Option<SslDigest>,
	certificate: Option<CertificateFiles>,
}

/// Typed view over `ssl_config.toml`.
///
/// A missing section is diagnosed once on stderr at load time; startup
/// continues and the first dereference of the section fails loudly.
#[derive(Debug, Clone)]
pub struct SslConfig {
	certificate: Option<SslCertificate>,
	private_key: Option<SslPrivateKey>,
	digest: Option<SslDigest>,
	files: Option<CertificateFiles>,
}

impl SslConfig {
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let raw: RawSslConfig = read_toml(path.as_ref())?;
		for (section, missing) in [
			("ssl_certificate", raw.ssl_certificate.is_none()),
			("ssl_private_key", raw.ssl_private_key.is_none()),
			("ssl_digest", raw.ssl_digest.is_none()),
			("certificate", raw.certificate.is_none()),
		] {
			if missing {
				eprintln!("SSL config is missing section [{section}]");
			}
		}
		Ok(Self {
			certificate: raw.ssl_certificate,
			private_key: raw.ssl_private_key,
			digest: raw.ssl_digest,
			files: raw.certificate,
		})
	}

	pub fn certificate(&self) -> Result<&SslCertificate, ConfigError> {
		self
			.certificate
			.as_ref()
			.ok_or(ConfigError::MissingSection("ssl_certificate"))
	}

	pub fn private_key(&self) -> Result<&SslPrivateKey, ConfigError> {
		self
			.private_key
			.as_ref()
			.ok_or(ConfigError::MissingSection("ssl_private_key"))
	}

	pub fn digest(&self) -> Result<&SslDigest, ConfigError> {
		self
			.digest
			.as_ref()
			.ok_or(ConfigError::MissingSection("ssl_digest"))
	}

	pub fn files(&self) -> Result<&CertificateFiles, ConfigError> {
		self
			.files
			.as_ref()
			.ok_or(ConfigError::MissingSection("certificate"))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
	pub host: String,
	pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppLog {
	pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestLogSection {
	pub dir: PathBuf,
	pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LogSection {
	app: Option<AppLog>,
	request: Option<RequestLogSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
	#[serde(default)]
	pub dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawAppConfig {
	app: Option<AppSection>,
	log: Option<LogSection>,
	cache: Option<CacheSection>,
}

/// Typed view over `app_config.toml`.
#[derive(Debug, Clone)]
pub struct AppConfig {
	app: Option<AppSection>,
	app_log: Option<AppLog>,
	request_log: Option<RequestLogSection>,
	cache: Option<CacheSection>,
}

impl AppConfig {
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let raw: RawAppConfig = read_toml(path.as_ref())?;
		let log = raw.log.unwrap_or_default();
		for (section, missing) in [
			("app", raw.app.is_none()),
			("log.app", log.app.is_none()),
			("log.request", log.request.is_none()),
			("cache", raw.cache.is_none()),
		] {
			if missing {
				eprintln!("Application config is missing section [{section}]");
			}
		}
		Ok(Self {
			app: raw.app,
			app_log: log.app,
			request_log: log.request,
			cache: raw.cache,
		})
	}

	pub fn app(&self) -> Result<&AppSection, ConfigError> {
		self.app.as_ref().ok_or(ConfigError::MissingSection("app"))
	}

	pub fn app_log(&self) -> Result<&AppLog, ConfigError> {
		self
			.app_log
			.as_ref()
			.ok_or(ConfigError::MissingSection("log.app"))
	}

	pub fn request_log(&self) -> Result<&RequestLogSection, ConfigError> {
		self
			.request_log
			.as_ref()
			.ok_or(ConfigError::MissingSection("log.request"))
	}

	/// Cache directory for CA material. An empty `cache.dir` falls back to
	/// `<system temp>/pylogproxy`.
	pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
		let cache = self
			.cache
			.as_ref()
			.ok_or(ConfigError::MissingSection("cache"))?;
		if cache.dir.is_empty() {
			Ok(std::env::temp_dir().join("pylogproxy"))
		} else {
			Ok(PathBuf::from(&cache.dir))
		}
	}
}

/// Everything the proxy consumes at startup, passed by reference; no
/// process-wide mutable state.
#[derive(Debug, Clone)]
pub struct Config {
	pub ssl: SslConfig,
	pub app: AppConfig,
}

impl Config {
	pub fn load() -> Result<Self, ConfigError> {
		Self::load_from(DEFAULT_SSL_CONFIG, DEFAULT_APP_CONFIG)
	}

	pub fn load_from(
		ssl_path: impl AsRef<Path>,
		app_path: impl AsRef<Path>,
	) -> Result<Self, ConfigError> {
		Ok(Self {
			ssl: SslConfig::load(ssl_path)?,
			app: AppConfig::load(app_path)?,
		})
	}
}

pub fn parse_level(level: &str) -> Result<Level, ConfigError> {
	Level::from_str(level).map_err(|_| ConfigError::InvalidLevel(level.to_string()))
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
		path: path.to_path_buf(),
		source,
	})?;
	toml::from_str(&content).map_err(|source| ConfigError::Parse {
		path: path.to_path_buf(),
		source: Box::new(source),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn write_config(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
		let path = dir.path().join(name);
		let mut f = std::fs::File::create(&path).unwrap();
		f.write_all(content.as_bytes()).unwrap();
		path
	}

	#[test]
	fn full_ssl_config_parses() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_config(
			&dir,
			"ssl_config.toml",
			r#"
[ssl_certificate]
country = "US"
state = "CA"
locality = "SF"
organization = "logtap"
organizational_unit = "dev"
common_name = "logtap root"
email = "dev@example.com"

[ssl_certificate.validity]
validity_seconds = 31536000

[ssl_private_key]
key_algorithm = 408
key_size = 256

[ssl_digest]
digest = "sha256"

[certificate]
private_key_name = "root.key.pem"
certificate_name = "root.crt.pem"
"#,
		);
		let cfg = SslConfig::load(&path).unwrap();
		assert_eq!(cfg.certificate().unwrap().common_name, "logtap root");
		assert_eq!(
			cfg.certificate().unwrap().validity.validity_seconds,
			31536000
		);
		assert_eq!(cfg.digest().unwrap().digest, "sha256");
		assert_eq!(cfg.files().unwrap().private_key_name, "root.key.pem");
	}

	#[test]
	fn missing_section_fails_on_first_use() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_config(
			&dir,
			"ssl_config.toml",
			r#"
[ssl_digest]
digest = "sha256"
"#,
		);
		let cfg = SslConfig::load(&path).unwrap();
		assert!(cfg.digest().is_ok());
		assert!(matches!(
			cfg.certificate(),
			Err(ConfigError::MissingSection("ssl_certificate"))
		));
	}

	#[test]
	fn cache_dir_falls_back_to_temp() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_config(
			&dir,
			"app_config.toml",
			r#"
[app]
host = "127.0.0.1"
port = 8080

[log.app]
level = "info"

[log.request]
dir = "logs"
level = "debug"

[cache]
dir = ""
"#,
		);
		let cfg = AppConfig::load(&path).unwrap();
		assert_eq!(
			cfg.cache_dir().unwrap(),
			std::env::temp_dir().join("pylogproxy")
		);
		assert_eq!(cfg.app().unwrap().port, 8080);
		assert_eq!(cfg.request_log().unwrap().level, "debug");
	}

	#[test]
	fn explicit_cache_dir_wins() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_config(
			&dir,
			"app_config.toml",
			r#"
[app]
host = "127.0.0.1"
port = 8080

[cache]
dir = "/var/cache/logtap"
"#,
		);
		let cfg = AppConfig::load(&path).unwrap();
		assert_eq!(cfg.cache_dir().unwrap(), PathBuf::from("/var/cache/logtap"));
		assert!(cfg.app_log().is_err());
	}

	#[test]
	fn level_parsing() {
		assert_eq!(parse_level("info").unwrap(), Level::INFO);
		assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
		assert!(parse_level("verbose").is_err());
	}
}
