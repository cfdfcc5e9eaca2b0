//! Certificate authority backing the TLS interception path.
//!
//! One persistent root pair lives in the cache directory; leaf certificates
//! are minted per destination hostname on first use and reused from disk
//! forever after.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::RngExt;
use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
	KeyIdMethod, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::{ConfigError, SslConfig};

/// Leaf validity, one year from issuance.
const LEAF_VALIDITY_SECONDS: i64 = 31_536_000;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("failed to create cache dir {path}: {source}")]
	CacheDir {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to read {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to write {path}: {source}")]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("certificate generation: {0}")]
	Generate(#[from] rcgen::Error),
	#[error("unsupported key algorithm/digest: {0}")]
	UnsupportedAlgorithm(String),
	#[error("leaf certificate: {0}")]
	Leaf(String),
}

/// Subject alternative name as carried on an origin certificate. Only DNS
/// entries participate in leaf minting; the rest are kept for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanEntry {
	Dns(String),
	Ip(IpAddr),
	Other(String),
}

/// Paths to a minted leaf pair, both PEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPaths {
	pub cert: PathBuf,
	pub key: PathBuf,
}

pub struct CertificateAuthority {
	cache_dir: PathBuf,
	root_key_path: PathBuf,
	root_cert_path: PathBuf,
	root_cert_pem: String,
	issuer: Issuer<'static, KeyPair>,
	leaf_alg: &'static rcgen::SignatureAlgorithm,
	// At most one writer creates a leaf pair; disk is the source of truth.
	mint_lock: Mutex<()>,
}

impl std::fmt::Debug for CertificateAuthority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertificateAuthority")
			.field("cache_dir", &self.cache_dir)
			.finish_non_exhaustive()
	}
}

impl CertificateAuthority {
	/// Load the root pair from the cache directory, generating it on first
	/// start. Loading an already-populated directory yields byte-identical
	/// root material.
	pub fn new(cache_dir: impl Into<PathBuf>, ssl: &SslConfig) -> Result<Self, CaError> {
		let cache_dir = cache_dir.into();
		std::fs::create_dir_all(&cache_dir).map_err(|source| CaError::CacheDir {
			path: cache_dir.clone(),
			source,
		})?;

		let files = ssl.files()?;
		let root_key_path = cache_dir.join(&files.private_key_name);
		let root_cert_path = cache_dir.join(&files.certificate_name);
		let leaf_alg = signature_algorithm(ssl)?;

		let (root_cert_pem, issuer) = if root_key_path.exists() {
			debug!(path = %root_key_path.display(), "loading existing root CA");
			let key_pem = read_file(&root_key_path)?;
			let cert_pem = read_file(&root_cert_path)?;
			let key = KeyPair::from_pem(&key_pem)?;
			let issuer = Issuer::from_ca_cert_pem(&cert_pem, key)?;
			(cert_pem, issuer)
		} else {
			info!(path = %root_cert_path.display(), "generating root CA");
			generate_root(ssl, leaf_alg, &root_key_path, &root_cert_path)?
		};

		Ok(Self {
			cache_dir,
			root_key_path,
			root_cert_path,
			root_cert_pem,
			issuer,
			leaf_alg,
			mint_lock: Mutex::new(()),
		})
	}

	pub fn root_cert_path(&self) -> &Path {
		&self.root_cert_path
	}

	pub fn root_key_path(&self) -> &Path {
		&self.root_key_path
	}

	pub fn root_cert_pem(&self) -> &str {
		&self.root_cert_pem
	}

	/// Mint (or fetch from cache) the leaf pair for `cn`, carrying the DNS
	/// entries of `san` in input order. Idempotent: the first call creates
	/// the files, later calls return the same paths untouched.
	pub fn mint(&self, cn: &str, san: &[SanEntry]) -> Result<LeafPaths, CaError> {
		let paths = LeafPaths {
			key: self.cache_dir.join(format!(".pylogp_{cn}.pem")),
			cert: self.cache_dir.join(format!(".pycrt_{cn}.pem")),
		};

		let _guard = self.mint_lock.lock().expect("mint lock poisoned");
		if paths.key.exists() {
			return Ok(paths);
		}

		debug!(cn, "minting leaf certificate");
		match self.mint_locked(cn, san, &paths) {
			Ok(()) => Ok(paths),
			Err(e) => {
				// Never leave a half-written pair behind; the caller retries.
				let _ = std::fs::remove_file(&paths.cert);
				let _ = std::fs::remove_file(&paths.key);
				Err(e)
			},
		}
	}

	fn mint_locked(&self, cn: &str, san: &[SanEntry], paths: &LeafPaths) -> Result<(), CaError> {
		let mut params = CertificateParams::default();
		params.distinguished_name = DistinguishedName::new();
		params.distinguished_name.push(DnType::CommonName, cn);
		for entry in san {
			if let SanEntry::Dns(name) = entry {
				params
					.subject_alt_names
					.push(SanType::DnsName(name.clone().try_into()?));
			}
		}
		params.serial_number = Some(random_serial());
		params.not_before = OffsetDateTime::now_utc();
		params.not_after = params.not_before + time::Duration::seconds(LEAF_VALIDITY_SECONDS);
		params.key_identifier_method = KeyIdMethod::Sha256;

		let leaf_key = KeyPair::generate_for(self.leaf_alg)?;
		let cert = params.signed_by(&leaf_key, &self.issuer)?;

		write_pem(&paths.cert, &cert.pem())?;
		write_pem(&paths.key, &leaf_key.serialize_pem())?;
		Ok(())
	}
}

impl LeafPaths {
	/// Build a rustls server config presenting this leaf.
	pub fn server_config(&self) -> Result<rustls::ServerConfig, CaError> {
		let cert_pem = read_file(&self.cert)?;
		let key_pem = read_file(&self.key)?;

		let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| CaError::Leaf(format!("bad leaf cert pem: {e}")))?;
		if certs.is_empty() {
			return Err(CaError::Leaf("no certificate in leaf pem".to_string()));
		}
		let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
			.map_err(|e| CaError::Leaf(format!("bad leaf key pem: {e}")))?
			.ok_or_else(|| CaError::Leaf("no private key in leaf pem".to_string()))?;

		rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(certs, key)
			.map_err(|e| CaError::Leaf(e.to_string()))
	}
}

/// Generate the self-signed root and persist both PEM files.
fn generate_root(
	ssl: &SslConfig,
	alg: &'static rcgen::SignatureAlgorithm,
	key_path: &Path,
	cert_path: &Path,
) -> Result<(String, Issuer<'static, KeyPair>), CaError> {
	let subject = ssl.certificate()?;

	let mut params = CertificateParams::default();
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CountryName, subject.country.as_str());
	dn.push(DnType::StateOrProvinceName, subject.state.as_str());
	dn.push(DnType::LocalityName, subject.locality.as_str());
	dn.push(DnType::OrganizationName, subject.organization.as_str());
	dn.push(
		DnType::OrganizationalUnitName,
		subject.organizational_unit.as_str(),
	);
	dn.push(DnType::CommonName, subject.common_name.as_str());
	dn.push(
		DnType::CustomDnType(vec![1, 2, 840, 113549, 1, 9, 1]),
		DnValue::Ia5String(subject.email.clone().try_into()?),
	);
	params.distinguished_name = dn;

	params.serial_number = Some(SerialNumber::from_slice(&[1]));
	params.not_before = OffsetDateTime::now_utc();
	params.not_after =
		params.not_before + time::Duration::seconds(subject.validity.validity_seconds as i64);
	params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	params.key_identifier_method = KeyIdMethod::Sha256;

	let key = KeyPair::generate_for(alg)?;
	let cert = params.self_signed(&key)?;
	let cert_pem = cert.pem();

	write_pem(key_path, &key.serialize_pem())?;
	write_pem(cert_path, &cert_pem)?;

	let issuer = Issuer::new(params, key);
	Ok((cert_pem, issuer))
}

/// Map the configured key/digest selection onto a generatable suite.
/// The catalogue is what rcgen can generate locally; anything else is a
/// startup error rather than a silent substitution.
fn signature_algorithm(ssl: &SslConfig) -> Result<&'static rcgen::SignatureAlgorithm, CaError> {
	// key_algorithm/key_size must be present; the generatable catalogue is
	// keyed by the digest.
	ssl.private_key()?;
	let digest = ssl.digest()?;
	match digest.digest.to_ascii_lowercase().as_str() {
		"sha256" => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
		"sha384" => Ok(&rcgen::PKCS_ECDSA_P384_SHA384),
		other => Err(CaError::UnsupportedAlgorithm(other.to_string())),
	}
}

/// Uniformly random 10-digit decimal serial, [10^9, 10^10).
fn random_serial() -> SerialNumber {
	let serial: u64 = rand::rng().random_range(1_000_000_000..10_000_000_000);
	let bytes = serial.to_be_bytes();
	let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
	SerialNumber::from_slice(&bytes[first..])
}

fn read_file(path: &Path) -> Result<String, CaError> {
	std::fs::read_to_string(path).map_err(|source| CaError::Read {
		path: path.to_path_buf(),
		source,
	})
}

/// Write to a temp file in the same directory and rename into place, so a
/// concurrent reader never observes a half-written PEM.
fn write_pem(path: &Path, pem: &str) -> Result<(), CaError> {
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, pem)
		.and_then(|_| std::fs::rename(&tmp, path))
		.map_err(|source| CaError::Write {
			path: path.to_path_buf(),
			source,
		})
}
