//! Listener and per-connection workers.

pub mod handler;
pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::ca::{CaError, CertificateAuthority};
use crate::config::{Config, ConfigError, parse_level};
use crate::http1::Http1Error;
use crate::intercept::InterceptorRegistry;
use crate::proxy::upstream::Upstream;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("certificate authority: {0}")]
	Ca(#[from] CaError),
	#[error("failed to bind {addr}: {source}")]
	Bind {
		addr: String,
		#[source]
		source: std::io::Error,
	},
	#[error("no usable root certificates in the native trust store")]
	NoRootCertificates,
	#[error("upstream dial failed: {0}")]
	UpstreamDial(std::io::Error),
	#[error("upstream tls handshake failed: {0}")]
	UpstreamTls(std::io::Error),
	#[error("client tls handshake failed: {0}")]
	ClientTls(std::io::Error),
	#[error("Unsupported scheme {0:?}")]
	UnsupportedScheme(String),
	#[error("invalid target {0:?}")]
	BadTarget(String),
	#[error(transparent)]
	Http(#[from] Http1Error),
	#[error("i/o: {0}")]
	Io(#[from] std::io::Error),
}

/// Everything a worker needs, shared read-only across connections.
pub(crate) struct ProxyInputs {
	pub ca: CertificateAuthority,
	pub upstream: Upstream,
	pub registry: InterceptorRegistry,
	pub request_log_dir: PathBuf,
	pub request_log_level: tracing::Level,
}

/// The accept loop. One fresh task per accepted connection; a worker failure
/// never reaches the listener.
pub struct Proxy {
	listener: TcpListener,
	inputs: Arc<ProxyInputs>,
}

impl Proxy {
	pub async fn new(config: &Config, registry: InterceptorRegistry) -> Result<Self, ProxyError> {
		let upstream = Upstream::from_native_roots()?;
		Self::with_upstream(config, registry, upstream).await
	}

	/// Construct with an explicit upstream connector (tests inject a trust
	/// store for their stub origins here).
	pub async fn with_upstream(
		config: &Config,
		registry: InterceptorRegistry,
		upstream: Upstream,
	) -> Result<Self, ProxyError> {
		let app = config.app.app()?;
		let request_log = config.app.request_log()?;
		let request_log_level = parse_level(&request_log.level)?;
		let ca = CertificateAuthority::new(config.app.cache_dir()?, &config.ssl)?;

		let addr = format!("{}:{}", app.host, app.port);
		let listener = TcpListener::bind((app.host.as_str(), app.port))
			.await
			.map_err(|source| ProxyError::Bind { addr, source })?;

		Ok(Self {
			listener,
			inputs: Arc::new(ProxyInputs {
				ca,
				upstream,
				registry,
				request_log_dir: request_log.dir.clone(),
				request_log_level,
			}),
		})
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	pub fn ca(&self) -> &CertificateAuthority {
		&self.inputs.ca
	}

	/// Accept until `shutdown` resolves. In-flight workers finish their
	/// single exchange or are dropped at process exit.
	pub async fn serve(self, shutdown: impl Future<Output = ()>) {
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				_ = &mut shutdown => {
					info!("listener shutting down");
					return;
				},
				accepted = self.listener.accept() => {
					match accepted {
						Ok((socket, peer)) => {
							tokio::spawn(handler::handle_connection(self.inputs.clone(), socket, peer));
						},
						Err(e) => {
							warn!(error = %e, "accept failed");
						},
					}
				},
			}
		}
	}

	pub async fn serve_forever(self) {
		self.serve(std::future::pending()).await
	}
}
