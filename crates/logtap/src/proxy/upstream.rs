use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::ca::SanEntry;
use crate::proxy::ProxyError;

/// Dials origins. For CONNECT targets the connection is wrapped as a TLS
/// client verified against the configured root bundle, with the target host
/// as SNI.
pub struct Upstream {
	client_config: Arc<ClientConfig>,
}

/// An established origin connection plus the SANs its certificate presented
/// (synthesised from the host name for plain connections or SAN-less certs).
pub struct Connected {
	pub stream: Stream,
	pub san: Vec<SanEntry>,
}

pub enum Stream {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Upstream {
	/// Trust the operating system's root bundle, as a browser would.
	pub fn from_native_roots() -> Result<Self, ProxyError> {
		let loaded = rustls_native_certs::load_native_certs();
		for error in &loaded.errors {
			warn!(%error, "skipping unloadable native root certificate");
		}
		let mut roots = RootCertStore::empty();
		let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
		debug!(added, ignored, "loaded native root certificates");
		if roots.is_empty() {
			return Err(ProxyError::NoRootCertificates);
		}
		Ok(Self::with_roots(roots))
	}

	/// Trust an explicit root store. Lets tests point the proxy at stub
	/// origins with their own CA.
	pub fn with_roots(roots: RootCertStore) -> Self {
		let client_config = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		Self {
			client_config: Arc::new(client_config),
		}
	}

	pub async fn connect(&self, host: &str, port: u16, tls: bool) -> Result<Connected, ProxyError> {
		let tcp = TcpStream::connect((host, port))
			.await
			.map_err(ProxyError::UpstreamDial)?;

		if !tls {
			return Ok(Connected {
				stream: Stream::Plain(tcp),
				san: vec![SanEntry::Dns(host.to_string())],
			});
		}

		let server_name = ServerName::try_from(host.to_string())
			.map_err(|e| ProxyError::UpstreamTls(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
		let connector = TlsConnector::from(self.client_config.clone());
		let stream = connector
			.connect(server_name, tcp)
			.await
			.map_err(ProxyError::UpstreamTls)?;

		let san = stream
			.get_ref()
			.1
			.peer_certificates()
			.and_then(|certs| certs.first())
			.map(|der| peer_san(der, host))
			.unwrap_or_else(|| vec![SanEntry::Dns(host.to_string())]);

		Ok(Connected {
			stream: Stream::Tls(Box::new(stream)),
			san,
		})
	}
}

/// SANs from the origin certificate; absent or unparsable extensions fall
/// back to the dialled host name.
fn peer_san(der: &CertificateDer<'_>, host: &str) -> Vec<SanEntry> {
	let fallback = || vec![SanEntry::Dns(host.to_string())];
	let Ok((_, cert)) = x509_parser::parse_x509_certificate(der) else {
		return fallback();
	};
	let Ok(Some(ext)) = cert.subject_alternative_name() else {
		return fallback();
	};
	let entries: Vec<SanEntry> = ext
		.value
		.general_names
		.iter()
		.map(|name| match name {
			x509_parser::extensions::GeneralName::DNSName(dns) => SanEntry::Dns(dns.to_string()),
			x509_parser::extensions::GeneralName::IPAddress(bytes) => match bytes.len() {
				4 => {
					let octets: [u8; 4] = (*bytes).try_into().expect("length checked");
					SanEntry::Ip(IpAddr::from(octets))
				},
				16 => {
					let octets: [u8; 16] = (*bytes).try_into().expect("length checked");
					SanEntry::Ip(IpAddr::from(octets))
				},
				_ => SanEntry::Other(format!("{name:?}")),
			},
			other => SanEntry::Other(format!("{other:?}")),
		})
		.collect();
	if entries.is_empty() { fallback() } else { entries }
}

impl AsyncRead for Stream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match &mut *self {
			Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Stream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match &mut *self {
			Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut *self {
			Stream::Plain(s) => Pin::new(s).poll_flush(cx),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut *self {
			Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}
