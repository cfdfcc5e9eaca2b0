//! Per-connection state machine: one plain exchange, or one CONNECT tunnel
//! carrying a single TLS-intercepted exchange. No keep-alive; both sockets
//! are torn down when the exchange finishes, on every path.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::http1::{self, Headers, Request, Response};
use crate::proxy::{ProxyError, ProxyInputs};
use crate::proxy::upstream::Stream;
use crate::telemetry::log::RequestLog;

pub(crate) async fn handle_connection(
	inputs: Arc<ProxyInputs>,
	socket: TcpStream,
	peer: SocketAddr,
) {
	let request_id = Uuid::new_v4();
	let log = match RequestLog::create(&inputs.request_log_dir, request_id, inputs.request_log_level)
	{
		Ok(log) => log,
		Err(e) => {
			warn!(%peer, error = %e, "failed to open request log");
			return;
		},
	};

	let connection = Connection { inputs, peer, log };
	if let Err(e) = connection.run(socket).await {
		// Worker errors stay inside their connection; the listener never sees them.
		connection.log.error(e.to_string());
		debug!(%peer, %request_id, error = %e, "connection closed with error");
	}
}

struct Connection {
	inputs: Arc<ProxyInputs>,
	peer: SocketAddr,
	log: RequestLog,
}

impl Connection {
	async fn run(&self, socket: TcpStream) -> Result<(), ProxyError> {
		let mut reader = BufReader::new(socket);
		let Some(request) = http1::read_request(&mut reader).await? else {
			return Ok(());
		};
		info!(peer = %self.peer, request_id = %self.log.id(), "{}", request.title());

		if request.method.eq_ignore_ascii_case("CONNECT") {
			self.run_connect(reader, request).await
		} else {
			// Every other verb, present or future, takes the forward path.
			self.run_forward(reader, request).await
		}
	}

	/// Plain exchange: absolute-form request line, origin dialled without TLS.
	async fn run_forward(
		&self,
		mut reader: BufReader<TcpStream>,
		mut request: Request,
	) -> Result<(), ProxyError> {
		let (host, port) = match rewrite_absolute_form(&mut request) {
			Ok(target) => target,
			Err(e) => {
				self
					.send_error(reader.get_mut(), &request.version, 400, &e.to_string())
					.await?;
				return Ok(());
			},
		};

		let connected = match self.inputs.upstream.connect(&host, port, false).await {
			Ok(connected) => connected,
			Err(e) => {
				self
					.send_error(reader.get_mut(), &request.version, 500, &e.to_string())
					.await?;
				return Ok(());
			},
		};

		let mut upstream = connected.stream;
		let mut client = reader.into_inner();
		self
			.forward_and_relay(&mut client, &mut upstream, request)
			.await?;
		let _ = client.shutdown().await;
		Ok(())
	}

	/// CONNECT: dial and TLS-wrap to the origin, mint a leaf for the target
	/// host, answer 200, then terminate the client's TLS and serve the tunnel.
	async fn run_connect(
		&self,
		mut reader: BufReader<TcpStream>,
		request: Request,
	) -> Result<(), ProxyError> {
		let (host, port) = match parse_authority(&request.path) {
			Ok(target) => target,
			Err(e) => {
				self
					.send_error(reader.get_mut(), &request.version, 400, &e.to_string())
					.await?;
				return Ok(());
			},
		};

		let connected = match self.inputs.upstream.connect(&host, port, true).await {
			Ok(connected) => connected,
			Err(e) => {
				self
					.send_error(reader.get_mut(), &request.version, 500, &e.to_string())
					.await?;
				return Ok(());
			},
		};

		let acceptor = match self.accept_config(&host, &connected.san) {
			Ok(acceptor) => acceptor,
			Err(e) => {
				self
					.send_error(reader.get_mut(), &request.version, 500, &e.to_string())
					.await?;
				return Ok(());
			},
		};

		let mut socket = reader.into_inner();
		socket
			.write_all(format!("{} 200 Connection established\r\n\r\n", request.version).as_bytes())
			.await?;

		// From here no HTTP error can reach the client; handshake failures
		// just close the tunnel.
		let tls = acceptor
			.accept(socket)
			.await
			.map_err(ProxyError::ClientTls)?;
		self.serve_tunnel(tls, connected.stream, &host, port).await
	}

	fn accept_config(&self, host: &str, san: &[crate::ca::SanEntry]) -> Result<TlsAcceptor, ProxyError> {
		let leaf = self.inputs.ca.mint(host, san)?;
		let config = leaf.server_config()?;
		Ok(TlsAcceptor::from(Arc::new(config)))
	}

	/// Serve the decrypted tunnel. Exactly one inner request is handled
	/// before teardown; browsers expecting a long-lived tunnel will reconnect
	/// per request. Note the tunnelled request's Host header is not
	/// reconciled against the CONNECT authority.
	async fn serve_tunnel(
		&self,
		tls: tokio_rustls::server::TlsStream<TcpStream>,
		mut upstream: Stream,
		host: &str,
		port: u16,
	) -> Result<(), ProxyError> {
		let mut reader = BufReader::new(tls);
		let Some(request) = http1::read_request(&mut reader).await? else {
			return Ok(());
		};
		info!(
			peer = %self.peer,
			request_id = %self.log.id(),
			tunnel = %format!("https://{host}:{port}"),
			"{}",
			request.title()
		);

		let mut client = reader.into_inner();
		self
			.forward_and_relay(&mut client, &mut upstream, request)
			.await?;
		let _ = client.shutdown().await;
		Ok(())
	}

	/// Request plugins, the upstream round trip, then response plugins.
	async fn forward_and_relay<C, U>(
		&self,
		client: &mut C,
		upstream: &mut U,
		mut request: Request,
	) -> Result<(), ProxyError>
	where
		C: AsyncWrite + Unpin,
		U: AsyncRead + AsyncWrite + Unpin,
	{
		self.log.info("*** REQUEST ***");
		self
			.inputs
			.registry
			.run_request(&mut request, &self.log)
			.await;
		let request_bytes = request.to_bytes();
		self.log.info("*** END REQUEST ***\n");

		upstream.write_all(&request_bytes).await?;
		upstream.flush().await?;

		let mut upstream_reader = BufReader::new(upstream);
		let (mut response, complete) = http1::read_response(&mut upstream_reader).await?;
		if !complete {
			warn!(request_id = %self.log.id(), "upstream closed before the full body arrived");
			self.log.warn("upstream closed before the full body arrived");
			// The truncated bytes are what gets propagated; Content-Length
			// must describe them.
			response
				.headers
				.set("Content-Length", response.body.len().to_string());
		}
		// Bodies are materialised and re-framed; chunked framing must not leak.
		response.headers.remove("Transfer-Encoding");

		self.log.info("*** RESPONSE ***");
		self
			.inputs
			.registry
			.run_response(&mut response, &self.log)
			.await;
		self.log.info("*** END RESPONSE ***");

		client.write_all(&response.to_bytes()).await?;
		client.flush().await?;
		Ok(())
	}

	async fn send_error<W: AsyncWrite + Unpin>(
		&self,
		writer: &mut W,
		version: &str,
		status: u16,
		reason: &str,
	) -> Result<(), ProxyError> {
		let reason: String = reason
			.chars()
			.map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
			.collect();
		self.log.error(format!("{status} {reason}"));

		let response = Response {
			version: version.to_string(),
			status,
			reason,
			headers: Headers::from_iter([("Content-Length", "0")]),
			body: Bytes::new(),
		};
		writer.write_all(&response.to_bytes()).await?;
		writer.flush().await?;
		Ok(())
	}
}

/// Rewrite an absolute-form request line to origin-form, returning the
/// target. Only the `http` scheme is forwarded.
fn rewrite_absolute_form(request: &mut Request) -> Result<(String, u16), ProxyError> {
	let url = Url::parse(&request.path)
		.map_err(|_| ProxyError::UnsupportedScheme(String::new()))?;
	if url.scheme() != "http" {
		return Err(ProxyError::UnsupportedScheme(url.scheme().to_string()));
	}
	let host = url
		.host_str()
		.ok_or_else(|| ProxyError::BadTarget(request.path.clone()))?
		.to_string();
	let port = url.port().unwrap_or(80);

	let mut path = url.path().to_string();
	if path.is_empty() {
		path.push('/');
	}
	if let Some(query) = url.query() {
		path.push('?');
		path.push_str(query);
	}
	if let Some(fragment) = url.fragment() {
		path.push('#');
		path.push_str(fragment);
	}
	request.path = path;

	Ok((host, port))
}

/// CONNECT authority-form target: `host:port`, port a positive integer.
fn parse_authority(path: &str) -> Result<(String, u16), ProxyError> {
	let bad = || ProxyError::BadTarget(path.to_string());
	let (host, port) = path.rsplit_once(':').ok_or_else(bad)?;
	if host.is_empty() {
		return Err(bad());
	}
	let port: u16 = port.parse().map_err(|_| bad())?;
	if port == 0 {
		return Err(bad());
	}
	Ok((host.to_string(), port))
}
