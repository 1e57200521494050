mod common;

#[cfg(feature = "integration-tests")]
mod server_tests {
	use super::common;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use std::net::SocketAddr;
	use tokio::net::{TcpListener, TcpStream};
	use vanopticon_bifrost::build_app;
	use vanopticon_bifrost::conflict::ConflictPolicy;

	/// Serve the real router on a loopback socket and talk plain HTTP/1.1 to it.
	#[tokio::test]
	async fn test_health_over_loopback_socket() -> Result<(), Box<dyn std::error::Error>> {
		let settings = common::settings(&["dns_settings"], ConflictPolicy::AppliedWins);
		let (app, _service) = build_app(&settings, common::metrics())?;

		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let server = tokio::spawn(async move { axum::serve(listener, app).await });

		let mut stream = TcpStream::connect(addr).await?;
		stream
			.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
			.await?;
		let mut raw = String::new();
		stream.read_to_string(&mut raw).await?;

		assert!(raw.starts_with("HTTP/1.1 200"), "unexpected response: {}", raw);
		assert!(raw.contains("\"status\":\"healthy\""));
		assert!(raw.contains("\"service\":\"bifrost\""));

		server.abort();
		Ok(())
	}

	async fn get_status(addr: SocketAddr) -> Result<String, Box<dyn std::error::Error>> {
		let mut stream = TcpStream::connect(addr).await?;
		stream
			.write_all(b"GET /v1/status HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer forged\r\nConnection: close\r\n\r\n")
			.await?;
		let mut raw = String::new();
		stream.read_to_string(&mut raw).await?;
		Ok(raw)
	}

	/// Unauthenticated callers are limited by peer address.
	#[tokio::test]
	async fn test_rate_limit_by_peer_over_loopback() -> Result<(), Box<dyn std::error::Error>> {
		let mut settings = common::settings(&["dns_settings"], ConflictPolicy::AppliedWins);
		settings.rate_limit_burst = 1;
		settings.rate_limit_rps = 0;
		let (app, _service) = build_app(&settings, common::metrics())?;

		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let server = tokio::spawn(async move {
			axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
		});

		let first = get_status(addr).await?;
		assert!(first.starts_with("HTTP/1.1 401"), "unexpected response: {}", first);
		let second = get_status(addr).await?;
		assert!(second.starts_with("HTTP/1.1 429"), "unexpected response: {}", second);

		server.abort();
		Ok(())
	}
}
