//! HTTP relay client

use super::{
    ClientFactory, ErrorResponse, ProofSubmission, RelayClient, Result, Ticket, TicketRequest,
    TransportError, DEFAULT_PORT,
};
use crate::address::AddressHash;
use crate::message::Header;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Turn a directory server entry into a base URL
///
/// Bare hosts get `https://` and port 2424; explicit schemes and ports are kept.
pub fn normalize_server(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    let (scheme, rest) = server.split_once("://").unwrap_or(("https", server));
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, format!("/{}", path)),
        None => (rest, String::new()),
    };

    // Bracketed IPv6 literals carry their own colons
    let has_port = match host.strip_prefix('[') {
        Some(literal) => literal.contains("]:"),
        None => host.contains(':'),
    };
    if has_port {
        format!("{}://{}{}", scheme, host, path)
    } else {
        format!("{}://{}:{}{}", scheme, host, DEFAULT_PORT, path)
    }
}

/// Relay client over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRelayClient {
    /// Create a client for `server` with its own connection pool
    pub fn new(server: &str, timeout: Duration, allow_insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_insecure)
            .build()?;
        Self::with_client(server, client)
    }

    /// Create a client sharing an existing connection pool
    pub fn with_client(server: &str, client: reqwest::Client) -> Result<Self> {
        if server.trim().is_empty() {
            return Err(TransportError::InvalidServer(server.to_string()));
        }
        Ok(Self {
            base_url: normalize_server(server),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-2xx response into an error carrying the server's message
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error: ErrorResponse = response.json().await.unwrap_or(ErrorResponse {
            error: "Unknown error".to_string(),
        });
        Err(TransportError::Status {
            status: status.as_u16(),
            message: error.error,
        })
    }

    async fn post_bytes(&self, path: &str, body: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/octet-stream")
            .body(body.to_vec())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn request_ticket(&self, from: &AddressHash, to: &AddressHash) -> Result<Ticket> {
        let request = TicketRequest {
            from: from.clone(),
            to: to.clone(),
        };
        let response = self
            .client
            .post(self.url("/ticket"))
            .json(&request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn submit_proof(&self, ticket_id: &Uuid, proof: u64) -> Result<Ticket> {
        let response = self
            .client
            .post(self.url(&format!("/ticket/{}/proof", ticket_id)))
            .json(&ProofSubmission { proof })
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn upload_header(&self, ticket: &Ticket, header: &Header) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/incoming/{}/header", ticket.id)))
            .json(header)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upload_catalog(&self, ticket: &Ticket, catalog: &[u8]) -> Result<()> {
        self.post_bytes(&format!("/incoming/{}/catalog", ticket.id), catalog)
            .await
    }

    async fn upload_block(&self, ticket: &Ticket, part_id: &Uuid, data: &[u8]) -> Result<()> {
        self.post_bytes(&format!("/incoming/{}/block/{}", ticket.id, part_id), data)
            .await
    }

    async fn complete_upload(&self, ticket: &Ticket) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/incoming/{}/complete", ticket.id)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_upload(&self, ticket: &Ticket) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/incoming/{}", ticket.id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

/// Hands out [`HttpRelayClient`]s that share one connection pool
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    client: reqwest::Client,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration, allow_insecure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(allow_insecure)
            .build()?;
        Ok(Self { client })
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, server: &str) -> Result<Arc<dyn RelayClient>> {
        let client: Arc<dyn RelayClient> =
            Arc::new(HttpRelayClient::with_client(server, self.client.clone())?);
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{delete, post};
    use axum::{Json, Router};

    #[test]
    fn test_normalize_server() {
        assert_eq!(
            normalize_server("relay.example.org"),
            "https://relay.example.org:2424"
        );
        assert_eq!(
            normalize_server("https://relay.example.org/"),
            "https://relay.example.org:2424"
        );
        assert_eq!(
            normalize_server("http://127.0.0.1:8080"),
            "http://127.0.0.1:8080"
        );
        assert_eq!(
            normalize_server("relay.example.org:9000/api"),
            "https://relay.example.org:9000/api"
        );
    }

    #[test]
    fn test_normalize_ipv6_server() {
        assert_eq!(normalize_server("[::1]"), "https://[::1]:2424");
        assert_eq!(normalize_server("http://[::1]/"), "http://[::1]:2424");
        assert_eq!(normalize_server("[::1]:8080"), "https://[::1]:8080");
        assert_eq!(
            normalize_server("http://[fe80::2]:9000/api"),
            "http://[fe80::2]:9000/api"
        );
    }

    #[test]
    fn test_empty_server_rejected() {
        assert!(matches!(
            HttpRelayClient::new(" ", Duration::from_secs(1), false),
            Err(TransportError::InvalidServer(_))
        ));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn dummy_ticket() -> Ticket {
        Ticket {
            id: Uuid::new_v4(),
            from: AddressHash::from_address("john@example!"),
            to: AddressHash::from_address("jane@example!"),
            valid: true,
            expires_at: chrono::Utc::now(),
            message_id: crate::message::MessageId::new(),
            pow: None,
        }
    }

    #[tokio::test]
    async fn test_delete_treats_404_as_success() {
        let router = Router::new().route("/incoming/{id}", delete(|| async { AxumStatus::NOT_FOUND }));
        let base = serve(router).await;

        let client = HttpRelayClient::new(&base, Duration::from_secs(5), false).unwrap();
        client.delete_upload(&dummy_ticket()).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_body_is_reported() {
        let router = Router::new().route(
            "/incoming/{id}/complete",
            post(|| async {
                (
                    AxumStatus::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: "catalog checksum mismatch".into(),
                    }),
                )
            }),
        );
        let base = serve(router).await;

        let client = HttpRelayClient::new(&base, Duration::from_secs(5), false).unwrap();
        let err = client.complete_upload(&dummy_ticket()).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(err.to_string().contains("catalog checksum mismatch"));
    }

    #[tokio::test]
    async fn test_factory_connects() {
        let factory = HttpClientFactory::new(Duration::from_secs(5), false).unwrap();
        assert!(factory.connect("relay.example.org").is_ok());
        assert!(factory.connect("").is_err());
    }
}
