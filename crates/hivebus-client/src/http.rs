//! HTTP delivery connector.
//!
//! An `http` endpoint receives each envelope as a `POST` with a JSON body.
//! Any 2xx status acknowledges the message; any other status is a
//! [`BusError::DeliveryFailure`], and a connection-level error is a
//! [`BusError::Transport`] that also marks the pooled connection closed.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector as HyperHttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use hivebus_common::model::{Endpoint, MessageEnvelope};
use hivebus_common::protocol::error::{BusError, Result};

use crate::pool::{Connection, Connector};

pub(crate) type HttpClient = Client<HyperHttpConnector, Full<Bytes>>;

pub(crate) fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Opens [`Connection`]s to `http://` endpoints.
///
/// All connections share one hyper client, so TCP keep-alive is handled
/// underneath the pool.
#[derive(Clone)]
pub struct HttpConnector {
    client: HttpClient,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            client: build_client(),
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        let uri: Uri = endpoint.address.parse().map_err(|e| {
            BusError::Transport(format!("invalid endpoint URL {}: {}", endpoint.address, e))
        })?;
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            uri,
            open: true,
        }))
    }
}

struct HttpConnection {
    client: HttpClient,
    uri: Uri,
    open: bool,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn transmit(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        let body = serde_json::to_vec(envelope)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| BusError::Transport(format!("failed to build request: {}", e)))?;

        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => {
                self.open = false;
                return Err(BusError::Transport(format!("POST {} failed: {}", self.uri, e)));
            }
        };

        let status = response.status();
        // Drain the body so hyper can reuse the socket
        let _ = response.into_body().collect().await;

        if status.is_success() {
            Ok(())
        } else {
            Err(BusError::DeliveryFailure(format!(
                "{} answered HTTP {}",
                self.uri,
                status.as_u16()
            )))
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
