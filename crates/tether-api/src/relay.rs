//! HTTP relay client: posts forward batches to `http://{node}/api/forward`.

use std::time::Duration;

use async_trait::async_trait;

use tether_core::{ForwardAck, ForwardRequest};
use tether_services::{RelayClient, RelayError};

#[derive(Clone)]
pub struct HttpRelayClient {
    client: reqwest::Client,
}

impl HttpRelayClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(node: &str) -> String {
        format!("http://{node}/api/forward")
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn push_forward(&self, node: &str, request: ForwardRequest) -> Result<ForwardAck, RelayError> {
        let failed = |e: reqwest::Error| RelayError::Failed {
            node: node.to_string(),
            reason: e.to_string(),
        };

        let resp = self
            .client
            .post(Self::url(node))
            .json(&request)
            .send()
            .await
            .map_err(failed)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Rejected {
                node: node.to_string(),
                status: status.as_u16(),
            });
        }
        resp.json::<ForwardAck>().await.map_err(failed)
    }
}
