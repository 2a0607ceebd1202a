use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use super::{NodeRpc, NodeRpcError, ShareBody, StoreShareBody};
use crate::model::KeyShareNode;

/// Talks to custodian nodes over HTTP.
#[derive(Debug, Clone)]
pub struct HttpNodeRpc {
    client: Client,
}

impl HttpNodeRpc {
    /// Create a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, NodeRpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeRpcError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(node: &KeyShareNode, path: &str) -> String {
        format!("{}{}", node.server_url.trim_end_matches('/'), path)
    }

    async fn check(response: Response) -> Result<Response, NodeRpcError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(NodeRpcError::NotFound);
        }
        let msg = response.text().await.unwrap_or_default();
        Err(NodeRpcError::Rejected {
            status: status.as_u16(),
            msg,
        })
    }
}

fn transport(e: reqwest::Error) -> NodeRpcError {
    if e.is_timeout() {
        NodeRpcError::Timeout
    } else {
        NodeRpcError::Transport(e.to_string())
    }
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn store_share(
        &self,
        node: &KeyShareNode,
        token: &str,
        public_key: &[u8],
        share: &[u8],
    ) -> Result<(), NodeRpcError> {
        let body = StoreShareBody {
            public_key: public_key.to_vec(),
            share: share.to_vec(),
        };
        let response = self
            .client
            .post(Self::url(node, "/share"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_share(
        &self,
        node: &KeyShareNode,
        token: &str,
        public_key: &[u8],
    ) -> Result<Vec<u8>, NodeRpcError> {
        let response = self
            .client
            .get(Self::url(node, "/share"))
            .bearer_auth(token)
            .query(&[("public_key", hex::encode(public_key))])
            .send()
            .await
            .map_err(transport)?;
        let body: ShareBody = Self::check(response)
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(body.share)
    }

    async fn delete_share(
        &self,
        node: &KeyShareNode,
        token: &str,
        public_key: &[u8],
    ) -> Result<(), NodeRpcError> {
        let response = self
            .client
            .delete(Self::url(node, "/share"))
            .bearer_auth(token)
            .query(&[("public_key", hex::encode(public_key))])
            .send()
            .await
            .map_err(transport)?;
        match Self::check(response).await {
            // Deleting what is already gone is fine.
            Ok(_) | Err(NodeRpcError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn status(&self, node: &KeyShareNode) -> Result<(), NodeRpcError> {
        let response = self
            .client
            .get(Self::url(node, "/status"))
            .send()
            .await
            .map_err(transport)?;
        Self::check(response).await?;
        Ok(())
    }
}
