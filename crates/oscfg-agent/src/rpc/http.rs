//! HTTP/JSON binding of the agent-endpoint seam.
//!
//! The production gRPC surface is generated elsewhere; this binding speaks
//! the same messages as JSON over HTTP so the agent runs against the
//! service's REST frontend and against test servers. The stream is a
//! long-poll receive leg plus a posted reply leg, pumped into the channel
//! pair the rest of the agent expects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    AgentEndpoint, ClientReply, InventoryReport, RegisterAgentRequest, RpcError, TaskStart,
    TaskStream,
};

/// Unary request timeout.
const UNARY_TIMEOUT: Duration = Duration::from_secs(30);

/// Long-poll hold time for the receive leg.
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP [`AgentEndpoint`].
#[derive(Debug, Clone)]
pub struct HttpAgentEndpoint {
    client: reqwest::Client,
    base_url: Arc<String>,
}

impl HttpAgentEndpoint {
    /// Endpoint rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT + Duration::from_secs(30))
            .build()
            .map_err(|e| RpcError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: Arc::new(base_url.into()),
        })
    }

    async fn post_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<(), RpcError> {
        self.client
            .post(format!("{}{path}", self.base_url))
            .timeout(UNARY_TIMEOUT)
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| RpcError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AgentEndpoint for HttpAgentEndpoint {
    async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<(), RpcError> {
        self.post_json("/registerAgent", request).await
    }

    async fn report_inventory(&self, report: &InventoryReport) -> Result<(), RpcError> {
        self.post_json("/reportInventory", report).await
    }

    async fn open_task_stream(&self) -> Result<TaskStream, RpcError> {
        let (push_tx, push_rx) = mpsc::channel::<TaskStart>(1);
        let (reply_tx, mut reply_rx) = mpsc::channel::<ClientReply>(16);

        // Receive leg: long-poll for TaskStart until the agent side hangs
        // up (push_tx send fails) or the transport errors.
        let recv_client = self.client.clone();
        let recv_base = Arc::clone(&self.base_url);
        tokio::spawn(async move {
            loop {
                let response = recv_client
                    .get(format!("{recv_base}/receiveTaskNotification"))
                    .query(&[("timeout_sec", POLL_TIMEOUT.as_secs().to_string())])
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status);

                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(error = %e, "task notification poll failed");
                        return;
                    }
                };

                // 204: the hold time lapsed without a task.
                if response.status() == reqwest::StatusCode::NO_CONTENT {
                    continue;
                }

                match response.json::<TaskStart>().await {
                    Ok(start) => {
                        if push_tx.send(start).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable task notification");
                        return;
                    }
                }
            }
        });

        // Reply leg: forward progress/complete posts in order.
        let reply_client = self.client.clone();
        let reply_base = Arc::clone(&self.base_url);
        tokio::spawn(async move {
            while let Some(reply) = reply_rx.recv().await {
                let path = match &reply {
                    ClientReply::Progress(_) => "/reportTaskProgress",
                    ClientReply::Complete(_) => "/reportTaskComplete",
                };
                let result = reply_client
                    .post(format!("{reply_base}{path}"))
                    .timeout(UNARY_TIMEOUT)
                    .json(&reply)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status);
                if let Err(e) = result {
                    tracing::warn!(error = %e, "task reply post failed");
                    return;
                }
            }
        });

        Ok(TaskStream {
            incoming: push_rx,
            replies: reply_tx,
        })
    }
}
