use crate::ipc::protocol::{IpcRequest, IpcResponse};
use crate::ipc::resolver::DnsResolver;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Link to the child a request came from
///
/// Returns `None` once that child is gone. A response must never be routed to
/// a different child than the one that asked.
pub trait ChildChannel: Send + Sync {
    fn sender(&self) -> Option<mpsc::UnboundedSender<IpcResponse>>;
}

/// Resolves DNS requests for a sandboxed child through the shared resolver
#[derive(Clone)]
pub struct DnsBridge {
    resolver: Arc<dyn DnsResolver>,
}

impl DnsBridge {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self { resolver }
    }

    /// Answer one request. Never fails: resolution errors are sent back to the
    /// child and delivery problems are only logged.
    pub async fn handle_request(&self, request: IpcRequest, channel: &dyn ChildChannel) {
        debug!(
            "Handling {} for {} (request {})",
            request.kind(),
            request.hostname(),
            request.request_id()
        );

        let response = match self.resolve(&request).await {
            Ok(result) => IpcResponse::success(&request, result),
            Err(error) => IpcResponse::failure(&request, error),
        };

        send_guarded(channel, response);
    }

    async fn resolve(&self, request: &IpcRequest) -> Result<Value, String> {
        let result = match request {
            IpcRequest::DnsLookup {
                hostname, options, ..
            } => self
                .resolver
                .lookup(hostname, options)
                .await
                .and_then(|r| Ok(serde_json::to_value(r)?)),
            IpcRequest::DnsResolve4 {
                hostname, options, ..
            } => self
                .resolver
                .resolve4(hostname, options)
                .await
                .and_then(|r| Ok(serde_json::to_value(r)?)),
            IpcRequest::DnsResolve6 {
                hostname, options, ..
            } => self
                .resolver
                .resolve6(hostname, options)
                .await
                .and_then(|r| Ok(serde_json::to_value(r)?)),
        };

        result.map_err(|e| e.to_string())
    }
}

/// Deliver a response if the child is still there
pub fn send_guarded(channel: &dyn ChildChannel, response: IpcResponse) {
    let Some(sender) = channel.sender() else {
        debug!(
            "Dropping {} for request {}: process is gone",
            response.kind, response.request_id
        );
        return;
    };

    if sender.is_closed() {
        debug!(
            "Dropping {} for request {}: IPC channel disconnected",
            response.kind, response.request_id
        );
        return;
    }

    if let Err(e) = sender.send(response) {
        warn!("Failed to send IPC response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SupervisorError};
    use crate::ipc::protocol::{
        LookupAddress, LookupOptions, LookupResult, ResolveOptions, ResolvedRecord,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Resolver answering from a fixed table, optionally waiting for a signal
    struct StaticResolver {
        gate: Option<Arc<Notify>>,
    }

    impl StaticResolver {
        async fn wait(&self) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }
    }

    #[async_trait]
    impl DnsResolver for StaticResolver {
        async fn lookup(&self, hostname: &str, _options: &LookupOptions) -> Result<LookupResult> {
            self.wait().await;
            if hostname == "api.tago.io" {
                Ok(LookupResult::One(LookupAddress {
                    address: "10.0.0.1".to_string(),
                    family: 4,
                }))
            } else {
                Err(SupervisorError::DnsError(
                    hostname.to_string(),
                    "ENOTFOUND".to_string(),
                ))
            }
        }

        async fn resolve4(
            &self,
            _hostname: &str,
            _options: &ResolveOptions,
        ) -> Result<Vec<ResolvedRecord>> {
            self.wait().await;
            Ok(vec![ResolvedRecord::Address("10.0.0.1".to_string())])
        }

        async fn resolve6(
            &self,
            _hostname: &str,
            _options: &ResolveOptions,
        ) -> Result<Vec<ResolvedRecord>> {
            self.wait().await;
            Ok(vec![ResolvedRecord::Address("::1".to_string())])
        }
    }

    /// Channel whose child can disappear at any time
    struct TestChannel {
        sender: Mutex<Option<mpsc::UnboundedSender<IpcResponse>>>,
    }

    impl ChildChannel for TestChannel {
        fn sender(&self) -> Option<mpsc::UnboundedSender<IpcResponse>> {
            self.sender.lock().unwrap().clone()
        }
    }

    fn channel() -> (Arc<TestChannel>, mpsc::UnboundedReceiver<IpcResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(TestChannel {
                sender: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn lookup(hostname: &str) -> IpcRequest {
        IpcRequest::DnsLookup {
            request_id: json!(1),
            hostname: hostname.to_string(),
            options: LookupOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_lookup_success_response() {
        let bridge = DnsBridge::new(Arc::new(StaticResolver { gate: None }));
        let (channel, mut rx) = channel();

        bridge.handle_request(lookup("api.tago.io"), channel.as_ref()).await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.kind, "DNS_LOOKUP_RESPONSE");
        assert_eq!(response.request_id, json!(1));
        assert_eq!(
            response.result,
            Some(json!({"address": "10.0.0.1", "family": 4}))
        );
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_resolution_error_is_sent_back() {
        let bridge = DnsBridge::new(Arc::new(StaticResolver { gate: None }));
        let (channel, mut rx) = channel();

        bridge.handle_request(lookup("nowhere.invalid"), channel.as_ref()).await;

        let response = rx.recv().await.unwrap();
        assert!(response.result.is_none());
        assert!(response.error.unwrap().contains("ENOTFOUND"));
    }

    #[tokio::test]
    async fn test_resolve6_response() {
        let bridge = DnsBridge::new(Arc::new(StaticResolver { gate: None }));
        let (channel, mut rx) = channel();
        let request = IpcRequest::DnsResolve6 {
            request_id: json!("r-9"),
            hostname: "example.com".to_string(),
            options: ResolveOptions::default(),
        };

        bridge.handle_request(request, channel.as_ref()).await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.kind, "DNS_RESOLVE6_RESPONSE");
        assert_eq!(response.request_id, json!("r-9"));
        assert_eq!(response.result, Some(json!(["::1"])));
    }

    #[tokio::test]
    async fn test_process_gone_mid_request() {
        let gate = Arc::new(Notify::new());
        let bridge = DnsBridge::new(Arc::new(StaticResolver {
            gate: Some(gate.clone()),
        }));
        let (channel, mut rx) = channel();

        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                bridge.handle_request(lookup("api.tago.io"), channel.as_ref()).await;
            })
        };

        // The child exits while the lookup is in flight
        tokio::task::yield_now().await;
        channel.sender.lock().unwrap().take();
        gate.notify_one();

        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_channel_is_ignored() {
        let bridge = DnsBridge::new(Arc::new(StaticResolver { gate: None }));
        let (channel, rx) = channel();
        drop(rx);

        bridge.handle_request(lookup("api.tago.io"), channel.as_ref()).await;
    }
}
