//! Dispatch policy
//!
//! Decides how each intercepted request is satisfied: forwarded to the
//! network, served from a local store, or synthesized. The [`Dispatcher`]
//! turns a policy decision into exactly one response for the fetch event.

mod fetch_event;
pub mod rules;
pub mod store;

pub use fetch_event::{FetchEvent, FetchOutcome, FetchResolution, PendingResponse};
pub use rules::{RouteAction, RouteRule, RouteRuleInput, RulePolicy};
pub use store::{MemoryStore, ResponseStore};

use crate::models::{InterceptedRequest, InterceptedResponse};
use crate::network::{Network, NetworkError};
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("no stored response for {0}")]
    StoreMiss(String),
    #[error("serve requested but no response store is configured")]
    NoStore,
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}

/// How a request should be satisfied
#[derive(Debug, Clone)]
pub enum Decision {
    /// Send the request unmodified to the network
    Forward,
    /// Serve the response stored under the given key
    Serve(String),
    /// Answer with a locally built response
    Synthesize(InterceptedResponse),
    /// Do not respond; the host applies its default network behaviour
    Default,
}

/// Extension point for request handling.
pub trait DispatchPolicy: Send + Sync {
    fn decide<'a>(
        &'a self,
        request: &'a InterceptedRequest,
    ) -> BoxFuture<'a, Result<Decision, DispatchError>>;

    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Forward every request unmodified.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPolicy;

impl DispatchPolicy for PassthroughPolicy {
    fn decide<'a>(
        &'a self,
        _request: &'a InterceptedRequest,
    ) -> BoxFuture<'a, Result<Decision, DispatchError>> {
        Box::pin(async { Ok(Decision::Forward) })
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// Receives fetch events delivered to an active interceptor.
pub trait FetchHandler: Send + Sync {
    fn handle(&self, event: FetchEvent) -> BoxFuture<'_, ()>;
}

/// Fetch handler that consults a [`DispatchPolicy`] and executes its decision.
pub struct Dispatcher {
    policy: Arc<dyn DispatchPolicy>,
    network: Arc<dyn Network>,
    store: Option<Arc<dyn ResponseStore>>,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn DispatchPolicy>, network: Arc<dyn Network>) -> Self {
        Self {
            policy,
            network,
            store: None,
        }
    }

    pub fn passthrough(network: Arc<dyn Network>) -> Self {
        Self::new(Arc::new(PassthroughPolicy), network)
    }

    pub fn with_store(mut self, store: Arc<dyn ResponseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Turn a decision into the pending response. `None` means the host
    /// default applies.
    fn execute(&self, request: InterceptedRequest, decision: Decision) -> Option<PendingResponse> {
        let pending: PendingResponse = match decision {
            Decision::Forward => {
                let fetch = self.network.fetch(request);
                Box::pin(async move { fetch.await.map_err(DispatchError::from) })
            }
            Decision::Serve(key) => {
                let store = self.store.clone();
                Box::pin(async move {
                    let store = store.ok_or(DispatchError::NoStore)?;
                    let found = store.lookup(&key).await;
                    found.ok_or(DispatchError::StoreMiss(key))
                })
            }
            Decision::Synthesize(response) => Box::pin(async move { Ok(response) }),
            Decision::Default => return None,
        };
        Some(pending)
    }
}

impl FetchHandler for Dispatcher {
    fn handle(&self, event: FetchEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let decided = self.policy.decide(event.request()).await;
            match decided {
                Ok(decision) => {
                    tracing::debug!(
                        "Policy '{}' chose {} for {} {}",
                        self.policy.name(),
                        decision_label(&decision),
                        event.request().method(),
                        event.request().url()
                    );
                    match self.execute(event.request().clone(), decision) {
                        Some(pending) => event.respond_with(pending),
                        // Dropping the event hands the request back to the host.
                        None => drop(event),
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        "Policy '{}' failed for {}: {}",
                        self.policy.name(),
                        event.request().url(),
                        err
                    );
                    event.respond_with(async move { Err(err) });
                }
            }
        })
    }
}

fn decision_label(decision: &Decision) -> &'static str {
    match decision {
        Decision::Forward => "forward",
        Decision::Serve(_) => "serve",
        Decision::Synthesize(_) => "synthesize",
        Decision::Default => "default",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::{InterceptedResponse, ResponseSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted network: answers with a fixed status, or fails as unreachable.
    /// Every request it receives is recorded.
    pub struct StubNetwork {
        status: Option<u16>,
        calls: AtomicUsize,
        received: Mutex<Vec<InterceptedRequest>>,
    }

    impl StubNetwork {
        fn scripted(status: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                status,
                calls: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn ok(status: u16) -> Arc<Self> {
            Self::scripted(Some(status))
        }

        pub fn unreachable() -> Arc<Self> {
            Self::scripted(None)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn received(&self) -> Vec<InterceptedRequest> {
            self.received.lock().unwrap().clone()
        }
    }

    impl Network for StubNetwork {
        fn fetch(
            &self,
            request: InterceptedRequest,
        ) -> BoxFuture<'static, Result<InterceptedResponse, NetworkError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.received.lock().unwrap().push(request.clone());
            let status = self.status;
            Box::pin(async move {
                match status {
                    Some(status_code) => Ok(InterceptedResponse {
                        status_code,
                        status_message: None,
                        headers: Vec::new(),
                        body: request.url().as_bytes().to_vec(),
                        source: ResponseSource::Network,
                    }),
                    None => Err(NetworkError::Unreachable {
                        url: request.url().to_string(),
                        reason: "connection refused".into(),
                    }),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StubNetwork;
    use super::*;
    use crate::models::ResponseSource;

    async fn run(dispatcher: &Dispatcher, request: InterceptedRequest) -> FetchOutcome {
        let (event, resolution) = FetchEvent::new(request, None);
        let (_, outcome) = tokio::join!(dispatcher.handle(event), resolution.outcome());
        outcome
    }

    #[tokio::test]
    async fn passthrough_forwards_status_unmodified() {
        let network = StubNetwork::ok(500);
        let dispatcher = Dispatcher::passthrough(network.clone());
        match run(&dispatcher, InterceptedRequest::get("https://example.com/a.json")).await {
            FetchOutcome::Responded(Ok(resp)) => {
                assert_eq!(resp.status_code, 500);
                assert_eq!(resp.source, ResponseSource::Network);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn network_failure_propagates_without_retry() {
        let network = StubNetwork::unreachable();
        let dispatcher = Dispatcher::passthrough(network.clone());
        let outcome = run(&dispatcher, InterceptedRequest::get("https://example.com/a.json")).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Responded(Err(DispatchError::Network(NetworkError::Unreachable { .. })))
        ));
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn serve_reads_from_store() {
        let store = Arc::new(MemoryStore::new());
        let request = InterceptedRequest::get("https://example.com/logo.png");
        store.insert(
            request.identity(),
            InterceptedResponse::synthesized(200, b"png".to_vec()),
        );
        let policy = RulePolicy::new(RouteAction::Serve);
        let network = StubNetwork::ok(200);
        let dispatcher =
            Dispatcher::new(Arc::new(policy), network.clone()).with_store(store.clone());

        match run(&dispatcher, request).await {
            FetchOutcome::Responded(Ok(resp)) => {
                assert_eq!(resp.body, b"png");
                assert_eq!(resp.source, ResponseSource::Store);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn serve_miss_is_a_failed_resolution() {
        let dispatcher = Dispatcher::new(
            Arc::new(RulePolicy::new(RouteAction::Serve)),
            StubNetwork::ok(200),
        )
        .with_store(Arc::new(MemoryStore::new()));
        let outcome = run(&dispatcher, InterceptedRequest::get("https://example.com/x")).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Responded(Err(DispatchError::StoreMiss(_)))
        ));
    }

    #[tokio::test]
    async fn serve_without_store_fails() {
        let dispatcher = Dispatcher::new(
            Arc::new(RulePolicy::new(RouteAction::Serve)),
            StubNetwork::ok(200),
        );
        let outcome = run(&dispatcher, InterceptedRequest::get("https://example.com/x")).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Responded(Err(DispatchError::NoStore))
        ));
    }

    #[tokio::test]
    async fn default_decision_declines_event() {
        let network = StubNetwork::ok(200);
        let dispatcher = Dispatcher::new(
            Arc::new(RulePolicy::new(RouteAction::Default)),
            network.clone(),
        );
        let outcome = run(&dispatcher, InterceptedRequest::get("https://example.com/x")).await;
        assert!(matches!(outcome, FetchOutcome::Declined));
        assert_eq!(network.calls(), 0);
    }

    struct FailingPolicy;

    impl DispatchPolicy for FailingPolicy {
        fn decide<'a>(
            &'a self,
            _request: &'a InterceptedRequest,
        ) -> BoxFuture<'a, Result<Decision, DispatchError>> {
            Box::pin(async { Err(DispatchError::Synthesis("template missing".into())) })
        }
    }

    #[tokio::test]
    async fn policy_error_is_reported_once() {
        let dispatcher = Dispatcher::new(Arc::new(FailingPolicy), StubNetwork::ok(200));
        assert_eq!(dispatcher.policy_name(), "custom");
        let outcome = run(&dispatcher, InterceptedRequest::get("https://example.com/x")).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Responded(Err(DispatchError::Synthesis(_)))
        ));
    }
}
