//! Fetch event and its single-use responder.
//!
//! Each [`FetchEvent`] is paired with a [`FetchResolution`] held by the host.
//! `respond_with` consumes the event, so a second response cannot be
//! expressed; dropping the event without responding resolves the pair as
//! [`FetchOutcome::Declined`], which the host answers with its default
//! network behaviour. Either way the host observes exactly one outcome.

use super::DispatchError;
use crate::models::{ClientId, InterceptedRequest, InterceptedResponse};
use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::oneshot;

pub type PendingResponse = BoxFuture<'static, Result<InterceptedResponse, DispatchError>>;

pub struct FetchEvent {
    request: InterceptedRequest,
    client_id: Option<ClientId>,
    responder: oneshot::Sender<PendingResponse>,
}

impl FetchEvent {
    pub fn new(
        request: InterceptedRequest,
        client_id: Option<ClientId>,
    ) -> (Self, FetchResolution) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                client_id,
                responder: tx,
            },
            FetchResolution { rx },
        )
    }

    pub fn request(&self) -> &InterceptedRequest {
        &self.request
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    /// Supply the (possibly deferred) outcome for this request.
    pub fn respond_with<F>(self, response: F)
    where
        F: Future<Output = Result<InterceptedResponse, DispatchError>> + Send + 'static,
    {
        if self.responder.send(Box::pin(response)).is_err() {
            tracing::debug!(
                "Fetch resolution for {} dropped before a response was supplied",
                self.request.id()
            );
        }
    }
}

/// Outcome of a fetch event as observed by the host
#[derive(Debug)]
pub enum FetchOutcome {
    /// The handler supplied a response (or a failure)
    Responded(Result<InterceptedResponse, DispatchError>),
    /// The handler let the event complete without a response
    Declined,
}

/// Host side of a [`FetchEvent`]
pub struct FetchResolution {
    rx: oneshot::Receiver<PendingResponse>,
}

impl FetchResolution {
    /// Wait for the handler to respond or decline, then drive the supplied
    /// response to completion.
    pub async fn outcome(self) -> FetchOutcome {
        match self.rx.await {
            Ok(pending) => FetchOutcome::Responded(pending.await),
            Err(_) => FetchOutcome::Declined,
        }
    }
}
