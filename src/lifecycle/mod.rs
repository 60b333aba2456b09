//! Lifecycle manager
//!
//! Owns the `Uninstalled -> Installed -> Active` state machine of a single
//! interceptor instance and decides at each transition whether the instance
//! seizes control immediately or defers to the host's staged rollout.

mod context;

pub use context::{ActivateContext, InstallContext};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Lifecycle state of an interceptor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Loaded by the host, install not yet completed
    Uninstalled,
    /// Install completed; waiting to become the active version
    Installed,
    /// Active version; may control clients and receive fetches
    Active,
}

impl LifecycleState {
    /// The machine is linear: the only legal moves are one step forward.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::Uninstalled, LifecycleState::Installed)
                | (LifecycleState::Installed, LifecycleState::Active)
        )
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("install failed: {0}")]
    InstallFailed(String),
    #[error("activate failed: {0}")]
    ActivateFailed(String),
}

pub type InstallHandler =
    Arc<dyn Fn(InstallContext) -> BoxFuture<'static, Result<(), LifecycleError>> + Send + Sync>;
pub type ActivateHandler =
    Arc<dyn Fn(ActivateContext) -> BoxFuture<'static, Result<(), LifecycleError>> + Send + Sync>;

/// Result of a completed install event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    pub skip_waiting: bool,
}

/// Result of a completed activate event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivateOutcome {
    pub claim_clients: bool,
}

pub struct LifecycleManager {
    state: Mutex<LifecycleState>,
    install_handler: Option<InstallHandler>,
    activate_handler: Option<ActivateHandler>,
    default_skip_waiting: bool,
    default_claim: bool,
}

impl LifecycleManager {
    pub fn new(
        install_handler: Option<InstallHandler>,
        activate_handler: Option<ActivateHandler>,
    ) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninstalled),
            install_handler,
            activate_handler,
            default_skip_waiting: false,
            default_claim: false,
        }
    }

    /// Pre-set the takeover requests before any handler runs.
    pub fn with_takeover(mut self, skip_waiting: bool, claim_clients: bool) -> Self {
        self.default_skip_waiting = skip_waiting;
        self.default_claim = claim_clients;
        self
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn has_install_handler(&self) -> bool {
        self.install_handler.is_some()
    }

    pub fn has_activate_handler(&self) -> bool {
        self.activate_handler.is_some()
    }

    fn ensure_state(
        &self,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<(), LifecycleError> {
        let current = self.state();
        if current != expected || !current.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        Ok(())
    }

    fn transition(&self, next: LifecycleState) -> Result<(), LifecycleError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !guard.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: *guard,
                to: next,
            });
        }
        tracing::debug!("Lifecycle transition {:?} -> {:?}", *guard, next);
        *guard = next;
        Ok(())
    }

    /// Deliver the install event. Runs the install handler (if any), waits for
    /// every extension it registered, then moves to `Installed`.
    pub async fn on_install(&self) -> Result<InstallOutcome, LifecycleError> {
        self.ensure_state(LifecycleState::Uninstalled, LifecycleState::Installed)?;

        let ctx = InstallContext::new(self.default_skip_waiting);
        if let Some(handler) = &self.install_handler {
            handler(ctx.clone()).await?;
        }
        ctx.settle().await?;

        self.transition(LifecycleState::Installed)?;
        Ok(InstallOutcome {
            skip_waiting: ctx.skip_waiting_requested(),
        })
    }

    /// Deliver the activate event. Only legal once installed.
    pub async fn on_activate(&self) -> Result<ActivateOutcome, LifecycleError> {
        self.ensure_state(LifecycleState::Installed, LifecycleState::Active)?;

        let ctx = ActivateContext::new(self.default_claim);
        if let Some(handler) = &self.activate_handler {
            handler(ctx.clone()).await?;
        }
        ctx.settle().await?;

        self.transition(LifecycleState::Active)?;
        Ok(ActivateOutcome {
            claim_clients: ctx.claim_requested(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn install_handler<F>(f: F) -> InstallHandler
    where
        F: Fn(InstallContext) -> Result<(), LifecycleError> + Send + Sync + 'static,
    {
        Arc::new(move |ctx: InstallContext| -> BoxFuture<'static, Result<(), LifecycleError>> {
            let result = f(ctx);
            Box::pin(async move { result })
        })
    }

    #[tokio::test]
    async fn install_then_activate_follows_linear_machine() {
        let manager = LifecycleManager::new(None, None);
        assert_eq!(manager.state(), LifecycleState::Uninstalled);

        let installed = manager.on_install().await.unwrap();
        assert!(!installed.skip_waiting);
        assert_eq!(manager.state(), LifecycleState::Installed);

        let activated = manager.on_activate().await.unwrap();
        assert!(!activated.claim_clients);
        assert!(manager.is_active());
    }

    #[tokio::test]
    async fn activate_before_install_is_rejected() {
        let manager = LifecycleManager::new(None, None);
        let err = manager.on_activate().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: LifecycleState::Uninstalled,
                to: LifecycleState::Active
            }
        ));
        assert_eq!(manager.state(), LifecycleState::Uninstalled);
    }

    #[tokio::test]
    async fn install_is_delivered_only_once() {
        let manager = LifecycleManager::new(None, None);
        manager.on_install().await.unwrap();
        assert!(manager.on_install().await.is_err());
        manager.on_activate().await.unwrap();
        assert!(manager.on_install().await.is_err());
        assert!(manager.on_activate().await.is_err());
        assert_eq!(manager.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn handler_can_request_skip_waiting() {
        let manager = LifecycleManager::new(
            Some(install_handler(|ctx| {
                ctx.skip_waiting();
                Ok(())
            })),
            None,
        );
        assert!(manager.on_install().await.unwrap().skip_waiting);
    }

    #[tokio::test]
    async fn failing_install_handler_leaves_instance_uninstalled() {
        let manager = LifecycleManager::new(
            Some(install_handler(|_| {
                Err(LifecycleError::InstallFailed("precache failed".into()))
            })),
            None,
        );
        let err = manager.on_install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstallFailed(_)));
        assert_eq!(manager.state(), LifecycleState::Uninstalled);
    }

    #[tokio::test]
    async fn install_waits_for_extensions() {
        let settled = Arc::new(AtomicUsize::new(0));
        let counter = settled.clone();
        let manager = LifecycleManager::new(
            Some(install_handler(move |ctx| {
                let counter = counter.clone();
                ctx.wait_until(async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            })),
            None,
        );
        manager.on_install().await.unwrap();
        assert_eq!(settled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_extension_aborts_activation() {
        let handler: ActivateHandler = Arc::new(
            |ctx: ActivateContext| -> BoxFuture<'static, Result<(), LifecycleError>> {
                ctx.claim_clients();
                ctx.wait_until(async { Err(LifecycleError::ActivateFailed("migration".into())) });
                Box::pin(async { Ok(()) })
            },
        );
        let manager = LifecycleManager::new(None, Some(handler));
        manager.on_install().await.unwrap();
        assert!(manager.on_activate().await.is_err());
        assert_eq!(manager.state(), LifecycleState::Installed);
    }

    #[tokio::test]
    async fn nested_extension_failure_aborts_install() {
        let manager = LifecycleManager::new(
            Some(install_handler(|ctx| {
                let inner = ctx.clone();
                ctx.wait_until(async move {
                    tokio::task::yield_now().await;
                    inner.wait_until(async {
                        Err(LifecycleError::InstallFailed("late precache".into()))
                    });
                    Ok(())
                });
                Ok(())
            })),
            None,
        );
        let err = manager.on_install().await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstallFailed(_)));
        assert_eq!(manager.state(), LifecycleState::Uninstalled);
    }

    #[tokio::test]
    async fn extension_registered_after_settling_is_ignored() {
        let kept: Arc<Mutex<Option<InstallContext>>> = Arc::default();
        let slot = kept.clone();
        let manager = LifecycleManager::new(
            Some(install_handler(move |ctx| {
                *slot.lock().unwrap() = Some(ctx);
                Ok(())
            })),
            None,
        );
        manager.on_install().await.unwrap();

        let late = kept.lock().unwrap().take().unwrap();
        late.wait_until(async { Err(LifecycleError::InstallFailed("too late".into())) });
        assert!(late.settle().await.is_ok());
        assert_eq!(manager.state(), LifecycleState::Installed);
    }

    #[tokio::test]
    async fn takeover_defaults_apply_without_handlers() {
        let manager = LifecycleManager::new(None, None).with_takeover(true, true);
        assert!(manager.on_install().await.unwrap().skip_waiting);
        assert!(manager.on_activate().await.unwrap().claim_clients);
    }
}
