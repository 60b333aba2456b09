use super::{Decision, DispatchError, DispatchPolicy};
use crate::models::{HttpMethod, InterceptedRequest, InterceptedResponse};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// What to do with a request matched by a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteAction {
    Forward,
    /// Serve from the store under the request's own identity
    Serve,
    /// Serve from the store under an explicit key
    ServeKey(String),
    Synthesize {
        status_code: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    },
    /// Let the host apply its default network behaviour
    Default,
}

/// Input payload for creating routing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRuleInput {
    pub enabled: bool,
    pub method: Option<HttpMethod>,
    pub host_contains: Option<String>,
    pub path_contains: Option<String>,
    pub action: RouteAction,
}

impl Default for RouteRuleInput {
    fn default() -> Self {
        Self {
            enabled: true,
            method: None,
            host_contains: None,
            path_contains: None,
            action: RouteAction::Forward,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub id: String,
    pub enabled: bool,
    pub method: Option<HttpMethod>,
    pub host_contains: Option<String>,
    pub path_contains: Option<String>,
    pub action: RouteAction,
}

/// Ordered rule table; the first enabled matching rule decides.
pub struct RulePolicy {
    rules: RwLock<Vec<RouteRule>>,
    fallback: RouteAction,
}

impl Default for RulePolicy {
    fn default() -> Self {
        Self::new(RouteAction::Forward)
    }
}

impl RulePolicy {
    pub fn new(fallback: RouteAction) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            fallback,
        }
    }

    pub fn list_rules(&self) -> Vec<RouteRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_rule(&self, input: RouteRuleInput) -> RouteRule {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let rule = RouteRule {
            id: Uuid::new_v4().to_string(),
            enabled: input.enabled,
            method: input.method,
            host_contains: input.host_contains,
            path_contains: input.path_contains,
            action: input.action,
        };
        rules.push(rule.clone());
        rule
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        before != rules.len()
    }

    fn rule_matches(rule: &RouteRule, request: &InterceptedRequest) -> bool {
        if !rule.enabled {
            return false;
        }
        if let Some(method) = &rule.method {
            if method != request.method() {
                return false;
            }
        }
        if let Some(host) = &rule.host_contains {
            if !request.host().contains(&host.to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(path) = &rule.path_contains {
            if !request
                .path()
                .to_ascii_lowercase()
                .contains(&path.to_ascii_lowercase())
            {
                return false;
            }
        }
        true
    }

    fn action_for(&self, request: &InterceptedRequest) -> RouteAction {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|rule| Self::rule_matches(rule, request))
            .map(|rule| rule.action.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl DispatchPolicy for RulePolicy {
    fn decide<'a>(
        &'a self,
        request: &'a InterceptedRequest,
    ) -> BoxFuture<'a, Result<Decision, DispatchError>> {
        let decision = match self.action_for(request) {
            RouteAction::Forward => Decision::Forward,
            RouteAction::Serve => Decision::Serve(request.identity()),
            RouteAction::ServeKey(key) => Decision::Serve(key),
            RouteAction::Synthesize {
                status_code,
                content_type,
                body,
            } => {
                let mut response = InterceptedResponse::synthesized(status_code, body);
                if let Some(content_type) = content_type {
                    response = response.with_header("content-type", content_type);
                }
                Decision::Synthesize(response)
            }
            RouteAction::Default => Decision::Default,
        };
        tracing::trace!("Rule policy decided {:?} for {}", decision, request.url());
        Box::pin(async move { Ok(decision) })
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}
