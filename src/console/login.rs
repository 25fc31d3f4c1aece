//! Credential collection for one authentication attempt.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::console::hooks::{FrontEnd, Level};
use crate::console::prompt::{PromptBroker, PromptRequest};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct LoginNegotiator {
    prompts: PromptBroker,
    frontend: Arc<dyn FrontEnd>,
    presupplied: Credentials,
}

impl LoginNegotiator {
    pub fn new(prompts: PromptBroker, frontend: Arc<dyn FrontEnd>, presupplied: Credentials) -> Self {
        Self {
            prompts,
            frontend,
            presupplied,
        }
    }

    /// Collect credentials and hand them to `authenticate`.
    ///
    /// Failures (cancelled prompt, rejected credentials) are reported through
    /// the front-end and swallowed so the console stays usable for a retry.
    pub async fn login<F, Fut>(&self, authenticate: F, mechanism: Option<&str>)
    where
        F: FnOnce(Credentials) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.try_login(authenticate, mechanism).await {
            Ok(()) => info!(mechanism = ?mechanism, "Authenticated"),
            Err(e) => {
                warn!(mechanism = ?mechanism, error = %e, "Login failed");
                self.frontend.notify(Level::Error, &e.to_string());
            }
        }
    }

    async fn try_login<F, Fut>(&self, authenticate: F, mechanism: Option<&str>) -> Result<()>
    where
        F: FnOnce(Credentials) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let credentials = self.collect(mechanism).await?;
        authenticate(credentials).await
    }

    /// Username only for mechanisms that carry one; password always.
    pub async fn collect(&self, mechanism: Option<&str>) -> Result<Credentials> {
        let mut requests = Vec::with_capacity(2);
        if mechanism.is_some_and(|m| !m.is_empty()) {
            requests.push(
                PromptRequest::new("username", "Username")
                    .with_precomputed(self.presupplied.username.clone()),
            );
        }
        requests.push(
            PromptRequest::new("password", "Password")
                .password()
                .with_precomputed(self.presupplied.password.clone()),
        );

        let mut answers = self.prompts.ask_multiple(&requests).await?;
        Ok(Credentials {
            username: answers.remove("username"),
            password: answers.remove("password"),
        })
    }
}
