//! Extension bus: ordered hook registries that let the deployment and
//! plugins contribute interstitials and veto or transform data.
//!
//! The bus is an explicit value shared by `Arc` and carried in the
//! [`RequestScope`](crate::context::RequestScope); there is no global
//! registry. Each hook runs its registered handlers in registration order,
//! threading an accumulator through them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{AccountId, Interstitial, RegistrationContext};
use crate::error::{InterstitialError, InterstitialResult};
use crate::steps::{ConsentStep, EmailUpdateStep, StepServices, TermsOfUseStep};
use crate::traits::InterstitialStep;

pub const HOOK_REGISTER_INTERSTITIAL: &str = "register.interstitial";
pub const HOOK_SAVE_EMAIL: &str = "user.saveEmail";
pub const HOOK_PARSE_POST: &str = "parse.post";

/// Contributes zero or more interstitials to the `register.interstitial` hook.
#[async_trait]
pub trait InterstitialProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn contribute(
        &self,
        context: &RegistrationContext,
        interstitials: Vec<Interstitial>,
    ) -> InterstitialResult<Vec<Interstitial>>;
}

/// Payload of the `user.saveEmail` hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMutation {
    pub uid: Option<AccountId>,
    pub email: Option<String>,
    pub registration: bool,
    pub allowed: bool,
    /// Error code reported when `allowed` ends up false
    pub error: String,
}

impl EmailMutation {
    /// Email change on an existing account.
    pub fn for_account(uid: AccountId, email: Option<String>) -> Self {
        Self {
            uid: Some(uid),
            email,
            registration: false,
            allowed: true,
            error: "[[error:invalid-email]]".to_string(),
        }
    }

    /// Email staged on a new registration.
    pub fn for_registration(email: Option<String>) -> Self {
        Self {
            uid: None,
            email,
            registration: true,
            allowed: true,
            error: "[[error:invalid-email]]".to_string(),
        }
    }
}

/// Handler for the `user.saveEmail` hook.
#[async_trait]
pub trait EmailMutationFilter: Send + Sync {
    async fn filter(&self, mutation: EmailMutation) -> InterstitialResult<EmailMutation>;
}

/// Payload of the `parse.post` hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostContent {
    pub content: String,
}

/// Handler for the `parse.post` hook (markup rendering, sanitising).
#[async_trait]
pub trait ContentFilter: Send + Sync {
    async fn filter(&self, post: PostContent) -> InterstitialResult<PostContent>;
}

/// Adapts an [`InterstitialStep`] into a provider: append one interstitial
/// when the step applies, nothing otherwise.
pub struct StepProvider {
    step: Arc<dyn InterstitialStep>,
}

impl StepProvider {
    pub fn new(step: Arc<dyn InterstitialStep>) -> Self {
        Self { step }
    }
}

#[async_trait]
impl InterstitialProvider for StepProvider {
    fn name(&self) -> &str {
        self.step.name()
    }

    async fn contribute(
        &self,
        context: &RegistrationContext,
        mut interstitials: Vec<Interstitial>,
    ) -> InterstitialResult<Vec<Interstitial>> {
        if !self.step.applies(context).await? {
            debug!(step = self.step.name(), "Step not applicable");
            return Ok(interstitials);
        }

        let data = self.step.render(context).await?;
        interstitials.push(Interstitial::new(
            self.step.template(),
            data,
            self.step.clone(),
            context.request.clone(),
        ));
        Ok(interstitials)
    }
}

/// Registry of hook handlers.
#[derive(Default)]
pub struct ExtensionBus {
    interstitial_providers: Vec<Arc<dyn InterstitialProvider>>,
    email_filters: Vec<Arc<dyn EmailMutationFilter>>,
    content_filters: Vec<Arc<dyn ContentFilter>>,
}

impl ExtensionBus {
    pub fn builder() -> ExtensionBusBuilder {
        ExtensionBusBuilder::default()
    }

    /// Names of the interstitial providers, in firing order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.interstitial_providers.iter().map(|p| p.name()).collect()
    }

    /// Fire `register.interstitial` with an empty accumulator.
    pub async fn fire_register_interstitial(
        &self,
        context: &RegistrationContext,
    ) -> InterstitialResult<Vec<Interstitial>> {
        debug!(
            hook = HOOK_REGISTER_INTERSTITIAL,
            providers = self.interstitial_providers.len(),
            "Firing hook"
        );

        let mut interstitials = Vec::new();
        for provider in &self.interstitial_providers {
            interstitials = provider.contribute(context, interstitials).await?;
        }
        Ok(interstitials)
    }

    /// Fire `user.saveEmail`; filters may flip `allowed` and set `error`.
    pub async fn fire_save_email(&self, mut mutation: EmailMutation) -> InterstitialResult<EmailMutation> {
        debug!(
            hook = HOOK_SAVE_EMAIL,
            registration = mutation.registration,
            "Firing hook"
        );

        for filter in &self.email_filters {
            mutation = filter
                .filter(mutation)
                .await
                .map_err(|e| hook_failure(HOOK_SAVE_EMAIL, e))?;
        }
        Ok(mutation)
    }

    /// Fire `parse.post` to render rich text.
    pub async fn fire_parse_post(&self, mut post: PostContent) -> InterstitialResult<PostContent> {
        debug!(hook = HOOK_PARSE_POST, "Firing hook");

        for filter in &self.content_filters {
            post = filter
                .filter(post)
                .await
                .map_err(|e| hook_failure(HOOK_PARSE_POST, e))?;
        }
        Ok(post)
    }
}

fn hook_failure(hook: &str, error: InterstitialError) -> InterstitialError {
    if error.is_user_facing() {
        error
    } else {
        InterstitialError::Hook {
            hook: hook.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Builder for [`ExtensionBus`].
#[derive(Default)]
pub struct ExtensionBusBuilder {
    bus: ExtensionBus,
}

impl ExtensionBusBuilder {
    /// Register the built-in steps: email update, consent, terms of use.
    pub fn with_builtin_steps(self, services: StepServices) -> Self {
        self.step(Arc::new(EmailUpdateStep::new(services.clone())))
            .step(Arc::new(ConsentStep::new(services.clone())))
            .step(Arc::new(TermsOfUseStep::new(services)))
    }

    pub fn step(self, step: Arc<dyn InterstitialStep>) -> Self {
        self.interstitial(Arc::new(StepProvider::new(step)))
    }

    pub fn interstitial(mut self, provider: Arc<dyn InterstitialProvider>) -> Self {
        self.bus.interstitial_providers.push(provider);
        self
    }

    pub fn email_filter(mut self, filter: Arc<dyn EmailMutationFilter>) -> Self {
        self.bus.email_filters.push(filter);
        self
    }

    pub fn content_filter(mut self, filter: Arc<dyn ContentFilter>) -> Self {
        self.bus.content_filters.push(filter);
        self
    }

    pub fn build(self) -> ExtensionBus {
        self.bus
    }
}
