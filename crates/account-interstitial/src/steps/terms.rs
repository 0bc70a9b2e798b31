use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::bus::PostContent;
use crate::context::{DraftAccount, RegistrationContext, RequestScope, StepOutcome};
use crate::error::{Denial, InterstitialError, InterstitialResult};
use crate::form::FormData;
use crate::steps::{stored_flag_set, StepServices};
use crate::traits::{fields, InterstitialStep};

pub const TEMPLATE: &str = "partials/acceptTos";

/// Form toggle accepting the terms.
pub const AGREE_TERMS: &str = "agree-terms";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermsView {
    /// Terms text after the `parse.post` hook
    pub terms_of_use: String,
}

/// Terms-of-use acceptance interstitial.
pub struct TermsOfUseStep {
    services: StepServices,
}

impl TermsOfUseStep {
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl InterstitialStep for TermsOfUseStep {
    fn name(&self) -> &str {
        "terms-of-use"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    async fn applies(&self, context: &RegistrationContext) -> InterstitialResult<bool> {
        let draft = context.draft()?;
        if !self.services.settings.has_terms_of_use() || draft.accepted_tos {
            return Ok(false);
        }
        if let Some(uid) = draft.uid {
            let stored = self.services.accounts.get_field(uid, fields::ACCEPT_TOS).await?;
            if stored_flag_set(stored.as_deref()) {
                debug!(uid = %uid, "Terms already accepted");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn render(&self, context: &RegistrationContext) -> InterstitialResult<serde_json::Value> {
        let parsed = context
            .request
            .bus
            .fire_parse_post(PostContent {
                content: self.services.settings.terms_of_use.clone(),
            })
            .await?;

        serde_json::to_value(TermsView {
            terms_of_use: parsed.content,
        })
        .map_err(|e| InterstitialError::Hook {
            hook: TEMPLATE.to_string(),
            reason: e.to_string(),
        })
    }

    async fn apply(
        &self,
        _request: &RequestScope,
        draft: &mut DraftAccount,
        form: &FormData,
    ) -> InterstitialResult<StepOutcome> {
        if form.is_affirmative(AGREE_TERMS) {
            draft.accepted_tos = true;
        }

        if draft.accepted_tos {
            Ok(StepOutcome::Accepted)
        } else {
            Ok(StepOutcome::Denied(Denial::TermsRejected))
        }
    }
}
