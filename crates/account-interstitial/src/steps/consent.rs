use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::context::{DraftAccount, RegistrationContext, RequestScope, StepOutcome};
use crate::error::{Denial, InterstitialError, InterstitialResult};
use crate::form::FormData;
use crate::steps::{stored_flag_set, StepServices};
use crate::traits::{fields, InterstitialStep};

pub const TEMPLATE: &str = "partials/gdpr_consent";

/// Form toggle agreeing to data processing.
pub const AGREE_DATA: &str = "gdpr_agree_data";
/// Form toggle agreeing to email communication.
pub const AGREE_EMAIL: &str = "gdpr_agree_email";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentView {
    pub digest_frequency: String,
    pub digest_enabled: bool,
}

/// Data-processing consent interstitial.
pub struct ConsentStep {
    services: StepServices,
}

impl ConsentStep {
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl InterstitialStep for ConsentStep {
    fn name(&self) -> &str {
        "consent"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    async fn applies(&self, context: &RegistrationContext) -> InterstitialResult<bool> {
        if !self.services.settings.gdpr_enabled {
            return Ok(false);
        }
        let draft = context.draft()?;
        if draft.gdpr_consent {
            return Ok(false);
        }
        if let Some(uid) = draft.uid {
            let stored = self
                .services
                .accounts
                .get_field(uid, fields::GDPR_CONSENT)
                .await?;
            if stored_flag_set(stored.as_deref()) {
                debug!(uid = %uid, "Consent already on record");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn render(&self, _context: &RegistrationContext) -> InterstitialResult<serde_json::Value> {
        let settings = &self.services.settings;
        serde_json::to_value(ConsentView {
            digest_frequency: settings.daily_digest_freq.clone(),
            digest_enabled: settings.digest_enabled(),
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
        if form.is_affirmative(AGREE_DATA) && form.is_affirmative(AGREE_EMAIL) {
            draft.gdpr_consent = true;
        }

        if draft.gdpr_consent {
            Ok(StepOutcome::Accepted)
        } else {
            Ok(StepOutcome::Denied(Denial::ConsentDenied))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bus::ExtensionBus;
    use crate::context::AccountId;
    use crate::mocks::{Harness, StaticPrivileges};
    use crate::settings::InterstitialSettings;

    fn harness(settings: InterstitialSettings) -> Harness {
        Harness::new(settings, StaticPrivileges::new())
    }

    fn context(h: &Harness, draft: DraftAccount) -> RegistrationContext {
        RegistrationContext::new(
            h.scope(draft.uid, Arc::new(ExtensionBus::builder().build())),
            draft,
        )
    }

    #[tokio::test]
    async fn disabled_deployment_skips_even_without_draft() {
        let h = harness(InterstitialSettings {
            gdpr_enabled: false,
            ..Default::default()
        });
        let step = ConsentStep::new(h.services());
        let ctx = RegistrationContext::without_draft(h.scope(None, Arc::new(ExtensionBus::default())));
        assert!(!step.applies(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn stored_consent_skips_existing_account() {
        let h = harness(InterstitialSettings::default());
        h.accounts.insert_account(AccountId(4), None, false, None).await;
        let step = ConsentStep::new(h.services());
        let ctx = context(&h, DraftAccount::existing(AccountId(4)));
        assert!(step.applies(&ctx).await.unwrap());

        h.accounts
            .set_raw_field(AccountId(4), fields::GDPR_CONSENT, "1")
            .await;
        assert!(!step.applies(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn render_exposes_digest_settings() {
        let h = harness(InterstitialSettings {
            daily_digest_freq: "week".into(),
            ..Default::default()
        });
        let step = ConsentStep::new(h.services());
        let data = step
            .render(&context(&h, DraftAccount::registration()))
            .await
            .unwrap();
        assert_eq!(data["digestFrequency"], "week");
        assert_eq!(data["digestEnabled"], true);
    }

    #[tokio::test]
    async fn both_toggles_grant_consent() {
        let h = harness(InterstitialSettings::default());
        let step = ConsentStep::new(h.services());
        let request = h.scope(None, Arc::new(ExtensionBus::default()));
        let mut draft = DraftAccount::registration();

        let half = FormData::new().with(AGREE_DATA, "on");
        assert_eq!(
            step.apply(&request, &mut draft, &half).await.unwrap(),
            StepOutcome::Denied(Denial::ConsentDenied)
        );
        assert!(!draft.gdpr_consent);

        let full = half.with(AGREE_EMAIL, "on");
        assert!(step.apply(&request, &mut draft, &full).await.unwrap().is_accepted());
        assert!(draft.gdpr_consent);
    }
}
