use tracing::{debug, info};

use crate::context::{Interstitial, RegistrationContext};
use crate::error::InterstitialResult;

/// Gather the interstitials that apply to this request, in provider order.
///
/// Fires `register.interstitial` on the request's bus with an empty
/// accumulator. Applicability is each provider's own decision; the collector
/// never drops a contribution.
pub async fn collect(context: &RegistrationContext) -> InterstitialResult<Vec<Interstitial>> {
    let bus = &context.request.bus;
    debug!(
        actor = ?context.request.actor,
        providers = ?bus.provider_names(),
        "Collecting interstitials"
    );

    let interstitials = bus.fire_register_interstitial(context).await?;

    info!(
        actor = ?context.request.actor,
        count = interstitials.len(),
        templates = ?interstitials.iter().map(|i| i.template.as_str()).collect::<Vec<_>>(),
        "Interstitials collected"
    );
    Ok(interstitials)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::bus::InterstitialProvider;
    use crate::context::{AccountId, DraftAccount, RequestScope, StepOutcome};
    use crate::error::{InterstitialError, InterstitialResult};
    use crate::form::FormData;
    use crate::mocks::{Harness, StaticPrivileges};
    use crate::settings::InterstitialSettings;
    use crate::steps::{consent, email, terms};
    use crate::traits::InterstitialStep;

    /// Plugin step that always asks for a nickname.
    struct NicknameStep;

    #[async_trait]
    impl InterstitialStep for NicknameStep {
        fn name(&self) -> &str {
            "nickname"
        }

        fn template(&self) -> &str {
            "plugins/nickname"
        }

        async fn applies(&self, _context: &RegistrationContext) -> InterstitialResult<bool> {
            Ok(true)
        }

        async fn render(&self, _context: &RegistrationContext) -> InterstitialResult<serde_json::Value> {
            Ok(serde_json::json!({ "placeholder": "nick" }))
        }

        async fn apply(
            &self,
            _request: &RequestScope,
            draft: &mut DraftAccount,
            form: &FormData,
        ) -> InterstitialResult<StepOutcome> {
            let nick = form.get_trimmed("nickname").ok_or(InterstitialError::InvalidData)?;
            draft.extra.insert("nickname".into(), serde_json::json!(nick));
            Ok(StepOutcome::Accepted)
        }
    }

    /// Provider contributing nothing, but failing when asked to.
    struct Failing;

    #[async_trait]
    impl InterstitialProvider for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn contribute(
            &self,
            _context: &RegistrationContext,
            _interstitials: Vec<crate::context::Interstitial>,
        ) -> InterstitialResult<Vec<crate::context::Interstitial>> {
            Err(InterstitialError::NoPrivileges)
        }
    }

    fn harness() -> Harness {
        Harness::new(
            InterstitialSettings {
                terms_of_use: "Be kind".into(),
                ..Default::default()
            },
            StaticPrivileges::new(),
        )
    }

    #[tokio::test]
    async fn builtin_steps_collected_in_registration_order() {
        let h = harness();
        let bus = Arc::new(
            h.bus()
                .step(Arc::new(NicknameStep))
                .build(),
        );
        assert_eq!(
            bus.provider_names(),
            vec!["email-update", "consent", "terms-of-use", "nickname"]
        );

        let ctx = RegistrationContext::new(
            h.scope(None, bus),
            DraftAccount::registration().with_update_email(),
        );
        let collected = collect(&ctx).await.unwrap();
        let templates: Vec<_> = collected.iter().map(|i| i.template.as_str()).collect();
        assert_eq!(
            templates,
            vec![
                email::TEMPLATE,
                consent::TEMPLATE,
                terms::TEMPLATE,
                "plugins/nickname"
            ]
        );
        assert_eq!(collected[3].step_name(), "nickname");
    }

    #[tokio::test]
    async fn satisfied_steps_contribute_nothing() {
        let h = harness();
        let bus = Arc::new(h.bus().build());
        let mut draft = DraftAccount::registration();
        draft.gdpr_consent = true;
        draft.accepted_tos = true;

        let ctx = RegistrationContext::new(h.scope(None, bus), draft);
        assert!(collect(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_aborts_collection() {
        let h = harness();
        let bus = Arc::new(h.bus().interstitial(Arc::new(Failing)).build());
        let ctx = RegistrationContext::new(
            h.scope(Some(AccountId(1)), bus),
            DraftAccount::registration(),
        );
        assert!(matches!(
            collect(&ctx).await,
            Err(InterstitialError::NoPrivileges)
        ));
    }

    #[tokio::test]
    async fn missing_draft_fails_collection() {
        let h = harness();
        let bus = Arc::new(h.bus().build());
        let ctx = RegistrationContext::without_draft(h.scope(None, bus));
        assert!(matches!(
            collect(&ctx).await,
            Err(InterstitialError::InvalidData)
        ));
    }
}
