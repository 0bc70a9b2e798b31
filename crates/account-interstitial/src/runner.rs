use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::collector;
use crate::context::{DraftAccount, Interstitial, RegistrationContext, StepOutcome};
use crate::error::{InterstitialError, InterstitialResult};
use crate::form::FormData;
use crate::settings::RunnerConfig;

/// What the user is being asked for.
#[derive(Debug)]
pub struct Prompt<'a> {
    pub interstitial: &'a Interstitial,
    /// 1-based attempt number for this interstitial
    pub attempt: u32,
    /// Translation key of the previous soft failure, if any
    pub error: Option<String>,
}

/// Supplies form submissions for rendered interstitials.
#[async_trait]
pub trait FormResponder: Send + Sync {
    async fn respond(&self, prompt: &Prompt<'_>) -> InterstitialResult<FormData>;
}

/// Completed pipeline: the draft to commit and how many attempts each step took.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOutcome {
    pub draft: DraftAccount,
    pub attempts: Vec<(String, u32)>,
}

/// Reference runner: submits each interstitial in order against a working
/// copy of the draft.
///
/// The caller's draft is never touched; it receives the final draft only
/// when every interstitial accepted. Soft denials re-prompt the same step
/// up to `max_attempts`; hard failures abort immediately.
pub struct PipelineRunner {
    max_attempts: u32,
}

impl PipelineRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Collect interstitials for the context, then run them.
    pub async fn run_context(
        &self,
        context: &RegistrationContext,
        responder: &dyn FormResponder,
    ) -> InterstitialResult<PipelineOutcome> {
        let interstitials = collector::collect(context).await?;
        self.run(&interstitials, context.draft()?, responder).await
    }

    pub async fn run(
        &self,
        interstitials: &[Interstitial],
        draft: &DraftAccount,
        responder: &dyn FormResponder,
    ) -> InterstitialResult<PipelineOutcome> {
        let mut working = draft.clone();
        let mut attempts = Vec::with_capacity(interstitials.len());

        for interstitial in interstitials {
            let used = self.run_step(interstitial, &mut working, responder).await?;
            attempts.push((interstitial.step_name().to_string(), used));
        }

        info!(
            uid = ?working.uid,
            steps = attempts.len(),
            "Interstitial pipeline completed"
        );
        Ok(PipelineOutcome {
            draft: working,
            attempts,
        })
    }

    async fn run_step(
        &self,
        interstitial: &Interstitial,
        working: &mut DraftAccount,
        responder: &dyn FormResponder,
    ) -> InterstitialResult<u32> {
        let mut error = None;

        for attempt in 1..=self.max_attempts {
            debug!(
                step = interstitial.step_name(),
                template = %interstitial.template,
                attempt,
                "Prompting"
            );
            let form = responder
                .respond(&Prompt {
                    interstitial,
                    attempt,
                    error: error.take(),
                })
                .await?;

            match interstitial.submit(working, &form).await {
                Ok(StepOutcome::Accepted) => return Ok(attempt),
                Ok(StepOutcome::Denied(denial)) => {
                    warn!(
                        step = interstitial.step_name(),
                        attempt,
                        code = denial.code(),
                        "Step denied, re-prompting"
                    );
                    if attempt == self.max_attempts {
                        return Err(InterstitialError::Denied {
                            step: interstitial.step_name().to_string(),
                            denial,
                        });
                    }
                    error = Some(denial.translation_key());
                }
                Err(e) => {
                    warn!(
                        step = interstitial.step_name(),
                        code = e.code(),
                        error = %e,
                        "Step failed, abandoning pipeline"
                    );
                    return Err(e);
                }
            }
        }

        // max_attempts >= 1, so the loop always returns.
        Err(InterstitialError::InvalidData)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::AccountId;
    use crate::error::Denial;
    use crate::mocks::{Harness, ScriptedResponder, StaticPrivileges};
    use crate::settings::InterstitialSettings;
    use crate::steps::{consent, email, terms};

    fn harness() -> Harness {
        Harness::new(
            InterstitialSettings {
                terms_of_use: "Be kind".into(),
                require_email_address: true,
                ..Default::default()
            },
            StaticPrivileges::new(),
        )
    }

    fn registration(h: &Harness) -> RegistrationContext {
        RegistrationContext::new(
            h.scope(None, Arc::new(h.bus().build())),
            DraftAccount::registration().with_update_email(),
        )
    }

    #[tokio::test]
    async fn completes_after_consent_retry() {
        let h = harness();
        let ctx = registration(&h);
        let responder = ScriptedResponder::new()
            .answer(email::TEMPLATE, FormData::new().with("email", "a@example.com"))
            .answer(consent::TEMPLATE, FormData::new().with(consent::AGREE_DATA, "on"))
            .answer(
                consent::TEMPLATE,
                FormData::new()
                    .with(consent::AGREE_DATA, "on")
                    .with(consent::AGREE_EMAIL, "on"),
            )
            .answer(terms::TEMPLATE, FormData::new().with(terms::AGREE_TERMS, "on"));

        let runner = PipelineRunner::new(&RunnerConfig::default());
        let outcome = runner.run_context(&ctx, &responder).await.unwrap();

        assert_eq!(outcome.draft.email.as_deref(), Some("a@example.com"));
        assert!(outcome.draft.gdpr_consent);
        assert!(outcome.draft.accepted_tos);
        assert!(!outcome.draft.update_email);
        assert_eq!(
            outcome.attempts,
            vec![
                ("email-update".to_string(), 1),
                ("consent".to_string(), 2),
                ("terms-of-use".to_string(), 1)
            ]
        );

        let prompts = responder.prompts();
        assert_eq!(prompts[2].error.as_deref(), Some("[[register:gdpr_consent_denied]]"));
    }

    #[tokio::test]
    async fn exhausted_retries_abort_without_touching_draft() {
        let h = harness();
        let ctx = registration(&h);
        let responder = ScriptedResponder::new()
            .answer(email::TEMPLATE, FormData::new().with("email", "a@example.com"));

        let runner = PipelineRunner::new(&RunnerConfig { max_attempts: 2 });
        let err = runner.run_context(&ctx, &responder).await.unwrap_err();
        match err {
            InterstitialError::Denied { step, denial } => {
                assert_eq!(step, "consent");
                assert_eq!(denial, Denial::ConsentDenied);
            }
            other => panic!("unexpected {other:?}"),
        }
        let original = ctx.draft().unwrap();
        assert!(original.update_email);
        assert_eq!(original.email, None);
    }

    #[tokio::test]
    async fn hard_failure_stops_before_later_steps() {
        let h = harness();
        let ctx = registration(&h);
        let responder = ScriptedResponder::new();

        let runner = PipelineRunner::new(&RunnerConfig::default());
        let err = runner.run_context(&ctx, &responder).await.unwrap_err();
        assert!(matches!(err, InterstitialError::InvalidEmail));
        assert_eq!(responder.prompts().len(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_prompts_once() {
        let h = harness();
        h.accounts.insert_account(AccountId(3), None, false, None).await;
        let ctx = RegistrationContext::new(
            h.scope(Some(AccountId(3)), Arc::new(h.bus().build())),
            DraftAccount::existing(AccountId(3)),
        );
        let responder = ScriptedResponder::new();
        let runner = PipelineRunner::new(&RunnerConfig { max_attempts: 0 });
        let err = runner.run_context(&ctx, &responder).await.unwrap_err();
        assert!(matches!(err, InterstitialError::Denied { .. }));
        assert_eq!(responder.prompts().len(), 1);
    }
}
