//! Email update interstitial.
//!
//! Applies whenever the draft carries `updateEmail`. For a new account the
//! submitted address is only staged on the draft; the outer registration
//! flow sends the confirmation once the account exists. For an existing
//! account the callback re-checks privileges and the password challenge on
//! every submission, then either:
//!
//! - replaces and pre-confirms the address (administrator editing someone else),
//! - requests a confirmation email for the new address (owner or delegated editor),
//! - or clears the address when an empty value is submitted.
//!
//! A failed password challenge by a non-administrator is answered only after
//! a fixed delay, whatever the final outcome of the submission.
//!
//! Clearing the address is intentionally hardened beyond the password
//! check: an actor who is neither an administrator nor allowed to edit the
//! account gets `NoPrivileges` instead of a silent no-op. A required address
//! still reports `InvalidEmail` first.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::EmailMutation;
use crate::context::{AccountId, DraftAccount, RegistrationContext, RequestScope, StepOutcome};
use crate::error::{InterstitialError, InterstitialResult};
use crate::form::FormData;
use crate::steps::{stored_flag_set, StepServices};
use crate::traits::{fields, InterstitialStep, ValidationRequest, ADMIN_USERS};

pub const TEMPLATE: &str = "partials/email_update";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(([^<>()\[\]\\.,;:\s@"]+(\.[^<>()\[\]\\.,;:\s@"]+)*)|(".+"))@((\[[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\])|(([a-zA-Z\-0-9]+\.)+[a-zA-Z]{2,}))$"#,
    )
    .expect("email pattern is valid")
});

/// Format check applied to submitted addresses.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Template data for the email form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailUpdateView {
    /// Current address, only when editing an existing account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub require_email_address: bool,
    pub issue_password_challenge: bool,
    pub has_pending: bool,
}

pub struct EmailUpdateStep {
    services: StepServices,
}

impl EmailUpdateStep {
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }

    fn interval_minutes(&self) -> u64 {
        self.services.settings.email_confirm_interval_minutes
    }

    fn veto(&self, mutation: &EmailMutation) -> InterstitialError {
        InterstitialError::from_code(&mutation.error, self.interval_minutes())
    }

    /// Build the view for the current request.
    pub async fn view(&self, context: &RegistrationContext) -> InterstitialResult<EmailUpdateView> {
        let draft = context.draft()?;
        let actor = context.request.actor;
        let privileges = &self.services.privileges;

        let (is_admin, has_password, has_pending, email) = match draft.uid {
            Some(uid) => {
                let (is_admin, has_password, has_pending, email) = tokio::join!(
                    privileges.can(ADMIN_USERS, actor),
                    self.services.accounts.has_password(uid),
                    self.services.emails.is_validation_pending(uid),
                    self.services.accounts.get_field(uid, fields::EMAIL),
                );
                (is_admin?, has_password?, has_pending?, email?)
            }
            None => (privileges.can(ADMIN_USERS, actor).await?, false, false, None),
        };

        let editing_self = draft.uid.is_some() && draft.uid == actor;
        Ok(EmailUpdateView {
            email: email.filter(|e| !e.is_empty()),
            require_email_address: self.services.settings.require_email_address,
            issue_password_challenge: has_password && (editing_self || !is_admin),
            has_pending,
        })
    }

    async fn apply_existing(
        &self,
        request: &RequestScope,
        uid: AccountId,
        email: Option<String>,
        password: Option<&str>,
    ) -> InterstitialResult<()> {
        let actor = request.actor;
        let is_self = request.is_actor(uid);
        let accounts = &self.services.accounts;
        let emails = &self.services.emails;
        let privileges = &self.services.privileges;

        let (is_admin, has_password, password_ok, can_edit, stored, verdict) = tokio::join!(
            privileges.can(ADMIN_USERS, actor),
            accounts.has_password(uid),
            accounts.verify_password(uid, password, &request.origin.ip),
            privileges.can_edit(actor, uid),
            accounts.get_fields(uid, &[fields::EMAIL, fields::EMAIL_CONFIRMED]),
            request.bus.fire_save_email(EmailMutation::for_account(uid, email.clone())),
        );
        let (is_admin, has_password, password_ok, can_edit, stored, verdict) = (
            is_admin?,
            has_password?,
            password_ok?,
            can_edit?,
            stored?,
            verdict?,
        );

        if !is_admin && !password_ok {
            warn!(uid = %uid, "Password challenge failed, throttling response");
            self.services
                .sleeper
                .sleep(self.services.settings.password_failure_delay())
                .await;
        }

        let current = stored
            .get(fields::EMAIL)
            .filter(|e| !e.is_empty())
            .cloned();
        let confirmed = stored_flag_set(stored.get(fields::EMAIL_CONFIRMED).map(String::as_str));

        let Some(email) = email else {
            if self.services.settings.require_email_address {
                return Err(InterstitialError::InvalidEmail);
            }
            if !is_admin && !can_edit {
                return Err(InterstitialError::NoPrivileges);
            }
            if current.is_some() && (!has_password || password_ok || is_admin) {
                let keep_session = if is_self {
                    Some(request.session.id().await)
                } else {
                    None
                };
                emails.remove(uid, keep_session.as_deref()).await?;
                info!(uid = %uid, "Account email cleared");
            }
            return Ok(());
        };

        if !is_admin && !can_edit {
            return Err(InterstitialError::NoPrivileges);
        }
        if !verdict.allowed || !is_valid_email(&email) {
            return Err(self.veto(&verdict));
        }

        if current.as_deref() == Some(email.as_str()) {
            if confirmed {
                return Err(InterstitialError::EmailNoChange);
            }
            if !emails.can_send_validation(uid, &email).await? {
                return Err(InterstitialError::ConfirmEmailAlreadySent {
                    interval_minutes: self.interval_minutes(),
                });
            }
        }

        if is_admin && !is_self {
            if !emails.available(&email).await? {
                return Err(InterstitialError::EmailTaken);
            }
            emails.remove(uid, None).await?;
            accounts.set_field(uid, fields::EMAIL, &email).await?;
            emails.confirm_by_uid(uid).await?;
            info!(uid = %uid, actor = ?actor, "Administrator replaced account email");
        } else {
            if has_password && !password_ok {
                return Err(InterstitialError::InvalidPassword);
            }
            let registry = emails.clone();
            let validation = ValidationRequest {
                email,
                force: true,
            };
            self.services
                .supervisor
                .spawn("send-validation-email", async move {
                    registry.send_validation_email(uid, validation).await
                });
            request.session.mark_email_changed().await;
            info!(uid = %uid, "Confirmation requested for new account email");
        }

        Ok(())
    }

    async fn stage_registration(
        &self,
        request: &RequestScope,
        email: Option<String>,
    ) -> InterstitialResult<Option<String>> {
        let verdict = request
            .bus
            .fire_save_email(EmailMutation::for_registration(email.clone()))
            .await?;

        if !verdict.allowed || (self.services.settings.require_email_address && email.is_none()) {
            return Err(self.veto(&verdict));
        }
        Ok(email)
    }
}

#[async_trait]
impl InterstitialStep for EmailUpdateStep {
    fn name(&self) -> &str {
        "email-update"
    }

    fn template(&self) -> &str {
        TEMPLATE
    }

    async fn applies(&self, context: &RegistrationContext) -> InterstitialResult<bool> {
        Ok(context.draft()?.update_email)
    }

    async fn render(&self, context: &RegistrationContext) -> InterstitialResult<serde_json::Value> {
        let view = self.view(context).await?;
        serde_json::to_value(view).map_err(|e| InterstitialError::Hook {
            hook: TEMPLATE.to_string(),
            reason: e.to_string(),
        })
    }

    async fn apply(
        &self,
        request: &RequestScope,
        draft: &mut DraftAccount,
        form: &FormData,
    ) -> InterstitialResult<StepOutcome> {
        let email = form.get_trimmed("email").map(str::to_string);
        debug!(uid = ?draft.uid, actor = ?request.actor, "Applying email update");

        match draft.uid {
            Some(uid) => {
                self.apply_existing(request, uid, email, form.get("password"))
                    .await?
            }
            None => draft.email = self.stage_registration(request, email).await?,
        }

        draft.update_email = false;
        Ok(StepOutcome::Accepted)
    }
}
