use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{AccountId, DraftAccount, RegistrationContext, RequestScope, StepOutcome};
use crate::error::{InterstitialResult, StoreError};
use crate::form::FormData;

/// Permission that lets an actor administer other accounts.
pub const ADMIN_USERS: &str = "admin:users";

/// Stored account field names.
pub mod fields {
    pub const EMAIL: &str = "email";
    pub const EMAIL_CONFIRMED: &str = "email:confirmed";
    pub const GDPR_CONSENT: &str = "gdpr_consent";
    pub const ACCEPT_TOS: &str = "acceptTos";
}

/// Field-level access to stored account records.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_field(&self, uid: AccountId, field: &str) -> Result<Option<String>, StoreError>;

    /// Fetch several fields at once; absent fields are omitted from the map.
    async fn get_fields(
        &self,
        uid: AccountId,
        fields: &[&str],
    ) -> Result<HashMap<String, String>, StoreError>;

    async fn set_field(&self, uid: AccountId, field: &str, value: &str) -> Result<(), StoreError>;

    async fn has_password(&self, uid: AccountId) -> Result<bool, StoreError>;

    /// Check a candidate password; the origin ip feeds login-attempt tracking.
    async fn verify_password(
        &self,
        uid: AccountId,
        candidate: Option<&str>,
        origin_ip: &str,
    ) -> Result<bool, StoreError>;
}

/// Request to send an ownership confirmation email.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub email: String,
    /// Send even if a previous confirmation is still outstanding
    pub force: bool,
}

/// Email ownership and confirmation primitives.
#[async_trait]
pub trait EmailRegistry: Send + Sync {
    async fn is_validation_pending(&self, uid: AccountId) -> Result<bool, StoreError>;

    /// Has the resend interval elapsed since the last confirmation for this address?
    async fn can_send_validation(&self, uid: AccountId, email: &str) -> Result<bool, StoreError>;

    /// Is the address free (not bound to any account)?
    async fn available(&self, email: &str) -> Result<bool, StoreError>;

    /// Drop the account's email binding and revoke its sessions except `keep_session`.
    async fn remove(&self, uid: AccountId, keep_session: Option<&str>) -> Result<(), StoreError>;

    /// Mark the account's current email as confirmed.
    async fn confirm_by_uid(&self, uid: AccountId) -> Result<(), StoreError>;

    async fn send_validation_email(
        &self,
        uid: AccountId,
        request: ValidationRequest,
    ) -> Result<(), StoreError>;
}

/// Authorization checks.
#[async_trait]
pub trait PrivilegeService: Send + Sync {
    async fn can(&self, permission: &str, actor: Option<AccountId>) -> Result<bool, StoreError>;

    async fn can_edit(&self, actor: Option<AccountId>, target: AccountId) -> Result<bool, StoreError>;
}

/// A conditional step demanding extra input before an account mutation completes.
///
/// `applies` and `render` run while interstitials are collected; `apply` runs
/// when the user submits the step's form, possibly more than once.
#[async_trait]
pub trait InterstitialStep: Send + Sync {
    /// Human-readable step name
    fn name(&self) -> &str;

    /// Template identifier rendered for this step
    fn template(&self) -> &str;

    /// Does this step need user input for the given context?
    async fn applies(&self, context: &RegistrationContext) -> InterstitialResult<bool>;

    /// Data handed to the template.
    async fn render(&self, context: &RegistrationContext) -> InterstitialResult<serde_json::Value>;

    /// Validate the submission and mutate the draft.
    ///
    /// `Err` aborts the transaction; `Ok(StepOutcome::Denied)` asks for another attempt.
    async fn apply(
        &self,
        request: &RequestScope,
        draft: &mut DraftAccount,
        form: &FormData,
    ) -> InterstitialResult<StepOutcome>;
}
