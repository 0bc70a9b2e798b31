use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bus::ExtensionBus;
use crate::error::{Denial, InterstitialError, InterstitialResult};
use crate::form::FormData;
use crate::traits::InterstitialStep;

/// Identifier of a stored account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the request came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOrigin {
    pub ip: String,
}

impl RequestOrigin {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

/// Session flags the pipeline may set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    /// Set once a confirmation email for a changed address was requested
    #[serde(rename = "emailChanged")]
    pub email_changed: bool,
}

/// Shared handle onto the acting session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    inner: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionState {
                id: id.into(),
                email_changed: false,
            })),
        }
    }

    /// Session with a freshly generated id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub async fn id(&self) -> String {
        self.inner.read().await.id.clone()
    }

    pub async fn email_changed(&self) -> bool {
        self.inner.read().await.email_changed
    }

    pub async fn mark_email_changed(&self) {
        self.inner.write().await.email_changed = true;
    }

    pub async fn snapshot(&self) -> SessionState {
        self.inner.read().await.clone()
    }
}

/// The authenticated request an interstitial callback acts on behalf of.
///
/// Captured by every [`Interstitial`] so its callback can run its own
/// privilege and password checks when the form comes back.
#[derive(Clone)]
pub struct RequestScope {
    /// Requesting account; `None` for a guest registering
    pub actor: Option<AccountId>,
    pub origin: RequestOrigin,
    pub session: SessionHandle,
    /// Hook registry for this deployment
    pub bus: Arc<ExtensionBus>,
}

impl RequestScope {
    pub fn new(
        actor: Option<AccountId>,
        origin: RequestOrigin,
        session: SessionHandle,
        bus: Arc<ExtensionBus>,
    ) -> Self {
        Self {
            actor,
            origin,
            session,
            bus,
        }
    }

    /// Is the requester acting on their own account?
    pub fn is_actor(&self, uid: AccountId) -> bool {
        self.actor == Some(uid)
    }
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("actor", &self.actor)
            .field("origin", &self.origin)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// The in-flight account record being created or edited.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftAccount {
    /// Present when editing an existing account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "updateEmail", default)]
    pub update_email: bool,
    #[serde(default)]
    pub gdpr_consent: bool,
    #[serde(rename = "acceptTos", default)]
    pub accepted_tos: bool,
    /// Remaining fields owned by the outer registration flow
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DraftAccount {
    /// Draft for a brand-new account.
    pub fn registration() -> Self {
        Self::default()
    }

    /// Draft editing an existing account.
    pub fn existing(uid: AccountId) -> Self {
        Self {
            uid: Some(uid),
            ..Self::default()
        }
    }

    pub fn with_update_email(mut self) -> Self {
        self.update_email = true;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Input to interstitial collection: one registration or edit transaction.
#[derive(Clone, Debug)]
pub struct RegistrationContext {
    pub request: RequestScope,
    pub draft: Option<DraftAccount>,
}

impl RegistrationContext {
    pub fn new(request: RequestScope, draft: DraftAccount) -> Self {
        Self {
            request,
            draft: Some(draft),
        }
    }

    /// Context without a draft; every step rejects it with `InvalidData`.
    pub fn without_draft(request: RequestScope) -> Self {
        Self {
            request,
            draft: None,
        }
    }

    pub fn draft(&self) -> InterstitialResult<&DraftAccount> {
        self.draft.as_ref().ok_or(InterstitialError::InvalidData)
    }
}

/// Result of a step callback that did not hard-fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Draft validated; continue with the next interstitial
    Accepted,
    /// Re-render this interstitial and ask again
    Denied(Denial),
}

impl StepOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StepOutcome::Accepted)
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            StepOutcome::Denied(d) => Some(d),
            StepOutcome::Accepted => None,
        }
    }
}

/// One unit of user interaction produced by a step.
#[derive(Clone)]
pub struct Interstitial {
    /// Template identifier the rendering layer resolves
    pub template: String,
    /// Data handed to the template
    pub data: serde_json::Value,
    step: Arc<dyn InterstitialStep>,
    request: RequestScope,
}

impl Interstitial {
    pub fn new(
        template: impl Into<String>,
        data: serde_json::Value,
        step: Arc<dyn InterstitialStep>,
        request: RequestScope,
    ) -> Self {
        Self {
            template: template.into(),
            data,
            step,
            request,
        }
    }

    /// Name of the step that produced this interstitial.
    pub fn step_name(&self) -> &str {
        self.step.name()
    }

    /// Run the step callback against the submitted form.
    ///
    /// May be invoked repeatedly with the same form; the callback repeats its
    /// own checks each time.
    pub async fn submit(
        &self,
        draft: &mut DraftAccount,
        form: &FormData,
    ) -> InterstitialResult<StepOutcome> {
        self.step.apply(&self.request, draft, form).await
    }
}

impl fmt::Debug for Interstitial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interstitial")
            .field("template", &self.template)
            .field("data", &self.data)
            .field("step", &self.step.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(actor: Option<AccountId>) -> RequestScope {
        RequestScope::new(
            actor,
            RequestOrigin::new("127.0.0.1"),
            SessionHandle::new("sess-1"),
            Arc::new(ExtensionBus::builder().build()),
        )
    }

    #[test]
    fn missing_draft_is_invalid_data() {
        let ctx = RegistrationContext::without_draft(scope(None));
        assert!(matches!(ctx.draft(), Err(InterstitialError::InvalidData)));
    }

    #[test]
    fn actor_identity() {
        let s = scope(Some(AccountId(7)));
        assert!(s.is_actor(AccountId(7)));
        assert!(!s.is_actor(AccountId(8)));
        assert!(!scope(None).is_actor(AccountId(7)));
    }

    #[test]
    fn draft_uses_wire_field_names() {
        let draft = DraftAccount::existing(AccountId(3))
            .with_update_email()
            .with_field("username", serde_json::json!("alice"));
        let value = serde_json::to_value(&draft).unwrap();
        assert_eq!(value["uid"], 3);
        assert_eq!(value["updateEmail"], true);
        assert_eq!(value["acceptTos"], false);
        assert_eq!(value["username"], "alice");

        let back: DraftAccount = serde_json::from_value(value).unwrap();
        assert_eq!(back, draft);
    }

    #[tokio::test]
    async fn session_flag_is_shared_between_clones() {
        let session = SessionHandle::new("abc");
        let clone = session.clone();
        clone.mark_email_changed().await;
        assert!(session.email_changed().await);
        assert_eq!(session.id().await, "abc");
    }
}
