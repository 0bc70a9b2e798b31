//! In-memory collaborators for tests and local wiring.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::bus::{
    ContentFilter, EmailMutation, EmailMutationFilter, ExtensionBus, ExtensionBusBuilder,
    PostContent,
};
use crate::clock::{Clock, ManualClock, RecordingSleeper, SystemClock};
use crate::context::{AccountId, RequestOrigin, RequestScope, SessionHandle};
use crate::error::{InterstitialResult, StoreError};
use crate::form::FormData;
use crate::runner::{FormResponder, Prompt};
use crate::settings::InterstitialSettings;
use crate::steps::StepServices;
use crate::supervisor::TaskSupervisor;
use crate::traits::{
    fields, AccountStore, EmailRegistry, PrivilegeService, ValidationRequest, ADMIN_USERS,
};

/// Confirmation email recorded by [`InMemoryAccounts`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentValidation {
    pub uid: AccountId,
    pub email: String,
    pub force: bool,
    pub at: DateTime<Utc>,
}

/// Email binding dropped through [`EmailRegistry::remove`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailRemoval {
    pub uid: AccountId,
    pub kept_session: Option<String>,
}

#[derive(Clone, Debug)]
struct PendingValidation {
    email: String,
    sent_at: DateTime<Utc>,
}

#[derive(Default)]
struct AccountsState {
    records: HashMap<AccountId, HashMap<String, String>>,
    passwords: HashMap<AccountId, String>,
    pending: HashMap<AccountId, PendingValidation>,
    outbox: Vec<SentValidation>,
    removals: Vec<EmailRemoval>,
    failed_logins: Vec<(AccountId, String)>,
}

/// Account store and email registry backed by hash maps.
///
/// An address counts as taken while any account holds it as a confirmed
/// email. Confirmation resends are limited per address by `confirm_interval`,
/// measured on the system clock unless another is supplied with
/// [`InMemoryAccounts::with_clock`].
pub struct InMemoryAccounts {
    state: RwLock<AccountsState>,
    clock: Arc<dyn Clock>,
    confirm_interval: Duration,
    fail_delivery: AtomicBool,
}

impl InMemoryAccounts {
    /// Store measuring resend intervals on the system clock.
    pub fn new(confirm_interval: Duration) -> Self {
        Self {
            state: RwLock::new(AccountsState::default()),
            clock: Arc::new(SystemClock),
            confirm_interval,
            fail_delivery: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create or overwrite an account record.
    pub async fn insert_account(
        &self,
        uid: AccountId,
        email: Option<&str>,
        confirmed: bool,
        password: Option<&str>,
    ) {
        let mut state = self.state.write().await;
        let mut record = HashMap::new();
        if let Some(email) = email {
            record.insert(fields::EMAIL.to_string(), email.to_string());
            record.insert(
                fields::EMAIL_CONFIRMED.to_string(),
                if confirmed { "1" } else { "0" }.to_string(),
            );
        }
        state.records.insert(uid, record);
        match password {
            Some(pw) => state.passwords.insert(uid, pw.to_string()),
            None => state.passwords.remove(&uid),
        };
    }

    /// Write a field without any existence check.
    pub async fn set_raw_field(&self, uid: AccountId, field: &str, value: &str) {
        self.state
            .write()
            .await
            .records
            .entry(uid)
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub async fn field(&self, uid: AccountId, field: &str) -> Option<String> {
        self.state
            .read()
            .await
            .records
            .get(&uid)
            .and_then(|r| r.get(field).cloned())
    }

    pub async fn outbox(&self) -> Vec<SentValidation> {
        self.state.read().await.outbox.clone()
    }

    pub async fn removals(&self) -> Vec<EmailRemoval> {
        self.state.read().await.removals.clone()
    }

    /// Failed password checks as `(uid, origin ip)`.
    pub async fn failed_logins(&self) -> Vec<(AccountId, String)> {
        self.state.read().await.failed_logins.clone()
    }

    /// Make every subsequent confirmation send fail.
    pub fn set_delivery_failure(&self, fail: bool) {
        self.fail_delivery.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for InMemoryAccounts {
    async fn get_field(&self, uid: AccountId, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.field(uid, field).await)
    }

    async fn get_fields(
        &self,
        uid: AccountId,
        names: &[&str],
    ) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.read().await;
        let Some(record) = state.records.get(&uid) else {
            return Ok(HashMap::new());
        };
        Ok(names
            .iter()
            .filter_map(|name| record.get(*name).map(|v| (name.to_string(), v.clone())))
            .collect())
    }

    async fn set_field(&self, uid: AccountId, field: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state.records.get_mut(&uid).ok_or(StoreError::NotFound(uid))?;
        record.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn has_password(&self, uid: AccountId) -> Result<bool, StoreError> {
        Ok(self.state.read().await.passwords.contains_key(&uid))
    }

    async fn verify_password(
        &self,
        uid: AccountId,
        candidate: Option<&str>,
        origin_ip: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let ok = matches!(
            (state.passwords.get(&uid), candidate),
            (Some(stored), Some(given)) if stored == given
        );
        if !ok {
            state.failed_logins.push((uid, origin_ip.to_string()));
        }
        Ok(ok)
    }
}

#[async_trait]
impl EmailRegistry for InMemoryAccounts {
    async fn is_validation_pending(&self, uid: AccountId) -> Result<bool, StoreError> {
        Ok(self.state.read().await.pending.contains_key(&uid))
    }

    async fn can_send_validation(&self, uid: AccountId, email: &str) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        let Some(pending) = state.pending.get(&uid) else {
            return Ok(true);
        };
        if !pending.email.eq_ignore_ascii_case(email) {
            return Ok(true);
        }
        let elapsed = (self.clock.now() - pending.sent_at).to_std();
        Ok(elapsed.map(|e| e >= self.confirm_interval).unwrap_or(false))
    }

    async fn available(&self, email: &str) -> Result<bool, StoreError> {
        let state = self.state.read().await;
        let taken = state.records.values().any(|record| {
            let bound = record
                .get(fields::EMAIL)
                .is_some_and(|e| e.eq_ignore_ascii_case(email));
            let confirmed = record
                .get(fields::EMAIL_CONFIRMED)
                .is_some_and(|c| c == "1");
            bound && confirmed
        });
        Ok(!taken)
    }

    async fn remove(&self, uid: AccountId, keep_session: Option<&str>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state.records.get_mut(&uid).ok_or(StoreError::NotFound(uid))?;
        record.remove(fields::EMAIL);
        record.remove(fields::EMAIL_CONFIRMED);
        state.pending.remove(&uid);
        state.removals.push(EmailRemoval {
            uid,
            kept_session: keep_session.map(str::to_string),
        });
        Ok(())
    }

    async fn confirm_by_uid(&self, uid: AccountId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state.records.get_mut(&uid).ok_or(StoreError::NotFound(uid))?;
        if !record.contains_key(fields::EMAIL) {
            return Err(StoreError::Backend(format!("account {uid} has no email to confirm")));
        }
        record.insert(fields::EMAIL_CONFIRMED.to_string(), "1".to_string());
        state.pending.remove(&uid);
        Ok(())
    }

    async fn send_validation_email(
        &self,
        uid: AccountId,
        request: ValidationRequest,
    ) -> Result<(), StoreError> {
        if self.fail_delivery.load(Ordering::SeqCst) {
            return Err(StoreError::Delivery(format!("no route to {}", request.email)));
        }
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if !state.records.contains_key(&uid) {
            return Err(StoreError::NotFound(uid));
        }
        state.pending.insert(
            uid,
            PendingValidation {
                email: request.email.clone(),
                sent_at: now,
            },
        );
        state.outbox.push(SentValidation {
            uid,
            email: request.email,
            force: request.force,
            at: now,
        });
        Ok(())
    }
}

/// Fixed permission table.
#[derive(Debug, Default)]
pub struct StaticPrivileges {
    permissions: HashMap<AccountId, HashSet<String>>,
    edit_grants: HashSet<(AccountId, AccountId)>,
}

impl StaticPrivileges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `admin:users` to `uid`.
    pub fn admin(self, uid: AccountId) -> Self {
        self.grant(uid, ADMIN_USERS)
    }

    pub fn grant(mut self, uid: AccountId, permission: &str) -> Self {
        self.permissions
            .entry(uid)
            .or_default()
            .insert(permission.to_string());
        self
    }

    /// Let `actor` edit `target` without being an administrator.
    pub fn grant_edit(mut self, actor: AccountId, target: AccountId) -> Self {
        self.edit_grants.insert((actor, target));
        self
    }

    fn holds(&self, uid: AccountId, permission: &str) -> bool {
        self.permissions
            .get(&uid)
            .is_some_and(|p| p.contains(permission))
    }
}

#[async_trait]
impl PrivilegeService for StaticPrivileges {
    async fn can(&self, permission: &str, actor: Option<AccountId>) -> Result<bool, StoreError> {
        Ok(actor.is_some_and(|uid| self.holds(uid, permission)))
    }

    async fn can_edit(&self, actor: Option<AccountId>, target: AccountId) -> Result<bool, StoreError> {
        let Some(actor) = actor else {
            return Ok(false);
        };
        Ok(actor == target
            || self.holds(actor, ADMIN_USERS)
            || self.edit_grants.contains(&(actor, target)))
    }
}

/// `user.saveEmail` handler that either vetoes everything or changes nothing.
#[derive(Debug, Clone)]
pub struct StaticEmailFilter {
    deny: Option<String>,
}

impl StaticEmailFilter {
    pub fn deny(code: impl Into<String>) -> Self {
        Self {
            deny: Some(code.into()),
        }
    }

    pub fn pass_through() -> Self {
        Self { deny: None }
    }
}

#[async_trait]
impl EmailMutationFilter for StaticEmailFilter {
    async fn filter(&self, mut mutation: EmailMutation) -> InterstitialResult<EmailMutation> {
        if let Some(code) = &self.deny {
            mutation.allowed = false;
            mutation.error = code.clone();
        }
        Ok(mutation)
    }
}

/// `parse.post` handler wrapping content in a paragraph.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParagraphFilter;

#[async_trait]
impl ContentFilter for ParagraphFilter {
    async fn filter(&self, post: PostContent) -> InterstitialResult<PostContent> {
        Ok(PostContent {
            content: format!("<p>{}</p>", post.content),
        })
    }
}

/// What a [`ScriptedResponder`] was asked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedPrompt {
    pub template: String,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Answers prompts from per-template queues; an exhausted queue yields an
/// empty form.
#[derive(Debug, Default)]
pub struct ScriptedResponder {
    answers: Mutex<HashMap<String, VecDeque<FormData>>>,
    prompts: Mutex<Vec<RecordedPrompt>>,
}

impl ScriptedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `form` as the next answer for `template`.
    pub fn answer(self, template: &str, form: FormData) -> Self {
        if let Ok(mut answers) = self.answers.lock() {
            answers.entry(template.to_string()).or_default().push_back(form);
        }
        self
    }

    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FormResponder for ScriptedResponder {
    async fn respond(&self, prompt: &Prompt<'_>) -> InterstitialResult<FormData> {
        let template = prompt.interstitial.template.clone();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(RecordedPrompt {
                template: template.clone(),
                attempt: prompt.attempt,
                error: prompt.error.clone(),
            });
        }
        let next = self
            .answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.get_mut(&template).and_then(VecDeque::pop_front));
        Ok(next.unwrap_or_default())
    }
}

/// Wired-up collaborators with a manual clock and a recording sleeper.
pub struct Harness {
    pub accounts: Arc<InMemoryAccounts>,
    pub privileges: Arc<StaticPrivileges>,
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<RecordingSleeper>,
    pub supervisor: TaskSupervisor,
    pub settings: Arc<InterstitialSettings>,
}

impl Harness {
    pub fn new(settings: InterstitialSettings, privileges: StaticPrivileges) -> Self {
        let start = DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default();
        let clock = Arc::new(ManualClock::new(start));
        let accounts = Arc::new(
            InMemoryAccounts::new(settings.email_confirm_interval()).with_clock(clock.clone()),
        );
        Self {
            accounts,
            privileges: Arc::new(privileges),
            clock,
            sleeper: Arc::new(RecordingSleeper::new()),
            supervisor: TaskSupervisor::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn services(&self) -> StepServices {
        StepServices::new(
            self.accounts.clone(),
            self.accounts.clone(),
            self.privileges.clone(),
            self.settings.clone(),
        )
        .with_sleeper(self.sleeper.clone())
        .with_supervisor(self.supervisor.clone())
    }

    /// Bus builder with the built-in steps already registered.
    pub fn bus(&self) -> ExtensionBusBuilder {
        ExtensionBus::builder().with_builtin_steps(self.services())
    }

    /// Request from `actor` with a fresh session.
    pub fn scope(&self, actor: Option<AccountId>, bus: Arc<ExtensionBus>) -> RequestScope {
        RequestScope::new(
            actor,
            RequestOrigin::new("10.0.0.1"),
            SessionHandle::generate(),
            bus,
        )
    }
}
