pub mod consent;
pub mod email;
pub mod terms;

pub use consent::ConsentStep;
pub use email::EmailUpdateStep;
pub use terms::TermsOfUseStep;

use std::sync::Arc;

use crate::clock::{Sleeper, TokioSleeper};
use crate::settings::InterstitialSettings;
use crate::supervisor::TaskSupervisor;
use crate::traits::{AccountStore, EmailRegistry, PrivilegeService};

/// Collaborators shared by the built-in steps.
#[derive(Clone)]
pub struct StepServices {
    pub accounts: Arc<dyn AccountStore>,
    pub emails: Arc<dyn EmailRegistry>,
    pub privileges: Arc<dyn PrivilegeService>,
    pub settings: Arc<InterstitialSettings>,
    /// Delay used by the password-failure throttle
    pub sleeper: Arc<dyn Sleeper>,
    /// Owner of fire-and-forget confirmation sends
    pub supervisor: TaskSupervisor,
}

impl StepServices {
    /// Services with the production sleeper and a fresh supervisor.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        emails: Arc<dyn EmailRegistry>,
        privileges: Arc<dyn PrivilegeService>,
        settings: Arc<InterstitialSettings>,
    ) -> Self {
        Self {
            accounts,
            emails,
            privileges,
            settings,
            sleeper: Arc::new(TokioSleeper),
            supervisor: TaskSupervisor::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_supervisor(mut self, supervisor: TaskSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }
}

/// Stored flags are truthy when they parse to a non-zero integer.
pub(crate) fn stored_flag_set(value: Option<&str>) -> bool {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v != 0)
        .unwrap_or(false)
}
