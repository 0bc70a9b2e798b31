//! Registration interstitials: conditional steps that must be satisfied
//! before an account is created or its email changed.
//!
//! A request carries a [`RegistrationContext`]: the acting session plus the
//! draft account. [`collector::collect`] fires the `register.interstitial`
//! hook on the request's [`ExtensionBus`]; every registered provider may
//! append an [`Interstitial`] (a template, its data and a submit callback).
//! The outer flow renders each one, submits the user's form back through
//! [`Interstitial::submit`], and commits the draft only once all of them
//! accepted.
//!
//! ## Built-in steps
//!
//! 1. **Email update** ([`EmailUpdateStep`]): stage, change, or clear the
//!    account email with privilege and password checks
//! 2. **Consent** ([`ConsentStep`]): data-processing and email consent
//! 3. **Terms of use** ([`TermsOfUseStep`]): acceptance of the deployment terms
//!
//! Plugins add their own steps through [`ExtensionBusBuilder::step`] or raw
//! providers through [`ExtensionBusBuilder::interstitial`].
//!
//! ## Failure model
//!
//! - `Err(InterstitialError)` from a callback aborts the transaction.
//! - `Ok(StepOutcome::Denied)` re-renders the same interstitial.
//! - Confirmation emails are sent in the background by a [`TaskSupervisor`];
//!   their failures are logged, never reported to the request.

pub mod bus;
pub mod clock;
pub mod collector;
pub mod context;
pub mod error;
pub mod form;
pub mod mocks;
pub mod runner;
pub mod settings;
pub mod steps;
pub mod supervisor;
pub mod telemetry;
pub mod traits;

pub use bus::{
    ContentFilter, EmailMutation, EmailMutationFilter, ExtensionBus, ExtensionBusBuilder,
    InterstitialProvider, PostContent, StepProvider,
};
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use collector::collect;
pub use context::{
    AccountId, DraftAccount, Interstitial, RegistrationContext, RequestOrigin, RequestScope,
    SessionHandle, SessionState, StepOutcome,
};
pub use error::{Denial, InterstitialError, InterstitialResult, StoreError};
pub use form::FormData;
pub use mocks::{InMemoryAccounts, StaticPrivileges};
pub use runner::{FormResponder, PipelineOutcome, PipelineRunner, Prompt};
pub use settings::{InterstitialSettings, LoggingConfig, RunnerConfig};
pub use steps::{ConsentStep, EmailUpdateStep, StepServices, TermsOfUseStep};
pub use supervisor::{DrainReport, TaskSupervisor};
pub use traits::{
    AccountStore, EmailRegistry, InterstitialStep, PrivilegeService, ValidationRequest,
};
