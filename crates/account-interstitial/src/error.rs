use thiserror::Error;

use crate::context::AccountId;

/// Hard failures raised by interstitial steps.
///
/// Any of these aborts the whole registration or edit transaction. The
/// caller surfaces a user-facing message keyed by [`InterstitialError::code`].
#[derive(Error, Debug)]
pub enum InterstitialError {
    #[error("registration data missing or malformed")]
    InvalidData,

    #[error("email address rejected")]
    InvalidEmail,

    #[error("submitted email matches the confirmed address on file")]
    EmailNoChange,

    #[error("confirmation email already sent; retry in {interval_minutes} minutes")]
    ConfirmEmailAlreadySent { interval_minutes: u64 },

    #[error("password check failed")]
    InvalidPassword,

    #[error("actor lacks privileges for this account")]
    NoPrivileges,

    #[error("email address already in use")]
    EmailTaken,

    #[error("email change vetoed by extension: {0}")]
    Vetoed(String),

    #[error("account store error: {0}")]
    Store(#[from] StoreError),

    #[error("hook {hook} failed: {reason}")]
    Hook { hook: String, reason: String },

    #[error("step {step} denied after retries: {denial}")]
    Denied { step: String, denial: Denial },
}

impl InterstitialError {
    /// Symbolic code used to key user-facing messages.
    pub fn code(&self) -> &str {
        match self {
            InterstitialError::InvalidData => "invalid-data",
            InterstitialError::InvalidEmail => "invalid-email",
            InterstitialError::EmailNoChange => "email-nochange",
            InterstitialError::ConfirmEmailAlreadySent { .. } => "confirm-email-already-sent",
            InterstitialError::InvalidPassword => "invalid-password",
            InterstitialError::NoPrivileges => "no-privileges",
            InterstitialError::EmailTaken => "email-taken",
            InterstitialError::Vetoed(code) => code,
            InterstitialError::Store(_) | InterstitialError::Hook { .. } => "internal-error",
            InterstitialError::Denied { denial, .. } => denial.code(),
        }
    }

    /// Translation key in `[[namespace:code, args]]` form.
    pub fn translation_key(&self) -> String {
        match self {
            InterstitialError::ConfirmEmailAlreadySent { interval_minutes } => {
                format!("[[error:{}, {}]]", self.code(), interval_minutes)
            }
            InterstitialError::Denied { denial, .. } => denial.translation_key(),
            _ => format!("[[error:{}]]", self.code()),
        }
    }

    /// Map a veto code handed back by the `user.saveEmail` hook onto a typed error.
    ///
    /// Hooks may answer with either a bare code (`email-taken`) or a full
    /// translation key (`[[error:email-taken]]`), optionally parameterised
    /// (`[[error:confirm-email-already-sent, 5]]`). A numeric parameter on the
    /// resend code overrides `interval_minutes`.
    pub fn from_code(code: &str, interval_minutes: u64) -> Self {
        let key = code
            .trim()
            .trim_start_matches("[[")
            .trim_end_matches("]]")
            .trim_start_matches("error:");
        let (bare, param) = match key.split_once(',') {
            Some((bare, param)) => (bare.trim(), Some(param.trim())),
            None => (key.trim(), None),
        };
        match bare {
            "invalid-data" => InterstitialError::InvalidData,
            "invalid-email" => InterstitialError::InvalidEmail,
            "email-nochange" => InterstitialError::EmailNoChange,
            "confirm-email-already-sent" => InterstitialError::ConfirmEmailAlreadySent {
                interval_minutes: param
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(interval_minutes),
            },
            "invalid-password" => InterstitialError::InvalidPassword,
            "no-privileges" => InterstitialError::NoPrivileges,
            "email-taken" => InterstitialError::EmailTaken,
            other => InterstitialError::Vetoed(other.to_string()),
        }
    }

    /// Whether the failure came from user input rather than a collaborator.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            InterstitialError::Store(_) | InterstitialError::Hook { .. }
        )
    }
}

/// Soft failures: the step may be re-rendered and submitted again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    #[error("consent to data processing and email communication is required")]
    ConsentDenied,

    #[error("terms of use were not accepted")]
    TermsRejected,

    #[error("{0}")]
    Custom(String),
}

impl Denial {
    pub fn code(&self) -> &str {
        match self {
            Denial::ConsentDenied => "gdpr_consent_denied",
            Denial::TermsRejected => "terms_of_use_error",
            Denial::Custom(code) => code,
        }
    }

    pub fn translation_key(&self) -> String {
        format!("[[register:{}]]", self.code())
    }
}

/// Errors reported by external collaborators (account store, email registry).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("account not found: {0}")]
    NotFound(AccountId),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("email delivery failed: {0}")]
    Delivery(String),
}

pub type InterstitialResult<T> = Result<T, InterstitialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(InterstitialError::InvalidEmail.code(), "invalid-email");
        assert_eq!(InterstitialError::EmailNoChange.code(), "email-nochange");
        assert_eq!(
            InterstitialError::ConfirmEmailAlreadySent { interval_minutes: 10 }.code(),
            "confirm-email-already-sent"
        );
    }

    #[test]
    fn resend_key_carries_interval() {
        let err = InterstitialError::ConfirmEmailAlreadySent { interval_minutes: 10 };
        assert_eq!(
            err.translation_key(),
            "[[error:confirm-email-already-sent, 10]]"
        );
    }

    #[test]
    fn veto_codes_map_back_to_variants() {
        assert!(matches!(
            InterstitialError::from_code("[[error:invalid-email]]", 10),
            InterstitialError::InvalidEmail
        ));
        assert!(matches!(
            InterstitialError::from_code("email-taken", 10),
            InterstitialError::EmailTaken
        ));
        match InterstitialError::from_code("[[error:banned-domain]]", 10) {
            InterstitialError::Vetoed(code) => assert_eq!(code, "banned-domain"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parameterised_keys_map_back_to_variants() {
        assert!(matches!(
            InterstitialError::from_code("[[error:confirm-email-already-sent, 5]]", 10),
            InterstitialError::ConfirmEmailAlreadySent { interval_minutes: 5 }
        ));
        assert!(matches!(
            InterstitialError::from_code("[[error:confirm-email-already-sent, soon]]", 10),
            InterstitialError::ConfirmEmailAlreadySent { interval_minutes: 10 }
        ));
        assert!(matches!(
            InterstitialError::from_code("[[error:email-taken, x@y.zz]]", 10),
            InterstitialError::EmailTaken
        ));
        let err = InterstitialError::ConfirmEmailAlreadySent { interval_minutes: 7 };
        assert!(matches!(
            InterstitialError::from_code(&err.translation_key(), 10),
            InterstitialError::ConfirmEmailAlreadySent { interval_minutes: 7 }
        ));
    }

    #[test]
    fn denial_keys_use_register_namespace() {
        assert_eq!(
            Denial::ConsentDenied.translation_key(),
            "[[register:gdpr_consent_denied]]"
        );
        assert_eq!(
            Denial::TermsRejected.translation_key(),
            "[[register:terms_of_use_error]]"
        );
    }

    #[test]
    fn collaborator_failures_are_not_user_facing() {
        let err: InterstitialError = StoreError::Backend("down".into()).into();
        assert!(!err.is_user_facing());
        assert_eq!(err.code(), "internal-error");
        assert!(InterstitialError::NoPrivileges.is_user_facing());
    }
}
