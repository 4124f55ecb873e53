//! Unlock methods for the data partition and the rules for accepting them.
//!
//! Secrets live in [`Secret`] values that zero their memory when dropped.
//! A [`CredentialPolicy`] keeps at most one confirmed method and forgets it
//! as soon as a new attempt starts.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Passwords may not contain this character; downstream tooling would
/// interpret it as an escape.
pub const FORBIDDEN_CHAR: char = '\\';

/// A password held in memory that is wiped on drop.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Which unlock method the operator picked, without any secrets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockMethodKind {
    #[default]
    NoPassword,
    PersonalPassword,
    MasterAndInitialPassword,
}

/// A validated unlock method together with the secrets it needs.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum UnlockMethod {
    #[default]
    NoPassword,
    PersonalPassword {
        password: Secret,
    },
    /// The data partition is unlocked by a master password kept by an
    /// administrator and an initial password handed to the user.
    MasterAndInitialPassword {
        master: Secret,
        initial: Secret,
    },
}

impl UnlockMethod {
    pub fn kind(&self) -> UnlockMethodKind {
        match self {
            UnlockMethod::NoPassword => UnlockMethodKind::NoPassword,
            UnlockMethod::PersonalPassword { .. } => UnlockMethodKind::PersonalPassword,
            UnlockMethod::MasterAndInitialPassword { .. } => {
                UnlockMethodKind::MasterAndInitialPassword
            }
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, UnlockMethod::NoPassword)
    }

    /// Key slots to enrol, primary key first.
    pub fn keys(&self) -> Vec<&Secret> {
        match self {
            UnlockMethod::NoPassword => Vec::new(),
            UnlockMethod::PersonalPassword { password } => vec![password],
            UnlockMethod::MasterAndInitialPassword { master, initial } => vec![master, initial],
        }
    }

    /// Wipes all secrets and falls back to [`UnlockMethod::NoPassword`].
    pub fn clear(&mut self) {
        // Dropping the old value zeroes its secrets.
        *self = UnlockMethod::NoPassword;
    }
}

/// Raw secrets as typed by the operator. Only the fields relevant to the
/// chosen method are looked at.
#[derive(Debug, Default)]
pub struct SecretInput {
    pub password: Secret,
    pub password_repeat: Secret,
    pub master: Secret,
    pub master_repeat: Secret,
    pub initial: Secret,
    pub initial_repeat: Secret,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("password must not be empty")]
    Empty,
    #[error("password and repetition do not match")]
    Mismatch,
    #[error("password must not contain a backslash")]
    ForbiddenCharacter,
}

fn check_pair(which: &str, value: &Secret, repeat: &Secret) -> Result<(), ValidationError> {
    let result = if value.is_empty() || repeat.is_empty() {
        Err(ValidationError::Empty)
    } else if value.expose().contains(FORBIDDEN_CHAR) || repeat.expose().contains(FORBIDDEN_CHAR) {
        Err(ValidationError::ForbiddenCharacter)
    } else if value.expose().as_bytes() != repeat.expose().as_bytes() {
        Err(ValidationError::Mismatch)
    } else {
        Ok(())
    };

    if let Err(e) = result {
        debug!(which, rule = %e, "password rejected");
    }
    result
}

/// Validates `input` for `kind` and captures the secrets that method needs.
///
/// The input is consumed; unused secrets are wiped when it drops.
pub fn select(kind: UnlockMethodKind, input: SecretInput) -> Result<UnlockMethod, ValidationError> {
    let result = match kind {
        UnlockMethodKind::NoPassword => Ok(UnlockMethod::NoPassword),
        UnlockMethodKind::PersonalPassword => {
            check_pair("personal", &input.password, &input.password_repeat).map(|()| {
                UnlockMethod::PersonalPassword {
                    password: input.password,
                }
            })
        }
        UnlockMethodKind::MasterAndInitialPassword => {
            check_pair("master", &input.master, &input.master_repeat)
                .and_then(|()| check_pair("initial", &input.initial, &input.initial_repeat))
                .map(|()| UnlockMethod::MasterAndInitialPassword {
                    master: input.master,
                    initial: input.initial,
                })
        }
    };

    if result.is_err() {
        warn!(method = ?kind, "credential validation failed");
    }
    result
}

/// Holds the most recently confirmed unlock method.
#[derive(Debug, Default)]
pub struct CredentialPolicy {
    confirmed: Option<UnlockMethod>,
}

impl CredentialPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a new attempt. Whatever was confirmed before is wiped first,
    /// so a failed attempt never leaves an older secret behind.
    pub fn submit(
        &mut self,
        kind: UnlockMethodKind,
        input: SecretInput,
    ) -> Result<&UnlockMethod, ValidationError> {
        self.clear();
        let method = select(kind, input)?;
        Ok(self.confirmed.insert(method))
    }

    /// Switching methods discards the secrets of the previous one.
    pub fn switch_method(&mut self, kind: UnlockMethodKind) {
        if self.confirmed.as_ref().map(UnlockMethod::kind) != Some(kind) {
            self.clear();
        }
    }

    pub fn confirmed(&self) -> Option<&UnlockMethod> {
        self.confirmed.as_ref()
    }

    /// Hands the confirmed method to a batch, leaving nothing behind.
    pub fn take(&mut self) -> Option<UnlockMethod> {
        self.confirmed.take()
    }

    pub fn clear(&mut self) {
        if let Some(mut method) = self.confirmed.take() {
            method.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn personal(password: &str, repeat: &str) -> SecretInput {
        SecretInput {
            password: Secret::new(password),
            password_repeat: Secret::new(repeat),
            ..Default::default()
        }
    }

    fn master(master: (&str, &str), initial: (&str, &str)) -> SecretInput {
        SecretInput {
            master: Secret::new(master.0),
            master_repeat: Secret::new(master.1),
            initial: Secret::new(initial.0),
            initial_repeat: Secret::new(initial.1),
            ..Default::default()
        }
    }

    #[test]
    fn no_password_always_succeeds() {
        let method = select(UnlockMethodKind::NoPassword, personal("a", "b")).unwrap();
        assert_eq!(method, UnlockMethod::NoPassword);
        assert!(method.keys().is_empty());
    }

    #[test]
    fn personal_password_round_trips() {
        let method = select(UnlockMethodKind::PersonalPassword, personal("s3cret pw", "s3cret pw"))
            .unwrap();
        match &method {
            UnlockMethod::PersonalPassword { password } => assert_eq!(password.expose(), "s3cret pw"),
            other => panic!("unexpected method {other:?}"),
        }
        assert_eq!(method.kind(), UnlockMethodKind::PersonalPassword);
    }

    #[test]
    fn personal_password_rules() {
        let cases = [
            ("", "", Err(ValidationError::Empty)),
            ("abc", "", Err(ValidationError::Empty)),
            ("abc", "abd", Err(ValidationError::Mismatch)),
            ("a\\c", "a\\c", Err(ValidationError::ForbiddenCharacter)),
            ("abc", "a\\c", Err(ValidationError::ForbiddenCharacter)),
            ("äbc", "äbc", Ok(())),
        ];
        for (password, repeat, expected) in cases {
            let result = select(UnlockMethodKind::PersonalPassword, personal(password, repeat));
            assert_eq!(result.map(|_| ()), expected, "{password:?} / {repeat:?}");
        }
    }

    #[test]
    fn master_and_initial_need_both_pairs() {
        let err = select(
            UnlockMethodKind::MasterAndInitialPassword,
            master(("m", "m"), ("i", "x")),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Mismatch);

        let err = select(
            UnlockMethodKind::MasterAndInitialPassword,
            master(("", ""), ("i", "i")),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Empty);

        let method = select(
            UnlockMethodKind::MasterAndInitialPassword,
            master(("m", "m"), ("i", "i")),
        )
        .unwrap();
        let keys: Vec<_> = method.keys().iter().map(|s| s.expose().to_string()).collect();
        assert_eq!(keys, ["m", "i"]);
    }

    #[test]
    fn failed_attempt_clears_previous_confirmation() {
        let mut policy = CredentialPolicy::new();
        policy
            .submit(UnlockMethodKind::PersonalPassword, personal("good", "good"))
            .unwrap();
        assert!(policy.confirmed().is_some());

        let err = policy
            .submit(UnlockMethodKind::PersonalPassword, personal("good", "bad"))
            .unwrap_err();
        assert_eq!(err, ValidationError::Mismatch);
        assert!(policy.confirmed().is_none());
        assert!(policy.take().is_none());
    }

    #[test]
    fn switching_method_discards_secrets() {
        let mut policy = CredentialPolicy::new();
        policy
            .submit(UnlockMethodKind::PersonalPassword, personal("good", "good"))
            .unwrap();
        policy.switch_method(UnlockMethodKind::PersonalPassword);
        assert!(policy.confirmed().is_some());
        policy.switch_method(UnlockMethodKind::NoPassword);
        assert!(policy.confirmed().is_none());
    }

    #[test]
    fn clearing_a_method_drops_its_secrets() {
        let mut method = select(UnlockMethodKind::PersonalPassword, personal("pw", "pw")).unwrap();
        method.clear();
        assert_eq!(method, UnlockMethod::NoPassword);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", personal("hunter2", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
