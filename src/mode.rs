//! Development vs production mode from the active profile set

use crate::config::{parse_profiles, PROFILES_ENV};

/// Profiles that designate development
const DEVELOPMENT_PROFILES: &[&str] = &["dev", "development"];
/// Profiles that designate production
const PRODUCTION_PROFILES: &[&str] = &["prod", "production"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Development,
    Production,
}

/// Derives the runtime mode from the active profiles.
///
/// Development is the default when no profile is active.
#[derive(Debug, Clone, Default)]
pub struct ModeDetector {
    profiles: Vec<String>,
}

impl ModeDetector {
    pub fn new<S: Into<String>>(profiles: impl IntoIterator<Item = S>) -> Self {
        Self {
            profiles: profiles.into_iter().map(Into::into).collect(),
        }
    }

    /// Profiles from `DEVGATE_PROFILES` if set, otherwise `config_profiles`
    pub fn from_env(config_profiles: &[String]) -> Self {
        match std::env::var(PROFILES_ENV) {
            Ok(value) => Self::new(parse_profiles(&value)),
            Err(_) => Self::new(config_profiles.iter().cloned()),
        }
    }

    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    pub fn is_development(&self) -> bool {
        self.profiles.is_empty()
            || self
                .profiles
                .iter()
                .any(|p| DEVELOPMENT_PROFILES.contains(&p.as_str()))
    }

    /// True when a production profile is active; the static asset server
    /// takes over in that case.
    pub fn is_production(&self) -> bool {
        self.profiles
            .iter()
            .any(|p| PRODUCTION_PROFILES.contains(&p.as_str()))
    }

    pub fn mode(&self) -> Mode {
        if self.is_development() {
            Mode::Development
        } else {
            Mode::Production
        }
    }
}
