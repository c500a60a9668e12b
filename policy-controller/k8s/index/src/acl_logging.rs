//! Parses the namespace ACL-logging annotation.

use netpol_controller_core::{acl::InvalidSeverity, AclLoggingLevels, Severity};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum AclLoggingError {
    #[error("could not unmarshal namespace ACL annotation '{annotation}', disabling logging, err: {source}")]
    Malformed {
        annotation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(InvalidLevels),
}

/// One or both of the annotation's levels were not valid severities.
#[derive(Debug, Default)]
pub struct InvalidLevels {
    pub deny: Option<InvalidSeverity>,
    pub allow: Option<InvalidSeverity>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct Annotation {
    #[serde(default)]
    allow: String,
    #[serde(default)]
    deny: String,
}

/// Updates `levels` from the namespace's annotation value.
///
/// Logging is switched off entirely when it is disabled cluster-wide, when the annotation is
/// absent or empty, and when the annotation cannot be parsed (the last case also returns an
/// error). Otherwise each level is set independently; an invalid level switches logging off for
/// that action only and is reported in the returned error. Applying the same annotation twice
/// always yields the same levels.
pub fn update_levels(
    levels: &mut AclLoggingLevels,
    annotation: Option<&str>,
    enabled: bool,
) -> Result<(), AclLoggingError> {
    let raw = match annotation {
        Some(annotation) if enabled && !annotation.is_empty() && annotation != "{}" => {
            match serde_json::from_str::<Annotation>(annotation) {
                Ok(raw) => raw,
                Err(source) => {
                    *levels = AclLoggingLevels::default();
                    return Err(AclLoggingError::Malformed {
                        annotation: annotation.to_string(),
                        source,
                    });
                }
            }
        }
        _ => Annotation::default(),
    };

    let mut invalid = InvalidLevels::default();
    levels.deny = Severity::parse_optional(&raw.deny).unwrap_or_else(|error| {
        invalid.deny = Some(error);
        None
    });
    levels.allow = Severity::parse_optional(&raw.allow).unwrap_or_else(|error| {
        invalid.allow = Some(error);
        None
    });

    if invalid.deny.is_some() || invalid.allow.is_some() {
        return Err(AclLoggingError::Invalid(invalid));
    }
    Ok(())
}

// === impl InvalidLevels ===

impl InvalidLevels {
    fn messages(&self) -> Vec<String> {
        let deny = self.deny.as_ref().map(|InvalidSeverity(s)| {
            format!("disabling deny logging due to invalid deny annotation. {s:?} is not a valid log severity")
        });
        let allow = self.allow.as_ref().map(|InvalidSeverity(s)| {
            format!("disabling allow logging due to an invalid allow annotation. {s:?} is not a valid log severity")
        });
        deny.into_iter().chain(allow).collect()
    }
}

impl fmt::Display for InvalidLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.messages().as_slice() {
            [msg] => f.write_str(msg),
            msgs => write!(f, "[{}]", msgs.join(", ")),
        }
    }
}
