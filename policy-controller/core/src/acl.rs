use crate::ids::{DbObjectIds, ObjectKind};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// The meter that rate-limits ACL log messages.
pub const ACL_LOGGING_METER: &str = "acl-logging";

/// A filter row: a match expression with an action, a priority and a direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acl {
    /// The row's primary key, rendered from its `DbObjectIds`.
    pub id: String,
    pub match_expr: String,
    pub action: Action,
    pub priority: u16,
    pub direction: Direction,
    pub log: bool,
    pub severity: Option<Severity>,
    pub meter: Option<String>,
    pub external_ids: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    AllowRelated,
    Drop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ToLport,
    FromLport,
}

/// ACL log severities accepted by the enforcement layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Alert,
    Warning,
    Notice,
    Info,
    Debug,
}

#[derive(Debug, thiserror::Error)]
#[error("{0:?} is not a valid log severity")]
pub struct InvalidSeverity(pub String);

/// Per-namespace ACL log severities for allowed and denied traffic. `None` disables logging.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AclLoggingLevels {
    pub allow: Option<Severity>,
    pub deny: Option<Severity>,
}

// === impl Acl ===

impl Acl {
    pub fn new(
        ids: &DbObjectIds,
        match_expr: impl Into<String>,
        action: Action,
        priority: u16,
        direction: Direction,
        severity: Option<Severity>,
    ) -> Self {
        let mut acl = Self {
            id: ids.primary_key(),
            match_expr: match_expr.into(),
            action,
            priority,
            direction,
            log: false,
            severity: None,
            meter: None,
            external_ids: ids.external_ids(),
        };
        acl.set_logging(severity);
        acl
    }

    pub fn set_logging(&mut self, severity: Option<Severity>) {
        self.log = severity.is_some();
        self.severity = severity;
        self.meter = severity.map(|_| ACL_LOGGING_METER.to_string());
    }

    pub fn ids(&self) -> Option<DbObjectIds> {
        DbObjectIds::from_external_ids(ObjectKind::Acl, &self.external_ids)
    }
}

// === impl Action ===

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::AllowRelated => "allow-related",
            Self::Drop => "drop",
        }
    }

    /// Selects the namespace log severity that applies to ACLs with this action.
    pub fn log_severity(&self, levels: &AclLoggingLevels) -> Option<Severity> {
        match self {
            Self::Allow | Self::AllowRelated => levels.allow,
            Self::Drop => levels.deny,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Direction ===

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToLport => "to-lport",
            Self::FromLport => "from-lport",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Severity ===

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    /// Parses an annotation value, where the empty string explicitly disables logging.
    pub fn parse_optional(s: &str) -> Result<Option<Self>, InvalidSeverity> {
        if s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some)
    }
}

impl FromStr for Severity {
    type Err = InvalidSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(Self::Alert),
            "warning" => Ok(Self::Warning),
            "notice" => Ok(Self::Notice),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            s => Err(InvalidSeverity(s.to_string())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl AclLoggingLevels ===

impl fmt::Display for AclLoggingLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deny={} allow={}",
            self.deny.as_ref().map(Severity::as_str).unwrap_or_default(),
            self.allow.as_ref().map(Severity::as_str).unwrap_or_default(),
        )
    }
}
