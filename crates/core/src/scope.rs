//! Visibility scopes and the scope filter.
//!
//! Every fact belongs to exactly one [`Scope`]. A caller sees a fact when the
//! fact is global or when the caller's identity for that scope kind equals the
//! fact's target. Caller-supplied identifiers are untrusted input; when the
//! process also knows an authenticated identity, [`resolve_caller`] and
//! [`resolve_write_scope`] decide which one wins and report disagreements.

use serde::{Deserialize, Serialize};

use crate::fact::Fact;
use crate::{RecollectError, Result};

/// Scope kind without its target, as supplied by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    #[default]
    Global,
    User,
    Agent,
    Session,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::User => "user",
            ScopeKind::Agent => "agent",
            ScopeKind::Session => "session",
        }
    }
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScopeKind {
    type Err = RecollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ScopeKind::Global),
            "user" => Ok(ScopeKind::User),
            "agent" => Ok(ScopeKind::Agent),
            "session" => Ok(ScopeKind::Session),
            other => Err(RecollectError::InvalidFact(format!("unknown scope `{other}`"))),
        }
    }
}

/// Visibility boundary of a fact.
///
/// The target lives inside the variant: there is no way to build a user,
/// agent or session scope without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Global,
    User(String),
    Agent(String),
    Session(String),
}

impl Scope {
    /// Build a scope from its kind and an optional target.
    ///
    /// Rejects a non-global kind without a target and a global kind with one.
    pub fn from_parts(kind: ScopeKind, target: Option<String>) -> Result<Self> {
        let target = target.map(|t| t.trim().to_string());
        match (kind, target) {
            (ScopeKind::Global, None) => Ok(Scope::Global),
            (ScopeKind::Global, Some(t)) if t.is_empty() => Ok(Scope::Global),
            (ScopeKind::Global, Some(t)) => Err(RecollectError::UnexpectedScopeTarget(t)),
            (kind, None) => Err(RecollectError::ScopeTargetRequired(kind)),
            (kind, Some(t)) if t.is_empty() => Err(RecollectError::ScopeTargetRequired(kind)),
            (ScopeKind::User, Some(t)) => Ok(Scope::User(t)),
            (ScopeKind::Agent, Some(t)) => Ok(Scope::Agent(t)),
            (ScopeKind::Session, Some(t)) => Ok(Scope::Session(t)),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        match self {
            Scope::Global => ScopeKind::Global,
            Scope::User(_) => ScopeKind::User,
            Scope::Agent(_) => ScopeKind::Agent,
            Scope::Session(_) => ScopeKind::Session,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::User(t) | Scope::Agent(t) | Scope::Session(t) => Some(t),
        }
    }

    /// Deserialized scopes bypass [`Scope::from_parts`]; re-check them.
    pub fn validate(&self) -> Result<()> {
        match self.target() {
            Some(t) if t.trim().is_empty() => Err(RecollectError::ScopeTargetRequired(self.kind())),
            _ => Ok(()),
        }
    }

    /// The caller that owns this scope, used when a writer's own view is needed.
    pub fn owner(&self) -> CallerScope {
        let mut caller = CallerScope::default();
        match self {
            Scope::Global => {}
            Scope::User(t) => caller.user_id = Some(t.clone()),
            Scope::Agent(t) => caller.agent_id = Some(t.clone()),
            Scope::Session(t) => caller.session_id = Some(t.clone()),
        }
        caller
    }
}

/// Identity of a reader, one optional identifier per scope kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerScope {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

impl CallerScope {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// The identifier this caller holds for `kind`. Global has none.
    pub fn id_for(&self, kind: ScopeKind) -> Option<&str> {
        match kind {
            ScopeKind::Global => None,
            ScopeKind::User => self.user_id.as_deref(),
            ScopeKind::Agent => self.agent_id.as_deref(),
            ScopeKind::Session => self.session_id.as_deref(),
        }
    }
}

/// Can `caller` see `fact`?
pub fn visible(fact: &Fact, caller: &CallerScope) -> bool {
    scope_visible(&fact.scope, caller)
}

pub fn scope_visible(scope: &Scope, caller: &CallerScope) -> bool {
    match scope {
        Scope::Global => true,
        Scope::User(t) => caller.user_id.as_deref() == Some(t.as_str()),
        Scope::Agent(t) => caller.agent_id.as_deref() == Some(t.as_str()),
        Scope::Session(t) => caller.session_id.as_deref() == Some(t.as_str()),
    }
}

/// Which identity wins when both a caller-supplied and an authenticated one exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeTrust {
    /// Use caller-supplied identifiers; only report disagreement.
    CallerSupplied,
    /// Authenticated identifiers override; caller values fill the gaps.
    #[default]
    AuthenticatedPreferred,
    /// Ignore caller-supplied identifiers entirely.
    AuthenticatedOnly,
}

/// A caller-supplied identifier that differs from the authenticated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMismatch {
    pub kind: ScopeKind,
    pub supplied: String,
    pub authenticated: String,
}

/// Effective reader identity plus any disagreements found on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCaller {
    pub caller: CallerScope,
    pub mismatches: Vec<ScopeMismatch>,
}

const KINDS: [ScopeKind; 3] = [ScopeKind::User, ScopeKind::Agent, ScopeKind::Session];

/// Decide the reader identity for a recall.
pub fn resolve_caller(
    supplied: &CallerScope,
    authenticated: Option<&CallerScope>,
    trust: ScopeTrust,
) -> ResolvedCaller {
    let mismatches = authenticated
        .map(|auth| mismatches_between(supplied, auth))
        .unwrap_or_default();

    let caller = match (trust, authenticated) {
        (ScopeTrust::CallerSupplied, _) | (ScopeTrust::AuthenticatedPreferred, None) => {
            supplied.clone()
        }
        (ScopeTrust::AuthenticatedPreferred, Some(auth)) => CallerScope {
            user_id: auth.user_id.clone().or_else(|| supplied.user_id.clone()),
            agent_id: auth.agent_id.clone().or_else(|| supplied.agent_id.clone()),
            session_id: auth.session_id.clone().or_else(|| supplied.session_id.clone()),
        },
        (ScopeTrust::AuthenticatedOnly, Some(auth)) => auth.clone(),
        (ScopeTrust::AuthenticatedOnly, None) => CallerScope::default(),
    };

    ResolvedCaller { caller, mismatches }
}

/// Decide the scope of a new fact.
///
/// A non-global kind always ends up with a concrete target or the write is
/// rejected. The target may come from the caller or, depending on `trust`,
/// from the authenticated identity; it never silently becomes global.
pub fn resolve_write_scope(
    kind: ScopeKind,
    target: Option<String>,
    authenticated: Option<&CallerScope>,
    trust: ScopeTrust,
) -> Result<(Scope, Vec<ScopeMismatch>)> {
    if kind == ScopeKind::Global {
        return Ok((Scope::from_parts(kind, target)?, Vec::new()));
    }

    let target = target.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
    let auth_id = authenticated.and_then(|a| a.id_for(kind)).map(str::to_string);
    let mismatch = match (&target, &auth_id) {
        (Some(s), Some(a)) if s != a => vec![ScopeMismatch {
            kind,
            supplied: s.clone(),
            authenticated: a.clone(),
        }],
        _ => Vec::new(),
    };

    let chosen = match trust {
        ScopeTrust::CallerSupplied => target,
        ScopeTrust::AuthenticatedPreferred => auth_id.or(target),
        ScopeTrust::AuthenticatedOnly => {
            if let Some(m) = mismatch.first() {
                return Err(RecollectError::ScopeMismatch {
                    kind,
                    supplied: m.supplied.clone(),
                    authenticated: m.authenticated.clone(),
                });
            }
            auth_id
        }
    };

    Ok((Scope::from_parts(kind, chosen)?, mismatch))
}

fn mismatches_between(supplied: &CallerScope, auth: &CallerScope) -> Vec<ScopeMismatch> {
    KINDS
        .iter()
        .filter_map(|&kind| match (supplied.id_for(kind), auth.id_for(kind)) {
            (Some(s), Some(a)) if s != a => Some(ScopeMismatch {
                kind,
                supplied: s.to_string(),
                authenticated: a.to_string(),
            }),
            _ => None,
        })
        .collect()
}
