//! Role-based permission policy and the permission gate.
//!
//! A policy maps each role to grants of operations on table patterns:
//!
//! ```json
//! {
//!   "version": 1,
//!   "default_schema": "public",
//!   "roles": {
//!     "analyst": [
//!       { "operations": ["select"], "tables": ["orders", "sales.*"] },
//!       { "operations": [], "tables": ["sales.salaries"] }
//!     ]
//!   }
//! }
//! ```
//!
//! Patterns are `*`, a prefix ending in `*`, or an exact name, and may contain
//! `{tenant}`. For each table the most specific matching pattern decides:
//! exact beats prefix, a longer prefix beats a shorter one, and `*` comes
//! last. An empty operation list is an explicit deny. Nothing is allowed
//! without a grant.
//!
//! Compiled policies are immutable. [`PolicyStore`] swaps whole snapshots, so
//! a validation always sees one complete policy.

use super::classifier::{Classification, Clause, StatementInfo, StatementKind, TableRef};
use super::finding::{Finding, Span};
use super::identifiers::{
    parse_qualified_name, unquote_identifier, validate_identifier, QualifiedName,
};
use crate::constants::POLICY_VERSION;
use crate::error::GuardError;
use crate::validator::CallerContext;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Placeholder expanded from the caller's tenant.
pub const TENANT_PLACEHOLDER: &str = "{tenant}";

pub mod rule_ids {
    pub const UNKNOWN_ROLE: &str = "unknown_role";
    pub const UNRESOLVED_TABLE: &str = "unresolved_table";
    pub const TABLE_NOT_GRANTED: &str = "table_not_granted";
    pub const OPERATION_NOT_GRANTED: &str = "operation_not_granted";
    pub const STATEMENT_NOT_GRANTED: &str = "statement_not_granted";
}

// =============================================================================
// Policy document
// =============================================================================

/// Serialized policy as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
    pub roles: BTreeMap<String, Vec<GrantDocument>>,
}

/// One grant: operations allowed on a set of table patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantDocument {
    pub operations: Vec<String>,
    pub tables: Vec<String>,
}

// =============================================================================
// Compiled policy
// =============================================================================

/// Table pattern after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TablePattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl TablePattern {
    fn parse(raw: &str, default_schema: Option<&str>) -> Result<Self, GuardError> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(TablePattern::Any);
        }
        validate_identifier(raw)
            .map_err(|e| GuardError::policy(format!("invalid table pattern '{}': {}", raw, e)))?;

        let (body, prefix) = match raw.strip_suffix('*') {
            Some(body) => (body, true),
            None => (raw, false),
        };
        if body.contains('*') {
            return Err(GuardError::policy(format!(
                "invalid table pattern '{}': '*' is only allowed at the end",
                raw
            )));
        }

        let mut parts = parse_qualified_name(body)
            .map_err(|e| GuardError::policy(format!("invalid table pattern '{}': {}", raw, e)))?
            .parts()
            .to_vec();
        // A single-part name lives in the default schema.
        if let (Some(schema), 1) = (default_schema, parts.len()) {
            parts.insert(0, schema.to_string());
        }
        let text = parts.join(".");

        Ok(if prefix {
            TablePattern::Prefix(text)
        } else {
            TablePattern::Exact(text)
        })
    }

    /// Specificity of a match against `name`, or `None` when it does not
    /// match. Higher wins.
    fn matches(&self, name: &str, tenant: &str) -> Option<(u8, usize)> {
        match self {
            TablePattern::Any => Some((0, 0)),
            TablePattern::Prefix(prefix) => {
                let prefix = expand_tenant(prefix, tenant)?;
                name.starts_with(prefix.as_str()).then_some((1, prefix.len()))
            }
            TablePattern::Exact(exact) => {
                let exact = expand_tenant(exact, tenant)?;
                (name == exact).then_some((2, exact.len()))
            }
        }
    }
}

impl std::fmt::Display for TablePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TablePattern::Any => f.write_str("*"),
            TablePattern::Prefix(prefix) => write!(f, "{}*", prefix),
            TablePattern::Exact(exact) => f.write_str(exact),
        }
    }
}

/// Expand `{tenant}`; patterns that need a tenant never match without one.
fn expand_tenant(pattern: &str, tenant: &str) -> Option<String> {
    if !pattern.contains(TENANT_PLACEHOLDER) {
        return Some(pattern.to_string());
    }
    let tenant = tenant.trim().to_lowercase();
    if tenant.is_empty() || validate_identifier(&tenant).is_err() || tenant.contains(['.', '*']) {
        return None;
    }
    Some(pattern.replace(TENANT_PLACEHOLDER, &tenant))
}

fn parse_operations(raw: &[String]) -> Result<HashSet<StatementKind>, GuardError> {
    let mut operations = HashSet::new();
    for op in raw {
        let op = op.trim().to_lowercase();
        if op == "*" || op == "all" {
            operations.extend(ALL_OPERATIONS.iter().copied());
            continue;
        }
        match StatementKind::from_keyword(&op) {
            Some(kind) => {
                operations.insert(kind);
            }
            None => {
                return Err(GuardError::policy(format!("unknown operation '{}'", op)));
            }
        }
    }
    Ok(operations)
}

const ALL_OPERATIONS: &[StatementKind] = &[
    StatementKind::Select,
    StatementKind::Insert,
    StatementKind::Update,
    StatementKind::Delete,
    StatementKind::Merge,
    StatementKind::Create,
    StatementKind::Drop,
    StatementKind::Alter,
    StatementKind::Truncate,
    StatementKind::Grant,
    StatementKind::Revoke,
    StatementKind::Execute,
];

#[derive(Debug, Clone)]
struct CompiledGrant {
    pattern: TablePattern,
    operations: HashSet<StatementKind>,
}

/// Result of resolving one table for a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted,
    /// A pattern matched but does not include the operation.
    OperationDenied { pattern: String },
    /// No pattern matched the table.
    NoMatch,
}

/// Compiled, immutable permission policy.
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    default_schema: Option<String>,
    roles: BTreeMap<String, Vec<CompiledGrant>>,
}

impl PermissionPolicy {
    /// Parse and compile a JSON policy document.
    pub fn from_json(json: &str) -> Result<Self, GuardError> {
        let document: PolicyDocument = serde_json::from_str(json)
            .map_err(|e| GuardError::policy(format!("malformed policy document: {}", e)))?;
        Self::from_document(&document)
    }

    /// Load a policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GuardError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            GuardError::policy(format!("cannot read policy file {}: {}", path.display(), e))
        })?;
        let policy = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            roles = policy.roles.len(),
            "Permission policy loaded"
        );
        Ok(policy)
    }

    pub fn from_document(document: &PolicyDocument) -> Result<Self, GuardError> {
        if document.version != POLICY_VERSION {
            return Err(GuardError::policy(format!(
                "unsupported policy version {} (expected {})",
                document.version, POLICY_VERSION
            )));
        }

        let default_schema = match document.default_schema.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(schema) => {
                validate_identifier(schema).map_err(|e| {
                    GuardError::policy(format!("invalid default schema '{}': {}", schema, e))
                })?;
                Some(unquote_identifier(schema))
            }
        };

        let mut roles = BTreeMap::new();
        for (role, grants) in &document.roles {
            let mut compiled: Vec<CompiledGrant> = Vec::new();
            for grant in grants {
                let operations = parse_operations(&grant.operations)
                    .map_err(|e| GuardError::policy(format!("role '{}': {}", role, e)))?;
                for table in &grant.tables {
                    let pattern = TablePattern::parse(table, default_schema.as_deref())
                        .map_err(|e| GuardError::policy(format!("role '{}': {}", role, e)))?;
                    match compiled.iter_mut().find(|g| g.pattern == pattern) {
                        // An explicit deny on a pattern overrides grants on the same pattern.
                        Some(existing) if operations.is_empty() => existing.operations.clear(),
                        Some(existing) if existing.operations.is_empty() => {}
                        Some(existing) => existing.operations.extend(operations.iter().copied()),
                        None => compiled.push(CompiledGrant {
                            pattern,
                            operations: operations.clone(),
                        }),
                    }
                }
            }
            roles.insert(role.trim().to_lowercase(), compiled);
        }

        Ok(Self {
            default_schema,
            roles,
        })
    }

    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains_key(&role.trim().to_lowercase())
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// Canonical policy name of a table: qualified with the default schema
    /// when it has one part.
    pub fn canonical_name(&self, name: &QualifiedName) -> String {
        match (&self.default_schema, name.parts().len()) {
            (Some(schema), 1) => format!("{}.{}", schema, name.object()),
            _ => name.to_string(),
        }
    }

    /// Resolve `operation` on `table` for `role`.
    pub fn access(&self, role: &str, tenant: &str, table: &str, operation: StatementKind) -> Access {
        let Some(grants) = self.roles.get(&role.trim().to_lowercase()) else {
            return Access::NoMatch;
        };

        let mut best: Option<((u8, usize), &CompiledGrant)> = None;
        for grant in grants {
            if let Some(score) = grant.pattern.matches(table, tenant) {
                // Strictly greater: on ties the first grant wins.
                if best.is_none_or(|(current, _)| score > current) {
                    best = Some((score, grant));
                }
            }
        }

        match best {
            None => Access::NoMatch,
            Some((_, grant)) if grant.operations.contains(&operation) => Access::Granted,
            Some((_, grant)) => Access::OperationDenied {
                pattern: grant.pattern.to_string(),
            },
        }
    }
}

// =============================================================================
// Policy source
// =============================================================================

/// Read-only snapshot access to the current policy.
pub trait PolicySource: Send + Sync {
    fn current_policy(&self) -> Arc<PermissionPolicy>;
}

impl PolicySource for Arc<PermissionPolicy> {
    fn current_policy(&self) -> Arc<PermissionPolicy> {
        Arc::clone(self)
    }
}

/// Holds the active policy and swaps it as a whole on reload.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<PermissionPolicy>>,
}

impl PolicyStore {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GuardError> {
        Ok(Self::new(PermissionPolicy::load(path)?))
    }

    /// Install a new snapshot. In-flight validations keep the old one.
    pub fn replace(&self, policy: PermissionPolicy) {
        *self.current.write() = Arc::new(policy);
        debug!("Permission policy replaced");
    }

    /// Reload from a file; the current snapshot stays on failure.
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<(), GuardError> {
        let policy = PermissionPolicy::load(path)?;
        self.replace(policy);
        Ok(())
    }
}

impl PolicySource for PolicyStore {
    fn current_policy(&self) -> Arc<PermissionPolicy> {
        Arc::clone(&self.current.read())
    }
}

// =============================================================================
// Permission validator
// =============================================================================

/// Operation a table reference requires.
fn required_operation(statement: StatementKind, table: &TableRef) -> StatementKind {
    match table.clause {
        clause if clause.is_source() => StatementKind::Select,
        Clause::Procedure => StatementKind::Execute,
        // `SELECT ... INTO new_table` writes.
        Clause::Into if statement == StatementKind::Select => StatementKind::Insert,
        _ => statement,
    }
}

/// Permission gate over classified statements.
#[derive(Clone)]
pub struct PermissionValidator {
    source: Arc<dyn PolicySource>,
}

impl std::fmt::Debug for PermissionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionValidator").finish_non_exhaustive()
    }
}

impl PermissionValidator {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self { source }
    }

    /// Check every statement against one policy snapshot.
    pub fn check(&self, classification: &Classification, caller: &CallerContext) -> Vec<Finding> {
        let policy = self.source.current_policy();
        check_with_policy(&policy, classification, caller)
    }
}

/// Check `classification` for `caller` against `policy`.
pub fn check_with_policy(
    policy: &PermissionPolicy,
    classification: &Classification,
    caller: &CallerContext,
) -> Vec<Finding> {
    let Some(first) = classification.statements.first() else {
        return Vec::new();
    };
    if !policy.has_role(&caller.role) {
        return vec![Finding::permission_denied(
            rule_ids::UNKNOWN_ROLE,
            format!("Role '{}' is not defined in the permission policy", caller.role),
            first.span,
        )];
    }

    let mut findings: Vec<Finding> = Vec::new();
    let mut push = |finding: Finding| {
        if !findings
            .iter()
            .any(|f| f.rule == finding.rule && f.reason == finding.reason)
        {
            findings.push(finding);
        }
    };
    for statement in &classification.statements {
        check_statement(policy, statement, caller, &mut push);
    }
    findings
}

fn check_statement(
    policy: &PermissionPolicy,
    statement: &StatementInfo,
    caller: &CallerContext,
    push: &mut impl FnMut(Finding),
) {
    if statement.kind == StatementKind::Unknown {
        push(Finding::permission_denied(
            rule_ids::STATEMENT_NOT_GRANTED,
            "Unrecognized statement cannot be authorized",
            statement.span,
        ));
        return;
    }

    if statement.table_refs.is_empty() {
        if statement.kind != StatementKind::Select {
            check_table(policy, caller, "*", statement.kind, statement.span, push);
        }
        return;
    }

    for table in &statement.table_refs {
        let operation = required_operation(statement.kind, table);
        if !table.resolved || !table.name.is_resolvable() {
            push(Finding::permission_denied(
                rule_ids::UNRESOLVED_TABLE,
                format!(
                    "Table reference '{}' cannot be resolved unambiguously",
                    display_name(&table.name)
                ),
                table.span,
            ));
            continue;
        }
        let name = policy.canonical_name(&table.name);
        check_table(policy, caller, &name, operation, table.span, push);
    }
}

fn check_table(
    policy: &PermissionPolicy,
    caller: &CallerContext,
    table: &str,
    operation: StatementKind,
    span: Span,
    push: &mut impl FnMut(Finding),
) {
    let verb = operation.as_str().to_uppercase();
    match policy.access(&caller.role, &caller.tenant, table, operation) {
        Access::Granted => {}
        Access::OperationDenied { pattern } => push(Finding::permission_denied(
            rule_ids::OPERATION_NOT_GRANTED,
            format!(
                "Role '{}' may not {} on '{}' (pattern '{}')",
                caller.role, verb, table, pattern
            ),
            span,
        )),
        Access::NoMatch => push(Finding::permission_denied(
            rule_ids::TABLE_NOT_GRANTED,
            format!("Role '{}' has no grant for {} on '{}'", caller.role, verb, table),
            span,
        )),
    }
}

fn display_name(name: &QualifiedName) -> String {
    name.parts()
        .iter()
        .map(|p| if p.is_empty() { "?" } else { p.as_str() })
        .collect::<Vec<_>>()
        .join(".")
}
