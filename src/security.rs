//! Query analysis: tokenizing, classification and the detection stages.

mod classifier;
mod dangerous;
mod finding;
mod identifiers;
mod injection;
mod permission;
mod tokenizer;

pub use classifier::{classify, Classification, Clause, StatementInfo, StatementKind, TableRef};
pub use dangerous::{rule_ids as dangerous_rules, DangerousOperationDetector};
pub use finding::{Decision, Finding, FindingKind, ParseSeverityError, Severity, Span};
pub use identifiers::{
    parse_qualified_name, unquote_identifier, validate_identifier, QualifiedName,
    MAX_IDENTIFIER_LENGTH,
};
pub use injection::{
    rule_ids as injection_rules, DangerousEntry, InjectionDetector, InjectionRule, PatternRule,
    DEFAULT_DANGEROUS_FUNCTIONS,
};
pub use permission::{
    check_with_policy, rule_ids as permission_rules, Access, GrantDocument, PermissionPolicy,
    PermissionValidator, PolicyDocument, PolicySource, PolicyStore, TablePattern,
    TENANT_PLACEHOLDER,
};
pub use tokenizer::{
    LiteralKind, LiteralSpan, NormalizedStatement, Token, TokenKind, TokenizerOptions,
};
