//! Statement classification.
//!
//! Keyword-driven: the first keyword of each statement decides its kind, and a
//! single scan over the significant tokens collects `WHERE` presence and the
//! referenced tables together with the clause they appear in.

use super::finding::{Finding, Severity, Span};
use super::identifiers::{unquote_identifier, QualifiedName};
use super::tokenizer::{LiteralKind, NormalizedStatement, Token, TokenKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Type of SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Drop,
    Alter,
    Truncate,
    Grant,
    Revoke,
    Execute,
    Unknown,
}

impl StatementKind {
    /// Map a leading keyword to a statement kind.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword {
            "select" => StatementKind::Select,
            "insert" | "replace" => StatementKind::Insert,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            "merge" => StatementKind::Merge,
            "create" => StatementKind::Create,
            "drop" => StatementKind::Drop,
            "alter" => StatementKind::Alter,
            "truncate" => StatementKind::Truncate,
            "grant" => StatementKind::Grant,
            "revoke" => StatementKind::Revoke,
            "exec" | "execute" | "call" => StatementKind::Execute,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Merge => "merge",
            StatementKind::Create => "create",
            StatementKind::Drop => "drop",
            StatementKind::Alter => "alter",
            StatementKind::Truncate => "truncate",
            StatementKind::Grant => "grant",
            StatementKind::Revoke => "revoke",
            StatementKind::Execute => "execute",
            StatementKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clause a table reference was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    From,
    Join,
    Using,
    Update,
    Into,
    DeleteFrom,
    /// Object named by a DDL or GRANT/REVOKE statement.
    Target,
    /// Procedure named by EXEC/CALL.
    Procedure,
}

impl Clause {
    /// Whether the clause only reads from the table.
    pub fn is_source(&self) -> bool {
        matches!(self, Clause::From | Clause::Join | Clause::Using)
    }
}

/// One table (or other object) referenced by a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: QualifiedName,
    pub clause: Clause,
    pub span: Span,
    /// Parenthesis depth; 0 is the statement's own level.
    pub depth: usize,
    /// False when a part of the name was a double-quoted literal and
    /// therefore redacted.
    pub resolved: bool,
}

/// Classification of one `;`-separated statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    pub kind: StatementKind,
    /// First keyword of the statement, lowercased (empty when none).
    pub leading_keyword: String,
    pub span: Span,
    pub has_where: bool,
    pub table_refs: Vec<TableRef>,
    /// Comma-separated table list in FROM/UPDATE/DELETE.
    pub implicit_join: bool,
}

impl StatementInfo {
    /// Distinct tables referenced at the statement's own level.
    pub fn top_level_tables(&self) -> HashSet<&QualifiedName> {
        self.table_refs
            .iter()
            .filter(|r| r.depth == 0 && r.clause != Clause::Procedure)
            .map(|r| &r.name)
            .collect()
    }
}

/// Output of the classifier for the whole input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Kind of the first statement.
    pub kind: StatementKind,
    pub is_multi_statement: bool,
    pub statements: Vec<StatementInfo>,
    pub findings: Vec<Finding>,
}

impl Classification {
    /// `WHERE` presence of the first statement.
    pub fn has_where(&self) -> bool {
        self.statements.first().is_some_and(|s| s.has_where)
    }

    /// All table references in statement order.
    pub fn table_refs(&self) -> impl Iterator<Item = &TableRef> {
        self.statements.iter().flat_map(|s| s.table_refs.iter())
    }
}

/// Words that end a table name or alias position.
const STOP_WORDS: &[&str] = &[
    "select", "where", "set", "values", "value", "on", "using", "as", "join", "inner", "left",
    "right", "full", "outer", "cross", "natural", "group", "order", "limit", "offset", "having",
    "union", "intersect", "except", "minus", "window", "fetch", "for", "into", "from", "returning",
    "output", "when", "then", "with", "default", "straight_join", "partition", "pivot", "unpivot",
    "option", "lock", "top", "and", "or", "not", "by", "to",
];

/// Modifiers that may sit between a DDL verb and the object type.
const DDL_MODIFIERS: &[&str] = &[
    "or", "replace", "temporary", "temp", "global", "local", "unique", "clustered",
    "nonclustered", "materialized", "unlogged", "external", "virtual", "recursive", "definer",
];

/// Object types recognised after CREATE/DROP/ALTER/TRUNCATE.
const DDL_OBJECTS: &[&str] = &[
    "table", "view", "index", "database", "schema", "procedure", "proc", "function", "trigger",
    "sequence", "user", "role", "login", "type", "synonym", "extension", "event",
];

/// Classify every statement in `stmt`.
pub fn classify(stmt: &NormalizedStatement<'_>) -> Classification {
    let significant = stmt.significant_tokens();
    let mut statements = Vec::new();
    let mut findings = Vec::new();

    for group in significant.split(|t| t.kind == TokenKind::Separator) {
        if group.is_empty() {
            continue;
        }
        let info = Scanner::new(stmt, group).scan();
        if info.kind == StatementKind::Unknown {
            let reason = if info.leading_keyword.is_empty() {
                "Statement does not start with a keyword".to_string()
            } else {
                format!("Unrecognized leading keyword '{}'", info.leading_keyword)
            };
            findings.push(Finding::syntax(
                Severity::Warn,
                "unknown_statement",
                reason,
                group[0].span,
            ));
        }
        statements.push(info);
    }

    if statements.is_empty() {
        findings.push(Finding::syntax(
            Severity::Warn,
            "empty_statement",
            "Input contains no SQL statement",
            Span::new(0, stmt.source_len()),
        ));
    }

    Classification {
        kind: statements
            .first()
            .map(|s| s.kind)
            .unwrap_or(StatementKind::Unknown),
        is_multi_statement: statements.len() > 1,
        statements,
        findings,
    }
}

/// Single-statement scanner over significant tokens.
struct Scanner<'s, 'a> {
    stmt: &'s NormalizedStatement<'a>,
    tokens: &'s [Token],
    /// Parenthesis depth at each token.
    depth: Vec<usize>,
    /// Whether the innermost enclosing parenthesis (or the top level) is a
    /// query or a table group such as `FROM (a JOIN b ON ...)`, as opposed
    /// to a function call or value list.
    in_query: Vec<bool>,
}

impl<'s, 'a> Scanner<'s, 'a> {
    fn new(stmt: &'s NormalizedStatement<'a>, tokens: &'s [Token]) -> Self {
        let mut depth = Vec::with_capacity(tokens.len());
        let mut in_query = Vec::with_capacity(tokens.len());
        let mut stack = vec![true];

        for (i, token) in tokens.iter().enumerate() {
            let text = stmt.text(token);
            let is_symbol = token.kind == TokenKind::Symbol;
            if is_symbol && text == ")" && stack.len() > 1 {
                stack.pop();
            }
            let enclosing = stack.last().copied().unwrap_or(true);
            depth.push(stack.len() - 1);
            in_query.push(enclosing);
            if is_symbol && text == "(" {
                let opens_query = tokens
                    .get(i + 1)
                    .is_some_and(|next| matches!(stmt.text(next), "select" | "with"));
                let opens_group = enclosing
                    && i > 0
                    && match (tokens[i - 1].kind, stmt.text(&tokens[i - 1])) {
                        (TokenKind::Word, prev) => matches!(prev, "from" | "join" | "using"),
                        (TokenKind::Symbol, prev) => matches!(prev, "(" | ","),
                        _ => false,
                    };
                stack.push(opens_query || opens_group);
            }
        }

        Self {
            stmt,
            tokens,
            depth,
            in_query,
        }
    }

    fn text(&self, i: usize) -> &str {
        self.tokens.get(i).map(|t| self.stmt.text(t)).unwrap_or("")
    }

    fn is_word(&self, i: usize, word: &str) -> bool {
        self.tokens
            .get(i)
            .is_some_and(|t| t.kind == TokenKind::Word && self.stmt.text(t) == word)
    }

    fn is_symbol(&self, i: usize, symbol: &str) -> bool {
        self.tokens
            .get(i)
            .is_some_and(|t| t.kind == TokenKind::Symbol && self.stmt.text(t) == symbol)
    }

    /// Index of the `)` closing the `(` at `open`, or the end of the
    /// statement when it is unbalanced.
    fn group_end(&self, open: usize) -> usize {
        (open + 1..self.tokens.len())
            .find(|&j| self.depth[j] == self.depth[open] && self.is_symbol(j, ")"))
            .unwrap_or(self.tokens.len())
    }

    /// Reference standing in for a table source the scanner cannot name.
    fn unresolved_ref(&self, i: usize, clause: Clause) -> TableRef {
        let span = self
            .tokens
            .get(i)
            .map(|t| t.span)
            .unwrap_or_else(|| self.tokens[self.tokens.len() - 1].span);
        TableRef {
            name: QualifiedName::new(vec![String::new()]),
            clause,
            span,
            depth: self.depth.get(i).copied().unwrap_or(0),
            resolved: false,
        }
    }

    fn scan(&self) -> StatementInfo {
        let span = self.tokens[0].span.cover(self.tokens[self.tokens.len() - 1].span);

        // `(SELECT ...)` is still a SELECT.
        let mut lead = 0;
        while self.is_symbol(lead, "(") {
            lead += 1;
        }

        let leading_keyword = match self.tokens.get(lead) {
            Some(t) if t.kind == TokenKind::Word => self.stmt.text(t).to_string(),
            _ => String::new(),
        };

        let (kind, main, ctes) = if leading_keyword == "with" {
            self.resolve_cte(lead)
        } else {
            (
                StatementKind::from_keyword(&leading_keyword).unwrap_or(StatementKind::Unknown),
                lead,
                HashSet::new(),
            )
        };

        let has_where = (0..self.tokens.len())
            .any(|i| self.depth[i] == 0 && self.is_word(i, "where"));

        let mut refs = Vec::new();
        let mut implicit_join = false;
        if kind != StatementKind::Unknown {
            self.collect_refs(kind, main, &mut refs, &mut implicit_join);
        }
        refs.retain(|r: &TableRef| !(r.name.parts().len() == 1 && ctes.contains(r.name.object())));

        StatementInfo {
            kind,
            leading_keyword,
            span,
            has_where,
            table_refs: refs,
            implicit_join,
        }
    }

    /// Find the statement that follows a `WITH` prefix and the CTE names it
    /// defines.
    fn resolve_cte(&self, with_at: usize) -> (StatementKind, usize, HashSet<String>) {
        let mut ctes = HashSet::new();
        let base = self.depth[with_at];
        for i in with_at + 1..self.tokens.len() {
            if self.depth[i] != base {
                continue;
            }
            if self.is_word(i, "as") && self.is_symbol(i + 1, "(") && i > 0 {
                if let Some(prev) = self.tokens.get(i - 1) {
                    if matches!(prev.kind, TokenKind::Word | TokenKind::QuotedIdentifier) {
                        ctes.insert(unquote_identifier(self.stmt.text(prev)));
                    }
                }
                continue;
            }
            if let Some(t) = self.tokens.get(i) {
                if t.kind == TokenKind::Word {
                    match StatementKind::from_keyword(self.stmt.text(t)) {
                        Some(
                            kind @ (StatementKind::Select
                            | StatementKind::Insert
                            | StatementKind::Update
                            | StatementKind::Delete
                            | StatementKind::Merge),
                        ) => return (kind, i, ctes),
                        _ => {}
                    }
                }
            }
        }
        (StatementKind::Unknown, with_at, ctes)
    }

    fn collect_refs(
        &self,
        kind: StatementKind,
        main: usize,
        refs: &mut Vec<TableRef>,
        implicit_join: &mut bool,
    ) {
        match kind {
            StatementKind::Create
            | StatementKind::Drop
            | StatementKind::Alter
            | StatementKind::Truncate => self.ddl_target(main, refs),
            StatementKind::Grant | StatementKind::Revoke => {
                self.dcl_target(main, refs);
                return;
            }
            StatementKind::Execute => {
                self.procedure_target(main, refs);
                return;
            }
            _ => {}
        }

        let mut seen_delete_from = false;
        for i in 0..self.tokens.len() {
            if self.tokens[i].kind != TokenKind::Word || !self.in_query[i] {
                continue;
            }
            match self.text(i) {
                // `IS DISTINCT FROM`
                "from" if i > 0 && self.is_word(i - 1, "distinct") => {}
                "from" => {
                    let clause = if kind == StatementKind::Delete
                        && !seen_delete_from
                        && i == main + 1
                    {
                        seen_delete_from = true;
                        Clause::DeleteFrom
                    } else {
                        Clause::From
                    };
                    let (items, comma) = self.table_list(i + 1, clause, true, refs);
                    *implicit_join |= comma;
                    self.require_source(items, i + 1, clause, refs);
                }
                "join" => {
                    let (items, _) = self.table_list(i + 1, Clause::Join, false, refs);
                    self.require_source(items, i + 1, Clause::Join, refs);
                }
                // `MERGE INTO t USING (source) s`, but not `JOIN ... USING (col)`.
                "using"
                    if !self.is_symbol(i + 1, "(")
                        || (kind == StatementKind::Merge && self.depth[i] == 0) =>
                {
                    let (items, _) = self.table_list(i + 1, Clause::Using, false, refs);
                    self.require_source(items, i + 1, Clause::Using, refs);
                }
                "update" if i == main => {
                    *implicit_join |= self.table_list(i + 1, Clause::Update, true, refs).1;
                }
                "delete" if i == main && !self.is_word(i + 1, "from") => {
                    *implicit_join |= self.table_list(i + 1, Clause::DeleteFrom, true, refs).1;
                }
                "into" => {
                    let next = self.text(i + 1);
                    if !matches!(next, "outfile" | "dumpfile") && !next.starts_with('@') {
                        self.table_list(i + 1, Clause::Into, false, refs);
                    }
                }
                _ => {}
            }
        }
    }

    /// A source clause that names nothing readable still needs a check.
    fn require_source(&self, items: usize, at: usize, clause: Clause, refs: &mut Vec<TableRef>) {
        if items == 0 && at < self.tokens.len() {
            refs.push(self.unresolved_ref(at, clause));
        }
    }

    fn ddl_target(&self, main: usize, refs: &mut Vec<TableRef>) {
        let mut i = main + 1;
        while DDL_MODIFIERS.contains(&self.text(i)) {
            i += 1;
        }
        if DDL_OBJECTS.contains(&self.text(i)) {
            i += 1;
        }
        if self.is_word(i, "if") {
            i += 1;
            if self.is_word(i, "not") {
                i += 1;
            }
            if self.is_word(i, "exists") {
                i += 1;
            }
        }
        self.table_list(i, Clause::Target, true, refs);
    }

    fn dcl_target(&self, main: usize, refs: &mut Vec<TableRef>) {
        let Some(on) = (main + 1..self.tokens.len())
            .find(|&i| self.depth[i] == 0 && self.is_word(i, "on"))
        else {
            return;
        };
        let mut i = on + 1;
        if matches!(self.text(i), "table" | "object" | "schema" | "database") {
            i += 1;
            // SQL Server: `ON OBJECT::dbo.t`
            while self.text(i) == ":" {
                i += 1;
            }
        }
        self.table_list(i, Clause::Target, false, refs);
    }

    fn procedure_target(&self, main: usize, refs: &mut Vec<TableRef>) {
        let mut i = main + 1;
        // `EXEC @rc = proc`
        if self.text(i).starts_with('@') && self.text(i + 1) == "=" {
            i += 2;
        }
        self.table_list(i, Clause::Procedure, false, refs);
    }

    /// Read one table source, or a comma list when `list` is set, starting
    /// at `start`. Returns the number of sources read and whether a comma
    /// list was seen.
    ///
    /// In a source clause a parenthesized table group is read recursively;
    /// joins inside it are picked up by the main scan. A group that yields no
    /// name is recorded as unresolved.
    fn table_list(
        &self,
        start: usize,
        clause: Clause,
        list: bool,
        refs: &mut Vec<TableRef>,
    ) -> (usize, bool) {
        let mut i = start;
        let mut items = 0;
        let mut seen_comma = false;
        loop {
            while matches!(self.text(i), "only" | "lateral") {
                i += 1;
            }
            if clause.is_source() && self.is_symbol(i, "(") {
                let end = self.group_end(i);
                let subquery = matches!(self.text(i + 1), "select" | "with");
                if !subquery {
                    let before = refs.len();
                    self.table_list(i + 1, clause, true, refs);
                    if refs.len() == before {
                        refs.push(self.unresolved_ref(i, clause));
                    }
                }
                items += 1;
                i = self.skip_alias(end + 1);
            } else {
                let Some((table, next)) = self.read_name(i, clause) else {
                    break;
                };
                refs.push(table);
                items += 1;
                i = self.skip_alias(next);
            }
            if list && self.is_symbol(i, ",") {
                seen_comma = true;
                i += 1;
                continue;
            }
            break;
        }
        (items, seen_comma)
    }

    /// Read a possibly dotted name starting at `i`.
    fn read_name(&self, i: usize, clause: Clause) -> Option<(TableRef, usize)> {
        let first = self.tokens.get(i)?;
        let mut parts = Vec::new();
        let mut resolved = true;
        let mut span = first.span;
        let mut pos = i;

        loop {
            let token = self.tokens.get(pos)?;
            match token.kind {
                TokenKind::Word => {
                    let text = self.stmt.text(token);
                    if parts.is_empty() && STOP_WORDS.contains(&text) {
                        return None;
                    }
                    parts.push(text.to_string());
                }
                TokenKind::QuotedIdentifier => parts.push(unquote_identifier(self.stmt.text(token))),
                TokenKind::Literal(idx)
                    if self.stmt.literals()[idx].kind == LiteralKind::DoubleQuoted =>
                {
                    // Redacted: the name cannot be checked.
                    resolved = false;
                    parts.push(String::new());
                }
                _ if !parts.is_empty() => {
                    // Trailing dot such as `db..t`: an empty part.
                    parts.push(String::new());
                    break;
                }
                _ => return None,
            }
            span = span.cover(token.span);
            pos += 1;
            if self.is_symbol(pos, ".") {
                pos += 1;
                continue;
            }
            break;
        }

        let table = TableRef {
            name: QualifiedName::new(parts),
            clause,
            span,
            depth: self.depth[i],
            resolved,
        };
        Some((table, pos))
    }

    fn skip_alias(&self, mut i: usize) -> usize {
        if self.is_word(i, "as") {
            return i + 2;
        }
        if let Some(t) = self.tokens.get(i) {
            let is_alias = match t.kind {
                TokenKind::Word => !STOP_WORDS.contains(&self.stmt.text(t)),
                TokenKind::QuotedIdentifier => true,
                _ => false,
            };
            if is_alias {
                i += 1;
            }
        }
        i
    }
}
