//! SQL tokenizer and normalizer.
//!
//! Splits raw SQL into a flat token stream in one left-to-right pass. String
//! literals and comments become *literal spans*: their contents are replaced by
//! placeholders in the normalized text, so detectors and the content hash never
//! see them. Everything else is ASCII-lowercased in place, which keeps every
//! token the same length in both texts.
//!
//! Every byte of the input belongs to exactly one token, and literal spans
//! never overlap.

use super::finding::{Finding, Severity, Span};
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Placeholder written into the normalized text for a single-quoted literal.
pub const STRING_PLACEHOLDER: &str = "'?'";
/// Placeholder for a double-quoted literal.
pub const QUOTED_PLACEHOLDER: &str = "\"?\"";
/// Placeholder for a `--` line comment.
pub const LINE_COMMENT_PLACEHOLDER: &str = "--?";
/// Placeholder for a `/* */` block comment.
pub const BLOCK_COMMENT_PLACEHOLDER: &str = "/*?*/";

/// Hex characters of the literal digest kept in audit records.
const DIGEST_PREFIX_LEN: usize = 12;

/// Lexical token category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Keyword or bare identifier.
    Word,
    /// `[name]` or `` `name` `` identifier.
    QuotedIdentifier,
    Number,
    /// String literal; index into [`NormalizedStatement::literals`].
    Literal(usize),
    /// Comment; index into [`NormalizedStatement::literals`].
    Comment(usize),
    /// Run of comparison characters (`=`, `<>`, `!=`, `>=`, `||`).
    Operator,
    /// Any other single punctuation character.
    Symbol,
    /// `;`
    Separator,
    Whitespace,
}

/// One token with its range in both the original and the normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub norm: Span,
}

impl Token {
    /// Whether the token takes part in statement structure.
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment(_))
    }
}

/// Kind of redacted span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralKind {
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

impl LiteralKind {
    pub fn is_comment(&self) -> bool {
        matches!(self, LiteralKind::LineComment | LiteralKind::BlockComment)
    }

    fn placeholder(&self) -> &'static str {
        match self {
            LiteralKind::SingleQuoted => STRING_PLACEHOLDER,
            LiteralKind::DoubleQuoted => QUOTED_PLACEHOLDER,
            LiteralKind::LineComment => LINE_COMMENT_PLACEHOLDER,
            LiteralKind::BlockComment => BLOCK_COMMENT_PLACEHOLDER,
        }
    }
}

/// Redacted description of a literal or comment.
///
/// Only the length and a truncated HMAC-SHA256 digest under a per-process
/// key survive; the contents stay in the borrowed source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralSpan {
    pub kind: LiteralKind,
    pub span: Span,
    /// Length of the contents in characters, delimiters excluded.
    pub char_len: usize,
    pub digest: String,
    pub terminated: bool,
}

/// Tokenizer switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerOptions {
    /// Treat `\` as an escape character inside quoted literals (MySQL style).
    ///
    /// Off by default: when the target database does not honour backslash
    /// escapes, honouring them here would hide the tail of an injected string.
    pub backslash_escapes: bool,
}

/// Token stream plus redacted literal spans for one statement text.
#[derive(Debug, Clone)]
pub struct NormalizedStatement<'a> {
    source: &'a str,
    normalized: String,
    tokens: Vec<Token>,
    literals: Vec<LiteralSpan>,
    findings: Vec<Finding>,
}

impl<'a> NormalizedStatement<'a> {
    /// Tokenize with default options.
    pub fn parse(source: &'a str) -> Self {
        Self::parse_with(source, TokenizerOptions::default())
    }

    /// Tokenize `source`. Never fails; unterminated literals and comments
    /// produce a blocking `syntax_error` finding and run to end of input.
    pub fn parse_with(source: &'a str, options: TokenizerOptions) -> Self {
        Lexer::new(source, options).run()
    }

    pub fn source_len(&self) -> usize {
        self.source.len()
    }

    /// Lowercased text with literal placeholders.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn literals(&self) -> &[LiteralSpan] {
        &self.literals
    }

    /// Findings raised while tokenizing.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Normalized text of a token.
    pub fn text(&self, token: &Token) -> &str {
        &self.normalized[token.norm.start..token.norm.end]
    }

    /// Tokens that are neither whitespace nor comments.
    pub fn significant_tokens(&self) -> Vec<Token> {
        self.tokens
            .iter()
            .copied()
            .filter(Token::is_significant)
            .collect()
    }

    /// Original text of a literal span, delimiters included.
    ///
    /// Only for in-process comparisons; never log or persist the result.
    pub(crate) fn literal_source(&self, index: usize) -> &'a str {
        let span = self.literals[index].span;
        &self.source[span.start..span.end]
    }

    /// Map a range of the normalized text back onto the original text.
    pub fn original_span(&self, norm: Span) -> Span {
        let start_token = self.token_index_at(norm.start);
        let end_token = self.token_index_at(norm.end.saturating_sub(1).max(norm.start));
        match (start_token, end_token) {
            (Some(first), Some(last)) => self.tokens[first].span.cover(self.tokens[last].span),
            _ => Span::new(self.source.len(), self.source.len()),
        }
    }

    fn token_index_at(&self, norm_offset: usize) -> Option<usize> {
        let idx = self
            .tokens
            .partition_point(|t| t.norm.end <= norm_offset);
        (idx < self.tokens.len()).then_some(idx)
    }

    /// Significant tokens joined by single spaces. Literal contents are
    /// already placeholders, so structurally identical queries agree.
    pub fn canonical_form(&self) -> String {
        let mut out = String::with_capacity(self.normalized.len());
        for token in self.tokens.iter().filter(|t| t.is_significant()) {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(self.text(token));
        }
        out
    }

    /// `sha256:<hex>` over [`canonical_form`](Self::canonical_form).
    pub fn content_hash(&self) -> String {
        format!("sha256:{:x}", Sha256::digest(self.canonical_form().as_bytes()))
    }
}

/// Keyed once per process; literal digests only correlate within one run.
static DIGEST_MAC: Lazy<HmacSha256> = Lazy::new(|| {
    let key: [u8; 32] = rand::random();
    HmacSha256::new_from_slice(&key)
        .unwrap_or_else(|e| panic!("Internal error: invalid digest key: {}", e))
});

/// Digest prefix for a literal's contents.
fn literal_digest(contents: &str) -> String {
    let mut mac = DIGEST_MAC.clone();
    mac.update(contents.as_bytes());
    let mut hex = format!("{:x}", mac.finalize().into_bytes());
    hex.truncate(DIGEST_PREFIX_LEN);
    hex
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || matches!(b, b'_' | b'@' | b'#' | b'$') || b >= 0x80
}

fn is_word_char(b: u8) -> bool {
    is_word_start(b) || b.is_ascii_digit()
}

fn is_operator_char(b: u8) -> bool {
    matches!(b, b'=' | b'<' | b'>' | b'!' | b'|')
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    options: TokenizerOptions,
    normalized: String,
    tokens: Vec<Token>,
    literals: Vec<LiteralSpan>,
    findings: Vec<Finding>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, options: TokenizerOptions) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            options,
            normalized: String::with_capacity(source.len()),
            tokens: Vec::new(),
            literals: Vec::new(),
            findings: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn run(mut self) -> NormalizedStatement<'a> {
        while let Some(b) = self.peek(0) {
            let start = self.pos;
            match b {
                b'\'' => self.quoted_literal(LiteralKind::SingleQuoted, b'\''),
                b'"' => self.quoted_literal(LiteralKind::DoubleQuoted, b'"'),
                b'-' if self.peek(1) == Some(b'-') => self.line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.block_comment(),
                b'`' => self.quoted_identifier(b'`'),
                b'[' => self.quoted_identifier(b']'),
                b';' => {
                    self.pos += 1;
                    self.push_plain(TokenKind::Separator, start);
                }
                b if b.is_ascii_whitespace() => {
                    self.advance_while(|c| c.is_ascii_whitespace());
                    self.push_plain(TokenKind::Whitespace, start);
                }
                b if b.is_ascii_digit() => self.number(),
                b'.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.number(),
                b if is_word_start(b) => {
                    self.advance_while(is_word_char);
                    self.push_plain(TokenKind::Word, start);
                }
                b if is_operator_char(b) => {
                    self.advance_while(is_operator_char);
                    self.push_plain(TokenKind::Operator, start);
                }
                _ => {
                    self.pos += 1;
                    self.push_plain(TokenKind::Symbol, start);
                }
            }
        }

        NormalizedStatement {
            source: self.source,
            normalized: self.normalized,
            tokens: self.tokens,
            literals: self.literals,
            findings: self.findings,
        }
    }

    fn advance_while(&mut self, pred: impl Fn(u8) -> bool) {
        while self.peek(0).is_some_and(&pred) {
            self.pos += 1;
        }
    }

    /// Push a token whose normalized text is its lowercased source text.
    fn push_plain(&mut self, kind: TokenKind, start: usize) {
        let norm_start = self.normalized.len();
        let text = &self.source[start..self.pos];
        self.normalized.push_str(&text.to_ascii_lowercase());
        self.tokens.push(Token {
            kind,
            span: Span::new(start, self.pos),
            norm: Span::new(norm_start, self.normalized.len()),
        });
    }

    fn number(&mut self) {
        let start = self.pos;
        if self.peek(0) == Some(b'0') && matches!(self.peek(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            self.advance_while(|c| c.is_ascii_hexdigit());
        } else {
            self.advance_while(|c| c.is_ascii_digit());
            if self.peek(0) == Some(b'.') {
                self.pos += 1;
                self.advance_while(|c| c.is_ascii_digit());
            }
            if matches!(self.peek(0), Some(b'e') | Some(b'E')) {
                let sign = usize::from(matches!(self.peek(1), Some(b'+') | Some(b'-')));
                if self.peek(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1 + sign;
                    self.advance_while(|c| c.is_ascii_digit());
                }
            }
        }

        // MySQL allows identifiers such as `1st_quarter`.
        if self.peek(0).is_some_and(is_word_char) {
            self.advance_while(is_word_char);
            self.push_plain(TokenKind::Word, start);
        } else {
            self.push_plain(TokenKind::Number, start);
        }
    }

    fn quoted_literal(&mut self, kind: LiteralKind, quote: u8) {
        let start = self.pos;
        self.pos += 1;
        let mut terminated = false;

        while let Some(b) = self.peek(0) {
            if b == b'\\' && self.options.backslash_escapes {
                self.pos = (self.pos + 2).min(self.bytes.len());
                continue;
            }
            if b == quote {
                if self.peek(1) == Some(quote) {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                terminated = true;
                break;
            }
            self.pos += 1;
        }

        let content_end = if terminated { self.pos - 1 } else { self.pos };
        let contents = &self.source[start + 1..content_end];
        if !terminated {
            self.findings.push(Finding::syntax(
                Severity::Block,
                "unterminated_literal",
                "Unterminated quoted literal",
                Span::new(start, self.pos),
            ));
        }
        let index = self.push_literal(kind, start, contents, terminated);
        self.push_redacted(TokenKind::Literal(index), kind, start);
    }

    fn line_comment(&mut self) {
        let start = self.pos;
        self.advance_while(|c| c != b'\n');
        let contents = &self.source[start + 2..self.pos];
        let index = self.push_literal(LiteralKind::LineComment, start, contents, true);
        self.push_redacted(TokenKind::Comment(index), LiteralKind::LineComment, start);
    }

    fn block_comment(&mut self) {
        let start = self.pos;
        self.pos += 2;
        let mut terminated = false;
        while self.pos < self.bytes.len() {
            if self.peek(0) == Some(b'*') && self.peek(1) == Some(b'/') {
                self.pos += 2;
                terminated = true;
                break;
            }
            self.pos += 1;
        }

        let content_end = if terminated { self.pos - 2 } else { self.pos };
        let contents = &self.source[start + 2..content_end.max(start + 2)];
        if !terminated {
            self.findings.push(Finding::syntax(
                Severity::Block,
                "unterminated_comment",
                "Unterminated block comment",
                Span::new(start, self.pos),
            ));
        }
        let index = self.push_literal(LiteralKind::BlockComment, start, contents, terminated);
        self.push_redacted(TokenKind::Comment(index), LiteralKind::BlockComment, start);
    }

    fn quoted_identifier(&mut self, close: u8) {
        let start = self.pos;
        self.pos += 1;
        let mut terminated = false;
        while let Some(b) = self.peek(0) {
            if b == close {
                if self.peek(1) == Some(close) {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                terminated = true;
                break;
            }
            self.pos += 1;
        }
        if !terminated {
            self.findings.push(Finding::syntax(
                Severity::Block,
                "unterminated_identifier",
                "Unterminated quoted identifier",
                Span::new(start, self.pos),
            ));
        }
        self.push_plain(TokenKind::QuotedIdentifier, start);
    }

    fn push_literal(
        &mut self,
        kind: LiteralKind,
        start: usize,
        contents: &str,
        terminated: bool,
    ) -> usize {
        self.literals.push(LiteralSpan {
            kind,
            span: Span::new(start, self.pos),
            char_len: contents.chars().count(),
            digest: literal_digest(contents),
            terminated,
        });
        self.literals.len() - 1
    }

    fn push_redacted(&mut self, token_kind: TokenKind, kind: LiteralKind, start: usize) {
        let norm_start = self.normalized.len();
        self.normalized.push_str(kind.placeholder());
        self.tokens.push(Token {
            kind: token_kind,
            span: Span::new(start, self.pos),
            norm: Span::new(norm_start, self.normalized.len()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(stmt: &NormalizedStatement<'_>) -> Vec<TokenKind> {
        stmt.significant_tokens().iter().map(|t| t.kind).collect()
    }

    fn assert_full_coverage(sql: &str) {
        let stmt = NormalizedStatement::parse(sql);
        let mut expected = 0;
        for token in stmt.tokens() {
            assert_eq!(token.span.start, expected, "gap before token in {sql:?}");
            assert!(token.span.end > token.span.start);
            expected = token.span.end;
        }
        assert_eq!(expected, sql.len());
        for pair in stmt.literals().windows(2) {
            assert!(pair[0].span.end <= pair[1].span.start);
        }
    }

    #[test]
    fn test_literal_digest_is_keyed() {
        let a = NormalizedStatement::parse("SELECT 1 FROM t WHERE pin = '1234'");
        let b = NormalizedStatement::parse("SELECT 2 FROM u WHERE code = '1234'");
        let c = NormalizedStatement::parse("SELECT 1 FROM t WHERE pin = '1235'");
        let digest = &a.literals()[0].digest;
        assert_eq!(digest, &b.literals()[0].digest);
        assert_ne!(digest, &c.literals()[0].digest);

        let mut unkeyed = format!("{:x}", Sha256::digest(b"1234"));
        unkeyed.truncate(DIGEST_PREFIX_LEN);
        assert_ne!(digest, &unkeyed);
    }

    #[test]
    fn test_lowercases_and_redacts() {
        let stmt = NormalizedStatement::parse("SELECT Name FROM Users WHERE pw = 'Hunter2'");
        assert_eq!(
            stmt.normalized(),
            "select name from users where pw = '?'"
        );
        assert_eq!(stmt.literals().len(), 1);
        let lit = &stmt.literals()[0];
        assert_eq!(lit.kind, LiteralKind::SingleQuoted);
        assert_eq!(lit.char_len, 7);
        assert_eq!(lit.digest.len(), DIGEST_PREFIX_LEN);
        assert!(lit.terminated);
        assert!(stmt.findings().is_empty());
    }

    #[test]
    fn test_doubled_quote_escape() {
        let stmt = NormalizedStatement::parse("SELECT 'it''s' , 1");
        assert_eq!(stmt.literals().len(), 1);
        assert_eq!(stmt.normalized(), "select '?' , 1");
    }

    #[test]
    fn test_backslash_escape_is_optional() {
        let sql = r"SELECT 'a\' OR 1=1 -- '";
        let plain = NormalizedStatement::parse(sql);
        assert!(plain.normalized().contains("or 1=1"));

        let mysql = NormalizedStatement::parse_with(
            sql,
            TokenizerOptions {
                backslash_escapes: true,
            },
        );
        assert_eq!(mysql.normalized(), "select '?'");
    }

    #[test]
    fn test_comments_become_placeholders() {
        let stmt = NormalizedStatement::parse("SELECT 1 -- secret\n/* note */ FROM t");
        assert_eq!(stmt.normalized(), "select 1 --?\n/*?*/ from t");
        assert!(stmt.literals().iter().all(|l| l.kind.is_comment()));
        assert_eq!(
            kinds(&stmt),
            vec![
                TokenKind::Word,
                TokenKind::Number,
                TokenKind::Word,
                TokenKind::Word
            ]
        );
    }

    #[test]
    fn test_unterminated_string_reports_block() {
        let stmt = NormalizedStatement::parse("SELECT * FROM t WHERE a = 'open");
        assert_eq!(stmt.findings().len(), 1);
        assert_eq!(stmt.findings()[0].severity, Severity::Block);
        assert_eq!(stmt.findings()[0].rule, "unterminated_literal");
        assert!(!stmt.literals()[0].terminated);
        assert!(stmt.normalized().ends_with("'?'"));
    }

    #[test]
    fn test_unterminated_block_comment() {
        let stmt = NormalizedStatement::parse("SELECT 1 /* open");
        assert_eq!(stmt.findings()[0].rule, "unterminated_comment");
    }

    #[test]
    fn test_operators_and_identifiers() {
        let stmt = NormalizedStatement::parse("a<>b AND [My Table].`x`>=0x1F");
        let texts: Vec<&str> = stmt
            .significant_tokens()
            .iter()
            .map(|t| stmt.text(t))
            .collect();
        assert_eq!(
            texts,
            vec!["a", "<>", "b", "and", "[my table]", ".", "`x`", ">=", "0x1f"]
        );
    }

    #[test]
    fn test_digit_leading_identifier_is_word() {
        let stmt = NormalizedStatement::parse("SELECT 1st_col FROM t");
        assert_eq!(stmt.significant_tokens()[1].kind, TokenKind::Word);
    }

    #[test]
    fn test_full_coverage() {
        assert_full_coverage("SELECT * FROM users WHERE id = 1 OR 1=1");
        assert_full_coverage("SELECT 'a' -- c\n; DROP TABLE t; /* x */");
        assert_full_coverage("SELECT 'unterminated");
        assert_full_coverage("SELECT \"ÄÖÜ\", naïve FROM ü");
        assert_full_coverage("[unterminated");
        assert_full_coverage("");
    }

    #[test]
    fn test_original_span_mapping() {
        let sql = "SELECT 'secret value' OR 1=1";
        let stmt = NormalizedStatement::parse(sql);
        let norm = stmt.normalized();
        let at = norm.find("or").unwrap();
        let span = stmt.original_span(Span::new(at, at + 2));
        assert_eq!(&sql[span.start..span.end], "OR");
    }

    #[test]
    fn test_content_hash_ignores_literal_values_and_spacing() {
        let a = NormalizedStatement::parse("SELECT * FROM t WHERE name = 'alice'");
        let b = NormalizedStatement::parse("select *   from t\nwhere name = 'bob'");
        let c = NormalizedStatement::parse("SELECT * FROM t WHERE id = 'alice'");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert!(a.content_hash().starts_with("sha256:"));
    }
}
