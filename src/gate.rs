//! Safe query gate.
//!
//! The single choke point all ad-hoc query text passes through before it
//! reaches the [`RelationalStore`](crate::store::RelationalStore). Checks are
//! static: the text is tokenized (string literals, quoted identifiers and
//! comments are understood) and inspected, never executed.
//!
//! A statement is accepted when:
//!
//! 1. it is a single statement (a `;` is only tolerated at the very end),
//! 2. it starts with `SELECT` or `WITH`,
//! 3. it contains no data-definition or data-modification keyword,
//! 4. every table named after `FROM` / `JOIN` is allow-listed (or is a CTE
//!    defined by the statement itself).
//!
//! Accepted text is wrapped in an outer `SELECT * FROM (...) LIMIT n`, so the
//! row bound holds whatever the inner statement says.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// Keywords that may never appear as bare words in a query.
const FORBIDDEN: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "DROP",
    "CREATE",
    "ALTER",
    "REPLACE",
    "TRUNCATE",
    "ATTACH",
    "DETACH",
    "PRAGMA",
    "VACUUM",
    "REINDEX",
    "ANALYZE",
    "BEGIN",
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
    "RELEASE",
    "GRANT",
    "REVOKE",
    "MERGE",
    "UPSERT",
    "LOAD_EXTENSION",
];

/// Words that close the FROM clause of the current nesting level.
const FROM_END: &[&str] = &[
    "SELECT",
    "VALUES",
    "WHERE",
    "GROUP",
    "ORDER",
    "LIMIT",
    "HAVING",
    "WINDOW",
    "UNION",
    "EXCEPT",
    "INTERSECT",
];

/// Allow-list and row bound for one gate.
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    allowed_tables: BTreeSet<String>,
    max_rows: u32,
}

impl QueryPolicy {
    pub fn new<I, S>(allowed_tables: I, max_rows: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_tables: allowed_tables
                .into_iter()
                .map(|t| t.into().to_ascii_lowercase())
                .collect(),
            max_rows: max_rows.max(1),
        }
    }

    pub fn max_rows(&self) -> u32 {
        self.max_rows
    }

    pub fn allowed_tables(&self) -> impl Iterator<Item = &str> {
        self.allowed_tables.iter().map(|s| s.as_str())
    }

    pub fn is_allowed(&self, table: &str) -> bool {
        self.allowed_tables.contains(&table.to_ascii_lowercase())
    }

    /// Row bound actually applied for a caller's request.
    ///
    /// Absent or zero → `max_rows`; anything larger than `max_rows` is capped.
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(n) if n > 0 => n.min(self.max_rows),
            _ => self.max_rows,
        }
    }
}

/// A query that passed the gate. Only [`QueryGate::validate`] constructs it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    sql: String,
    statement: String,
    limit: u32,
    tables: Vec<String>,
}

impl ValidatedQuery {
    /// The bounded SQL that will be executed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The caller's statement, without trailing separators.
    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Allow-listed tables the statement reads from.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

#[derive(Debug, Clone)]
pub struct QueryGate {
    policy: QueryPolicy,
}

impl QueryGate {
    pub fn new(policy: QueryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Validate `raw` and bound it to the effective row limit.
    pub fn validate(&self, raw: &str, limit: Option<u32>) -> Result<ValidatedQuery> {
        if raw.trim().is_empty() {
            return Err(Error::unsafe_query("query must not be empty"));
        }

        let mut tokens = tokenize(raw)?;
        while matches!(tokens.last(), Some(t) if t.kind == Kind::Punct(';')) {
            tokens.pop();
        }
        if tokens.iter().any(|t| t.kind == Kind::Punct(';')) {
            return Err(Error::unsafe_query(
                "multiple statements are not allowed (statement separator ';' found)",
            ));
        }

        let first = tokens
            .first()
            .ok_or_else(|| Error::unsafe_query("query must not be empty"))?;
        if !(first.is_word("SELECT") || first.is_word("WITH")) {
            return Err(Error::unsafe_query(
                "only read-only SELECT statements are permitted",
            ));
        }

        check_forbidden(&tokens)?;

        let ctes = if first.is_word("WITH") {
            cte_names(&tokens)
        } else {
            BTreeSet::new()
        };
        let tables = self.referenced_tables(&tokens, &ctes)?;

        let end = tokens.last().map(|t| t.end).unwrap_or(raw.len());
        let statement = raw[..end].trim().to_string();
        let limit = self.policy.effective_limit(limit);
        let sql = format!("SELECT * FROM (\n{}\n) LIMIT {}", statement, limit);

        Ok(ValidatedQuery {
            sql,
            statement,
            limit,
            tables,
        })
    }

    /// Walk the statement by paren depth and check every table reference.
    ///
    /// Inside a FROM clause each `FROM`, `JOIN` or top-level `,` starts a
    /// reference, until a clause word or the closing `)` ends that clause.
    fn referenced_tables(&self, tokens: &[Token], ctes: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut tables = BTreeSet::new();
        // One entry per open paren: is that level inside a FROM clause?
        let mut in_from = vec![false];
        let mut expect_ref = false;
        let mut i = 0;

        while i < tokens.len() {
            let tok = &tokens[i];

            if expect_ref {
                expect_ref = false;
                if tok.kind == Kind::Punct('(') {
                    // Subquery, or a parenthesized join list.
                    let subquery = matches!(
                        tokens.get(i + 1),
                        Some(t) if t.is_word("SELECT") || t.is_word("WITH") || t.is_word("VALUES")
                    );
                    in_from.push(!subquery);
                    expect_ref = !subquery;
                    i += 1;
                } else {
                    i = self.table_ref(tokens, i, ctes, &mut tables)?;
                }
                continue;
            }

            match &tok.kind {
                Kind::Punct('(') => in_from.push(false),
                Kind::Punct(')') => {
                    in_from.pop();
                    if in_from.is_empty() {
                        return Err(Error::unsafe_query("unbalanced parentheses"));
                    }
                }
                Kind::Punct(',') => expect_ref = in_from.last().copied().unwrap_or(false),
                Kind::Word(word) => {
                    let opens = tok.is_word("JOIN")
                        || (tok.is_word("FROM") && !is_distinct_from(tokens, i));
                    if opens {
                        set_top(&mut in_from, true);
                        expect_ref = true;
                    } else if FROM_END.iter().any(|k| word.eq_ignore_ascii_case(k)) {
                        set_top(&mut in_from, false);
                    }
                }
                _ => {}
            }
            i += 1;
        }

        if expect_ref {
            return Err(Error::unsafe_query("missing table name after FROM/JOIN"));
        }
        if in_from.len() != 1 {
            return Err(Error::unsafe_query("unbalanced parentheses"));
        }
        Ok(tables.into_iter().collect())
    }

    /// Check one named table reference at `i`; returns the index after the name.
    /// Aliases and `INDEXED BY` / `NOT INDEXED` qualifiers are left to the scan.
    fn table_ref(
        &self,
        tokens: &[Token],
        mut i: usize,
        ctes: &BTreeSet<String>,
        tables: &mut BTreeSet<String>,
    ) -> Result<usize> {
        let mut name = tokens
            .get(i)
            .and_then(|t| t.ident())
            .ok_or_else(|| Error::unsafe_query("expected a table name after FROM/JOIN"))?;
        i += 1;

        if matches!(tokens.get(i), Some(t) if t.kind == Kind::Punct('.')) {
            let schema = name;
            if schema != "main" {
                return Err(Error::unsafe_query(format!(
                    "schema '{}' is not accessible",
                    schema
                )));
            }
            name = tokens
                .get(i + 1)
                .and_then(|t| t.ident())
                .ok_or_else(|| Error::unsafe_query("expected a table name after 'main.'"))?;
            i += 2;
        }

        if matches!(tokens.get(i), Some(t) if t.kind == Kind::Punct('(')) {
            return Err(Error::unsafe_query(format!(
                "table-valued function '{}' is not allowed",
                name
            )));
        }

        if ctes.contains(&name) {
            // Defined by the statement itself; its body was checked by the scan.
        } else if self.policy.is_allowed(&name) {
            tables.insert(name);
        } else {
            return Err(Error::unsafe_query(format!(
                "table '{}' is not in the allow-list ({})",
                name,
                self.policy.allowed_tables().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(i)
    }
}

fn set_top(stack: &mut [bool], value: bool) {
    if let Some(top) = stack.last_mut() {
        *top = value;
    }
}

fn check_forbidden(tokens: &[Token]) -> Result<()> {
    for (idx, tok) in tokens.iter().enumerate() {
        let Kind::Word(word) = &tok.kind else {
            continue;
        };
        let upper = word.to_ascii_uppercase();
        if !FORBIDDEN.contains(&upper.as_str()) {
            continue;
        }
        // replace(x, y, z) is a scalar function.
        let is_call = matches!(tokens.get(idx + 1), Some(t) if t.kind == Kind::Punct('('));
        if upper == "REPLACE" && is_call {
            continue;
        }
        return Err(Error::unsafe_query(format!(
            "forbidden keyword '{}': only read-only queries are permitted",
            upper
        )));
    }
    Ok(())
}

/// Names defined by a leading `WITH [RECURSIVE] name [(cols)] AS (...) , ...`.
fn cte_names(tokens: &[Token]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut i = 1;
    if matches!(tokens.get(i), Some(t) if t.is_word("RECURSIVE")) {
        i += 1;
    }
    while let Some(name) = tokens.get(i).and_then(|t| t.ident()) {
        i += 1;
        if matches!(tokens.get(i), Some(t) if t.kind == Kind::Punct('(')) {
            i = skip_parens(tokens, i) + 1;
        }
        if !matches!(tokens.get(i), Some(t) if t.is_word("AS")) {
            break;
        }
        i += 1;
        while matches!(tokens.get(i), Some(t) if t.is_word("NOT") || t.is_word("MATERIALIZED")) {
            i += 1;
        }
        if !matches!(tokens.get(i), Some(t) if t.kind == Kind::Punct('(')) {
            break;
        }
        names.insert(name);
        i = skip_parens(tokens, i) + 1;
        if matches!(tokens.get(i), Some(t) if t.kind == Kind::Punct(',')) {
            i += 1;
        } else {
            break;
        }
    }
    names
}

/// `IS [NOT] DISTINCT FROM` uses FROM as an operator, not a clause.
fn is_distinct_from(tokens: &[Token], from_idx: usize) -> bool {
    from_idx > 0 && tokens[from_idx - 1].is_word("DISTINCT")
}

/// Index of the `)` matching the `(` at `open`, or the last index if unbalanced.
fn skip_parens(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (idx, tok) in tokens.iter().enumerate().skip(open) {
        match tok.kind {
            Kind::Punct('(') => depth += 1,
            Kind::Punct(')') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return idx;
                }
            }
            _ => {}
        }
    }
    tokens.len().saturating_sub(1)
}

// ============ Tokenizer ============

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// Bare identifier or keyword.
    Word(String),
    /// `"ident"`, `` `ident` `` or `[ident]`.
    Quoted(String),
    /// String, blob or numeric literal.
    Literal,
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: Kind,
    /// Byte offset just past the token in the source text.
    end: usize,
}

impl Token {
    fn is_word(&self, keyword: &str) -> bool {
        matches!(&self.kind, Kind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    /// Identifier value, lowercased for comparison.
    fn ident(&self) -> Option<String> {
        match &self.kind {
            Kind::Word(w) | Kind::Quoted(w) => Some(w.to_ascii_lowercase()),
            _ => None,
        }
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let offset = |idx: usize| chars.get(idx).map(|(o, _)| *o).unwrap_or(sql.len());
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i].1;
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(Error::unsafe_query("unterminated block comment"));
                }
                if chars[i].1 == '*' && chars[i + 1].1 == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
        } else if c == '\'' {
            i = scan_quoted(&chars, i, '\'')
                .ok_or_else(|| Error::unsafe_query("unterminated string literal"))?;
            tokens.push(Token {
                kind: Kind::Literal,
                end: offset(i),
            });
        } else if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { ']' } else { c };
            let start = i;
            i = scan_quoted(&chars, i, close)
                .ok_or_else(|| Error::unsafe_query("unterminated quoted identifier"))?;
            let inner: String = chars[start + 1..i - 1].iter().map(|(_, c)| *c).collect();
            let doubled: String = [close, close].iter().collect();
            tokens.push(Token {
                kind: Kind::Quoted(inner.replace(&doubled, &close.to_string())),
                end: offset(i),
            });
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '.') {
                i += 1;
            }
            tokens.push(Token {
                kind: Kind::Literal,
                end: offset(i),
            });
        } else if c.is_alphanumeric() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: Kind::Word(word),
                end: offset(i),
            });
        } else {
            i += 1;
            tokens.push(Token {
                kind: Kind::Punct(c),
                end: offset(i),
            });
        }
    }

    Ok(tokens)
}

/// Scan a quoted run opened at `start`; a doubled closing char is an escape.
/// Returns the index just past the closing char.
fn scan_quoted(chars: &[(usize, char)], start: usize, close: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i].1 == close {
            if close != ']' && chars.get(i + 1).map(|(_, c)| *c) == Some(close) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> QueryGate {
        QueryGate::new(QueryPolicy::new(
            ["blocks", "legislators", "issues", "votes"],
            100,
        ))
    }

    fn rejected(sql: &str) -> String {
        match gate().validate(sql, None) {
            Err(Error::UnsafeQuery { reason }) => reason,
            other => panic!("expected UnsafeQuery for {:?}, got {:?}", sql, other),
        }
    }

    #[test]
    fn test_accepts_simple_select() {
        let q = gate().validate("SELECT * FROM votes", Some(10)).unwrap();
        assert_eq!(q.limit(), 10);
        assert_eq!(q.tables(), &["votes".to_string()]);
        assert_eq!(q.sql(), "SELECT * FROM (\nSELECT * FROM votes\n) LIMIT 10");
    }

    #[test]
    fn test_multi_statement_injection_rejected() {
        let reason = rejected("SELECT * FROM votes; DROP TABLE votes;");
        assert!(reason.contains("multiple statements"), "{}", reason);
    }

    #[test]
    fn test_trailing_semicolon_tolerated() {
        let q = gate().validate("SELECT id FROM issues ;  ", None).unwrap();
        assert_eq!(q.statement(), "SELECT id FROM issues");
    }

    #[test]
    fn test_semicolon_inside_literal_is_not_a_separator() {
        let q = gate()
            .validate("SELECT * FROM issues WHERE title = 'a; DROP TABLE votes'", None)
            .unwrap();
        assert_eq!(q.tables(), &["issues".to_string()]);
    }

    #[test]
    fn test_forbidden_keywords_rejected() {
        for sql in [
            "DELETE FROM votes",
            "UPDATE votes SET choice = 'negative'",
            "INSERT INTO votes VALUES (1)",
            "DROP TABLE votes",
            "CREATE TABLE x (id INTEGER)",
            "ALTER TABLE votes ADD COLUMN x",
            "PRAGMA table_info(votes)",
            "ATTACH DATABASE 'x.db' AS x",
            "VACUUM",
            "SELECT * FROM votes WHERE id IN (DELETE FROM votes RETURNING id)",
            "WITH x AS (SELECT 1) DELETE FROM votes",
            "select * from votes where 1 = 1 and drop",
        ] {
            rejected(sql);
        }
    }

    #[test]
    fn test_keywords_in_literals_and_comments_are_ignored() {
        gate()
            .validate("SELECT * FROM issues WHERE summary LIKE '%delete%' -- drop", None)
            .unwrap();
        gate()
            .validate("SELECT /* update */ name FROM legislators", None)
            .unwrap();
    }

    #[test]
    fn test_replace_function_allowed() {
        gate()
            .validate("SELECT replace(name, 'a', 'b') FROM legislators", None)
            .unwrap();
    }

    #[test]
    fn test_tables_outside_allow_list_rejected() {
        for sql in [
            "SELECT * FROM collections",
            "SELECT * FROM semantic_records",
            "SELECT name FROM sqlite_master",
            "SELECT * FROM votes JOIN secrets ON 1 = 1",
            "SELECT * FROM votes, secrets",
            "SELECT * FROM (SELECT * FROM sqlite_schema)",
            "SELECT * FROM \"collections\"",
            "SELECT * FROM pragma_table_info('votes')",
            "SELECT * FROM temp.votes",
            "SELECT name FROM (SELECT 1) t, sqlite_master",
            "SELECT * FROM (SELECT 1) AS t, pragma_table_info('semantic_records')",
            "SELECT s.name FROM votes JOIN issues ON 1=1, sqlite_master s",
            "SELECT s.name, s.sql FROM blocks NOT INDEXED, sqlite_master s",
            "SELECT * FROM blocks INDEXED BY idx_blocks_chamber, collections",
            "SELECT * FROM (blocks, sqlite_master)",
            "SELECT * FROM (SELECT id FROM votes) v LEFT JOIN semantic_records r ON 1=1",
            "SELECT 1 FROM blocks) , sqlite_master, (SELECT 1",
            "SELECT (1 FROM blocks",
            "SELECT * FROM",
        ] {
            rejected(sql);
        }
    }

    #[test]
    fn test_policy_with_smaller_allow_list() {
        let narrow = QueryGate::new(QueryPolicy::new(["issues"], 5));
        assert!(narrow.validate("SELECT * FROM issues", None).is_ok());
        assert!(matches!(
            narrow.validate("SELECT * FROM votes", None),
            Err(Error::UnsafeQuery { .. })
        ));
        // The default gate is unaffected.
        assert!(gate().validate("SELECT * FROM votes", None).is_ok());
    }

    #[test]
    fn test_joins_aliases_and_schema_prefix() {
        let q = gate()
            .validate(
                "SELECT l.name, v.choice FROM votes AS v \
                 JOIN main.legislators l ON l.id = v.legislator_id \
                 LEFT JOIN issues i ON i.id = v.issue_id, blocks b",
                None,
            )
            .unwrap();
        assert_eq!(
            q.tables(),
            &["blocks", "issues", "legislators", "votes"].map(String::from)
        );
    }

    #[test]
    fn test_from_list_after_derived_tables_and_qualifiers() {
        let q = gate()
            .validate(
                "SELECT * FROM (SELECT id FROM issues) AS i, votes v NOT INDEXED \
                 JOIN legislators l ON l.id = v.legislator_id, blocks b \
                 WHERE v.issue_id IN (SELECT id FROM issues WHERE chamber = 'deputies') \
                 GROUP BY v.choice, l.name ORDER BY 1, 2",
                None,
            )
            .unwrap();
        assert_eq!(
            q.tables(),
            &["blocks", "issues", "legislators", "votes"].map(String::from)
        );
    }

    #[test]
    fn test_commas_outside_from_are_not_references() {
        gate()
            .validate(
                "SELECT name, COUNT(*) OVER (PARTITION BY chamber, block_id) FROM legislators \
                 JOIN blocks USING (id, chamber) ORDER BY name, id LIMIT 5, 5",
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_cte_names_are_reachable() {
        let q = gate()
            .validate(
                "WITH tally(issue, n) AS (SELECT issue_id, COUNT(*) FROM votes GROUP BY issue_id) \
                 SELECT * FROM tally JOIN issues ON issues.id = tally.issue",
                None,
            )
            .unwrap();
        assert_eq!(q.tables(), &["issues", "votes"].map(String::from));

        // A CTE body is still checked.
        rejected("WITH x AS (SELECT * FROM sqlite_master) SELECT * FROM x");
    }

    #[test]
    fn test_is_distinct_from_is_not_a_table_reference() {
        gate()
            .validate("SELECT * FROM votes WHERE block_id IS NOT DISTINCT FROM legislator_id", None)
            .unwrap();
    }

    #[test]
    fn test_non_select_rejected() {
        rejected("EXPLAIN SELECT * FROM votes");
        rejected("VALUES (1)");
        rejected("   ");
    }

    #[test]
    fn test_unterminated_input_rejected() {
        rejected("SELECT * FROM votes WHERE title = 'open");
        rejected("SELECT * FROM votes /* open");
    }

    #[test]
    fn test_limit_is_capped() {
        let g = gate();
        for requested in [101u32, 1_000, u32::MAX] {
            assert_eq!(g.validate("SELECT * FROM votes", Some(requested)).unwrap().limit(), 100);
        }
        assert_eq!(g.validate("SELECT * FROM votes", None).unwrap().limit(), 100);
        assert_eq!(g.validate("SELECT * FROM votes", Some(0)).unwrap().limit(), 100);
        assert_eq!(g.validate("SELECT * FROM votes", Some(7)).unwrap().limit(), 7);
    }

    #[test]
    fn test_inner_limit_cannot_exceed_bound() {
        let q = gate()
            .validate("SELECT * FROM votes LIMIT 100000", Some(3))
            .unwrap();
        assert!(q.sql().ends_with(") LIMIT 3"));
    }

    #[test]
    fn test_trailing_line_comment_does_not_swallow_wrapper() {
        let q = gate().validate("SELECT * FROM votes -- all of them", None).unwrap();
        assert!(q.sql().contains("-- all of them\n) LIMIT 100"));
    }
}
