//! Lexical helpers for SQL text: statement splitting and keyword inspection.
//!
//! Statements are never parsed. The text is run through the `sqlparser`
//! tokenizer of the connection's dialect, which knows the quoting and comment
//! rules (escape strings, dollar-quoted bodies, nested block comments), and
//! statement boundaries are the top-level `;` tokens.

use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Token, TokenWithLocation, Tokenizer, TokenizerError};

use crate::connection::Dialect;

/// Keywords that can follow the CTE list of a `WITH` statement.
const MAIN_KEYWORDS: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE"];

fn tokenize(sql: &str, dialect: Dialect) -> Result<Vec<TokenWithLocation>, TokenizerError> {
    match dialect {
        Dialect::Sqlite => Tokenizer::new(&SQLiteDialect {}, sql).tokenize_with_location(),
        Dialect::Postgres => Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize_with_location(),
    }
}

/// Split `sql` into its statements.
///
/// Fragments that hold nothing but whitespace and comments are discarded; the
/// returned slices are trimmed. Text the tokenizer rejects (an unterminated
/// literal, say) is returned whole as a single statement so that the database
/// reports the error.
pub fn split_statements(sql: &str, dialect: Dialect) -> Vec<&str> {
    let tokens = match tokenize(sql, dialect) {
        Ok(tokens) => tokens,
        Err(error) => {
            tracing::warn!(%error, "SQL could not be tokenized, treating it as one statement");
            return whole(sql);
        }
    };

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();

    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;
    for TokenWithLocation { token, location } in &tokens {
        match token {
            Token::SemiColon => {
                let Some(end) = byte_offset(sql, &line_starts, location.line, location.column)
                else {
                    tracing::warn!(
                        line = location.line,
                        column = location.column,
                        "Statement boundary outside of the SQL text"
                    );
                    return whole(sql);
                };
                if has_content {
                    statements.push(sql[start..end].trim());
                }
                start = end + 1;
                has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_content = true,
        }
    }
    if has_content {
        statements.push(sql[start..].trim());
    }

    statements
}

/// Number of statements [split_statements] finds in `sql`.
pub fn count_statements(sql: &str, dialect: Dialect) -> usize {
    split_statements(sql, dialect).len()
}

/// The first keyword of a statement, upper-cased. Whitespace, comments and
/// opening parentheses before it are skipped.
pub fn leading_keyword(statement: &str, dialect: Dialect) -> Option<String> {
    let tokens = significant_tokens(statement, dialect)?;
    first_keyword(&mut tokens.into_iter())
}

/// The keyword naming what a statement does.
///
/// This is the leading keyword, except for `WITH` statements, where it is the
/// first `SELECT`, `INSERT`, `UPDATE` or `DELETE` after the CTE list.
pub fn statement_keyword(statement: &str, dialect: Dialect) -> Option<String> {
    let mut tokens = significant_tokens(statement, dialect)?.into_iter();
    let first = first_keyword(&mut tokens)?;
    if first != "WITH" {
        return Some(first);
    }

    let mut depth = 0usize;
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Word(word) if depth == 0 && word.quote_style.is_none() => {
                let keyword = word.value.to_ascii_uppercase();
                if MAIN_KEYWORDS.contains(&keyword.as_str()) {
                    return Some(keyword);
                }
            }
            _ => {}
        }
    }
    Some(first)
}

/// Whether `statement` is a `keyword` statement, looking past a `WITH` clause.
pub fn is_statement_of_kind(statement: &str, keyword: &str, dialect: Dialect) -> bool {
    statement_keyword(statement, dialect).as_deref() == Some(keyword)
}

fn whole(sql: &str) -> Vec<&str> {
    let sql = sql.trim();
    if sql.is_empty() {
        Vec::new()
    } else {
        vec![sql]
    }
}

fn significant_tokens(statement: &str, dialect: Dialect) -> Option<Vec<Token>> {
    let tokens = tokenize(statement, dialect).ok()?;
    Some(
        tokens
            .into_iter()
            .map(|t| t.token)
            .filter(|token| !matches!(token, Token::Whitespace(_) | Token::EOF))
            .collect(),
    )
}

fn first_keyword(tokens: &mut impl Iterator<Item = Token>) -> Option<String> {
    loop {
        match tokens.next()? {
            Token::LParen => continue,
            Token::Word(word) if word.quote_style.is_none() => {
                return Some(word.value.to_ascii_uppercase())
            }
            _ => return None,
        }
    }
}

/// Byte offset of a 1-based line and character column.
fn byte_offset(sql: &str, line_starts: &[usize], line: u64, column: u64) -> Option<usize> {
    let line_start = *line_starts.get(usize::try_from(line).ok()?.checked_sub(1)?)?;
    let column = usize::try_from(column).ok()?.checked_sub(1)?;
    sql[line_start..]
        .char_indices()
        .nth(column)
        .map(|(offset, _)| line_start + offset)
}
