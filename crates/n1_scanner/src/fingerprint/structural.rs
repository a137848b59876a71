//! Text canonicalizer for MySQL-family drivers.
//!
//! Every stage is a regex rewrite over the whole text, applied in a fixed
//! order. Later stages rely on earlier ones: comments are gone before literals
//! are collapsed, and literals are `?` before list and UNION folding runs.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($re).expect("static pattern compiles"))
        }
    };
}

pattern!(mysqldump, r"\ASELECT /\*!40001 SQL_NO_CACHE \*/ \* FROM `");
pattern!(percona_toolkit, r"\*\w+\.\w+:[0-9]/[0-9]\*/");
pattern!(call_procedure, r"(?i)\A\s*(call\s+\S+)\(");
pattern!(
    multi_row_insert,
    r"(?is)\A((?:INSERT|REPLACE)(?: IGNORE)?\s+INTO.+?VALUES\s*\(.*?\))\s*,\s*\("
);
pattern!(block_comment, r"(?s)/\*[^!].*?\*/");
pattern!(line_comment, r"(?:--|#)[^\r\n]*");
pattern!(use_database, r"(?i)\Ause \S+\n?\z");
pattern!(escaped_quote, r#"\\["']"#);
pattern!(double_quoted, r#"(?s)".*?""#);
pattern!(single_quoted, r"(?s)'.*?'");
pattern!(boolean, r"(?i)\btrue\b|\bfalse\b");
pattern!(number, r"[0-9+-][0-9a-f.x+-]*");
pattern!(literal_prefix, r"[xb.+-]\?");
pattern!(whitespace, r"[ \n\t\r\f]+");
pattern!(null, r"(?i)\bnull\b");
pattern!(value_list, r"\b(in|values?)(?:[\s,]*\([\s?,]*\))+");
pattern!(field_list, r"\bfield\(\s*([^\s,()]+)(?:\s*,\s*\?)+\s*\)");
pattern!(limit_offset, r"\blimit \?(?:, ?\?| offset \?)");
pattern!(order_by, r"\border by");
pattern!(ascending, r"\s+asc\b");

// Needs a back-reference to the first SELECT body, which `regex` cannot do.
fn repeated_union() -> &'static fancy_regex::Regex {
    static RE: OnceLock<fancy_regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        fancy_regex::Regex::new(r"\b(select\s.*?)(?:(\sunion(?:\sall)?)\s\1)+")
            .expect("static pattern compiles")
    })
}

/// Canonical signature of a MySQL statement.
///
/// Literal values, comments, whitespace and letter case are erased so that
/// two statements differing only in bound values produce the same string.
pub fn canonicalize(query: &str) -> Result<String> {
    if mysqldump().is_match(query) {
        return Ok("mysqldump".to_string());
    }
    if percona_toolkit().is_match(query) {
        return Ok("percona-toolkit".to_string());
    }
    if let Some(captures) = call_procedure().captures(query) {
        return Ok(captures[1].to_lowercase());
    }

    let mut text = match multi_row_insert().captures(query) {
        Some(captures) => captures[1].to_string(),
        None => query.to_string(),
    };

    text = replace(block_comment(), text, "");
    text = replace(line_comment(), text, "");

    if use_database().is_match(&text) {
        return Ok("use ?".to_string());
    }

    text = replace(escaped_quote(), text, "");
    text = replace(double_quoted(), text, "?");
    text = replace(single_quoted(), text, "?");
    text = replace(boolean(), text, "?");
    text = replace(number(), text, "?");
    text = replace(literal_prefix(), text, "?");

    text = replace(whitespace(), text.trim().to_string(), " ").to_lowercase();

    text = replace(null(), text, "?");
    text = replace(value_list(), text, "${1}(?+)");
    text = replace(field_list(), text, "field(${1}, ?+)");
    text = collapse_unions(query, text)?;
    text = replace(limit_offset(), text, "limit ?");

    if order_by().is_match(&text) {
        text = replace(ascending(), text, "");
    }

    Ok(text)
}

fn collapse_unions(query: &str, text: String) -> Result<String> {
    let collapsed = match repeated_union().try_replacen(&text, 0, "${1} /*repeat${2}*/") {
        Ok(Cow::Owned(collapsed)) => Some(collapsed),
        Ok(Cow::Borrowed(_)) => None,
        Err(err) => {
            return Err(Error::MalformedQuery {
                query: query.to_string(),
                reason: err.to_string(),
            })
        }
    };
    Ok(collapsed.unwrap_or(text))
}

fn replace(re: &Regex, text: String, replacement: &str) -> String {
    let replaced = match re.replace_all(&text, replacement) {
        Cow::Owned(replaced) => Some(replaced),
        Cow::Borrowed(_) => None,
    };
    replaced.unwrap_or(text)
}
