use std::borrow::Cow;

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn dollar_quote_tag(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }
    if idx < bytes.len() && bytes[idx] == b'$' {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

fn closes_dollar_quote(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len()
        && bytes[idx + 1..=end].starts_with(tag.as_bytes())
        && bytes.get(end) == Some(&b'$')
}

/// Rewrite `?` placeholders as sequential `$N` placeholders.
///
/// The scanner skips single- and double-quoted strings, line and (nested)
/// block comments, and dollar-quoted blocks, so a `?` inside any of those is
/// left alone. When `enabled` is false the SQL passes through untouched and
/// every `?` stays a literal operator (the dollar-only mode used for JSON
/// containment queries). Returns a borrowed `Cow` when nothing changes.
#[must_use]
pub fn number_placeholders(sql: &str, enabled: bool) -> Cow<'_, str> {
    if !enabled {
        return Cow::Borrowed(sql);
    }

    let mut out: Option<Vec<u8>> = None;
    let mut state = State::Normal;
    let mut next_placeholder = 1u32;
    let bytes = sql.as_bytes();
    let mut idx = 0;

    while idx < bytes.len() {
        let start = idx;
        let b = bytes[idx];
        let mut replaced = false;
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => state = State::BlockComment(1),
                b'$' => {
                    if let Some((tag, advance)) = dollar_quote_tag(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = advance;
                    }
                }
                b'?' => {
                    let buf = out.get_or_insert_with(|| bytes[..idx].to_vec());
                    buf.push(b'$');
                    buf.extend_from_slice(next_placeholder.to_string().as_bytes());
                    next_placeholder += 1;
                    replaced = true;
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                } else if is_block_comment_end(bytes, idx) {
                    if depth == 1 {
                        state = State::Normal;
                    } else {
                        state = State::BlockComment(depth - 1);
                    }
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && closes_dollar_quote(bytes, idx, tag) {
                    let tag_len = tag.len();
                    state = State::Normal;
                    idx += tag_len;
                }
            }
        }

        // copy the full range consumed this iteration; state transitions
        // above may have advanced idx past a quote tag
        if let Some(ref mut buf) = out
            && !replaced
        {
            buf.extend_from_slice(&bytes[start..=idx]);
        }

        idx += 1;
    }

    match out {
        // only ASCII was inserted into valid UTF-8, so this cannot fail
        Some(buf) => Cow::Owned(String::from_utf8(buf).unwrap_or_else(|_| sql.to_string())),
        None => Cow::Borrowed(sql),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_question_marks() {
        let sql = "select * from t where a = ? and b = ?";
        let res = number_placeholders(sql, true);
        assert_eq!(res, "select * from t where a = $1 and b = $2");
    }

    #[test]
    fn skips_inside_literals_and_comments() {
        let sql = "select '?', a -- ?\n/* ? */ from t where a = ?";
        let res = number_placeholders(sql, true);
        assert_eq!(res, "select '?', a -- ?\n/* ? */ from t where a = $1");
    }

    #[test]
    fn skips_dollar_quoted_blocks() {
        let sql = "$fn$ select ? $fn$ where a = ?";
        let res = number_placeholders(sql, true);
        assert_eq!(res, "$fn$ select ? $fn$ where a = $1");
    }

    #[test]
    fn escaped_quotes_stay_inside_the_literal() {
        let sql = "select 'it''s ?' where a = ?";
        let res = number_placeholders(sql, true);
        assert_eq!(res, "select 'it''s ?' where a = $1");
    }

    #[test]
    fn replacement_before_a_dollar_quote_keeps_the_tag() {
        let sql = "update t set a = ? where b = $q$?$q$";
        let res = number_placeholders(sql, true);
        assert_eq!(res, "update t set a = $1 where b = $q$?$q$");
    }

    #[test]
    fn multibyte_text_survives_rewriting() {
        let sql = "select ?, 'héllo wörld'";
        let res = number_placeholders(sql, true);
        assert_eq!(res, "select $1, 'héllo wörld'");
    }

    #[test]
    fn disabled_leaves_question_marks_as_operators() {
        let sql = r#"select * from t where doc ? 'key'"#;
        let res = number_placeholders(sql, false);
        assert!(matches!(res, Cow::Borrowed(_)));
        assert_eq!(res, sql);
    }

    #[test]
    fn untouched_sql_borrows() {
        let sql = "select 1";
        assert!(matches!(number_placeholders(sql, true), Cow::Borrowed(_)));
    }
}
