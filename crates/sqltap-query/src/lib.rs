// SQL text helpers: literal normalization for template grouping, and
// placeholder binding for reconstructing executable statements.

/// Replace literal values in a SQL query with placeholders so that
/// structurally identical queries can be grouped together.
///
/// String literals (`'...'`, with `''` escapes) become `'?'`, standalone
/// numeric literals become `?`, and `$N` parameters are kept as-is.
/// Consecutive whitespace collapses to a single space; leading and trailing
/// whitespace is stripped. Total: every input yields an output.
///
/// ```
/// use sqltap_query::normalize;
///
/// assert_eq!(
///     normalize("SELECT id FROM users WHERE id = 42"),
///     "SELECT id FROM users WHERE id = ?"
/// );
/// ```
pub fn normalize(sql: &str) -> String {
    if sql.is_empty() {
        return String::new();
    }

    let bytes = sql.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());

    let mut i = 0;
    let mut prev_space = false;
    while i < bytes.len() {
        let ch = bytes[i];

        if ch == b'\'' {
            i = normalize_string(&mut out, bytes, i);
            prev_space = false;
            continue;
        }

        if ch == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            i = keep_param(&mut out, bytes, i);
            prev_space = false;
            continue;
        }

        if ch.is_ascii_digit() && (i == 0 || is_num_boundary(bytes[i - 1])) {
            if let Some(next) = normalize_number(&mut out, bytes, i) {
                i = next;
                prev_space = false;
                continue;
            }
        }

        if is_space(ch) {
            if !prev_space && !out.is_empty() {
                out.push(b' ');
                prev_space = true;
            }
            i += 1;
            continue;
        }

        out.push(ch);
        i += 1;
        prev_space = false;
    }

    while out.last() == Some(&b' ') {
        out.pop();
    }

    // Only ASCII bytes were inserted or removed, so UTF-8 sequences from the
    // input survive intact.
    String::from_utf8_lossy(&out).into_owned()
}

// Replace a string literal starting at pos with '?' and return the position
// past its closing quote.
fn normalize_string(out: &mut Vec<u8>, sql: &[u8], pos: usize) -> usize {
    let mut j = pos + 1;
    while j < sql.len() {
        if sql[j] == b'\'' && j + 1 < sql.len() && sql[j + 1] == b'\'' {
            j += 2;
            continue;
        }
        if sql[j] == b'\'' {
            j += 1;
            break;
        }
        j += 1;
    }
    out.extend_from_slice(b"'?'");
    j
}

// Write a $N parameter as-is and return the new position.
fn keep_param(out: &mut Vec<u8>, sql: &[u8], pos: usize) -> usize {
    out.push(b'$');
    let mut j = pos + 1;
    while j < sql.len() && sql[j].is_ascii_digit() {
        out.push(sql[j]);
        j += 1;
    }
    j
}

// Replace a numeric literal at pos with '?'. Returns the new position when
// the run of digits/dots ends at a lexical boundary, or None when the digits
// are part of an identifier.
fn normalize_number(out: &mut Vec<u8>, sql: &[u8], pos: usize) -> Option<usize> {
    let mut j = pos + 1;
    while j < sql.len() && (sql[j].is_ascii_digit() || sql[j] == b'.') {
        j += 1;
    }
    if j >= sql.len() || is_num_boundary(sql[j]) {
        out.push(b'?');
        return Some(j);
    }
    None
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_num_boundary(c: u8) -> bool {
    is_space(c)
        || matches!(
            c,
            b',' | b'(' | b')' | b'=' | b'<' | b'>' | b'+' | b'-' | b'*' | b'/' | b';'
        )
}

/// Substitute captured argument values back into a query's placeholders.
///
/// Supports PostgreSQL-style (`$1`, `$2`, ...) and MySQL-style (`?`)
/// placeholders. Non-numeric values are single-quoted with `''` escaping.
pub fn bind(sql: &str, args: &[String]) -> String {
    if args.is_empty() {
        return sql.to_string();
    }

    let quoted: Vec<String> = args.iter().map(|a| quote_arg(a)).collect();

    // PostgreSQL style first. Replace in reverse order so $1 does not match
    // inside $10.
    let mut pg = sql.to_string();
    let mut replaced = false;
    for i in (1..=quoted.len()).rev() {
        let placeholder = format!("${i}");
        if pg.contains(&placeholder) {
            replaced = true;
            pg = pg.replace(&placeholder, &quoted[i - 1]);
        }
    }
    if replaced {
        return pg;
    }

    // Fall back to MySQL-style ?.
    let mut out = String::with_capacity(sql.len());
    let mut arg_idx = 0;
    for ch in sql.chars() {
        if ch == '?' && arg_idx < quoted.len() {
            out.push_str(&quoted[arg_idx]);
            arg_idx += 1;
        } else {
            out.push(ch);
        }
    }
    out
}

// Wrap a non-numeric arg in single quotes, escaping internal quotes.
fn quote_arg(s: &str) -> String {
    if s.parse::<f64>().is_ok() {
        return s.to_string();
    }
    if matches!(s, "true" | "false" | "null" | "NULL") {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "''"))
}
