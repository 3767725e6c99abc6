//! Just enough SQL lexing to find the leading keyword of each top-level
//! statement in a script.
//!
//! Quoted strings and identifiers, comments, and `CREATE TRIGGER ... BEGIN
//! ... END` bodies are skipped, so a `;` or `END` inside them does not start
//! a new statement.

/// Statements that would end or nest the transaction a script runs in.
const TRANSACTION_CONTROL: &[&str] = &["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"];

/// The first top-level transaction-control keyword in `sql`, uppercased.
pub(crate) fn find_transaction_control(sql: &str) -> Option<String> {
    leading_keywords(sql)
        .into_iter()
        .find(|kw| TRANSACTION_CONTROL.contains(&kw.as_str()))
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Semicolon,
}

fn leading_keywords(sql: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    let mut first: Option<String> = None;
    let mut words_in_statement = 0usize;
    let mut is_trigger = false;
    let mut in_body = false;
    let mut case_depth = 0usize;

    for token in tokens(sql) {
        match token {
            Token::Word(word) => {
                if first.is_none() {
                    first = Some(word.clone());
                }
                // CREATE [TEMP | TEMPORARY] TRIGGER
                if words_in_statement <= 2
                    && word == "TRIGGER"
                    && first.as_deref() == Some("CREATE")
                {
                    is_trigger = true;
                }
                words_in_statement += 1;

                if is_trigger && !in_body && word == "BEGIN" {
                    in_body = true;
                } else if in_body && word == "CASE" {
                    case_depth += 1;
                } else if in_body && word == "END" {
                    if case_depth > 0 {
                        case_depth -= 1;
                    } else {
                        in_body = false;
                    }
                }
            }
            Token::Semicolon if in_body => {}
            Token::Semicolon => {
                keywords.extend(first.take());
                words_in_statement = 0;
                is_trigger = false;
                case_depth = 0;
            }
        }
    }
    keywords.extend(first);
    keywords
}

fn tokens(sql: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ';' => out.push(Token::Semicolon),
            '\'' | '"' | '`' => {
                for next in chars.by_ref() {
                    if next == c {
                        break;
                    }
                }
            }
            '[' => {
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = c.to_ascii_uppercase().to_string();
                while let Some(&next) = chars.peek() {
                    if !(next.is_alphanumeric() || next == '_' || next == '$') {
                        break;
                    }
                    word.push(next.to_ascii_uppercase());
                    chars.next();
                }
                out.push(Token::Word(word));
            }
            _ => {}
        }
    }
    out
}
