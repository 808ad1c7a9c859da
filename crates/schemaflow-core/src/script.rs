//! Dialect-agnostic structural checks for change scripts.
//!
//! This does not parse SQL. It splits statements on `;` outside of quotes and
//! comments and reports problems that would make any dialect reject the script.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScriptIssue {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScriptSummary {
    pub statements: Vec<String>,
    pub issues: Vec<ScriptIssue>,
}

impl ScriptSummary {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Single,
    Double,
    LineComment,
    BlockComment,
}

/// Splits `script` into statements and collects structural issues.
#[must_use]
pub fn analyze(script: &str) -> ScriptSummary {
    let mut summary = ScriptSummary::default();
    let mut mode = Mode::Code;
    let mut current = String::new();
    let mut depth: i64 = 0;
    let mut line = 1_usize;
    let mut opened_at = 1_usize;
    let mut statement_line = 1_usize;
    let mut chars = script.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\n' {
            line += 1;
        }
        if mode == Mode::Code && !ch.is_whitespace() && current.trim().is_empty() {
            statement_line = line;
        }
        match mode {
            Mode::Code => match ch {
                '\'' => {
                    mode = Mode::Single;
                    opened_at = line;
                    current.push(ch);
                }
                '"' => {
                    mode = Mode::Double;
                    opened_at = line;
                    current.push(ch);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    mode = Mode::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    mode = Mode::BlockComment;
                    opened_at = line;
                }
                '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        summary.issues.push(ScriptIssue {
                            line,
                            message: "unmatched closing parenthesis".to_string(),
                        });
                        depth = 0;
                    }
                    current.push(ch);
                }
                ';' if depth == 0 => flush(&mut current, statement_line, &mut summary),
                _ => current.push(ch),
            },
            Mode::Single | Mode::Double => {
                current.push(ch);
                let quote = if mode == Mode::Single { '\'' } else { '"' };
                if ch == quote {
                    if chars.peek() == Some(&quote) {
                        // doubled quote is an escaped quote
                        if let Some(escaped) = chars.next() {
                            current.push(escaped);
                        }
                    } else {
                        mode = Mode::Code;
                    }
                }
            }
            Mode::LineComment => {
                if ch == '\n' {
                    mode = Mode::Code;
                    current.push(ch);
                }
            }
            Mode::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = Mode::Code;
                }
            }
        }
    }

    match mode {
        Mode::Single | Mode::Double => summary.issues.push(ScriptIssue {
            line: opened_at,
            message: "unterminated string literal".to_string(),
        }),
        Mode::BlockComment => summary.issues.push(ScriptIssue {
            line: opened_at,
            message: "unterminated block comment".to_string(),
        }),
        Mode::Code | Mode::LineComment => {}
    }
    if depth > 0 && matches!(mode, Mode::Code | Mode::LineComment) {
        summary.issues.push(ScriptIssue {
            line,
            message: format!("{depth} unclosed parenthesis(es)"),
        });
    }
    flush(&mut current, statement_line, &mut summary);

    if summary.statements.is_empty() && summary.issues.is_empty() {
        summary.issues.push(ScriptIssue {
            line: 1,
            message: "script contains no statements".to_string(),
        });
    }
    summary
}

/// Statements that would end or nest the transaction the executor wraps a script in.
const TRANSACTION_CONTROL: [&str; 3] = ["BEGIN", "COMMIT", "ROLLBACK"];

fn flush(current: &mut String, line: usize, summary: &mut ScriptSummary) {
    let statement = current.trim();
    if !statement.is_empty() {
        let keyword = statement
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        if TRANSACTION_CONTROL.contains(&keyword.as_str()) {
            summary.issues.push(ScriptIssue {
                line,
                message: format!(
                    "{keyword} is not allowed; scripts run inside a managed transaction"
                ),
            });
        }
        summary.statements.push(statement.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_outside_quotes_and_comments() {
        let summary = analyze(
            "-- header; comment\nCREATE TABLE a (id INT, note TEXT DEFAULT 'x;y');\n/* ; */ INSERT INTO a VALUES (1, 'it''s');",
        );
        assert!(summary.is_valid(), "{:?}", summary.issues);
        assert_eq!(summary.statements.len(), 2);
        assert!(summary.statements[1].ends_with("'it''s')"));
    }

    #[test]
    fn reports_unterminated_string() {
        let summary = analyze("SELECT 1;\nINSERT INTO a VALUES ('oops);");
        assert_eq!(summary.issues.len(), 1);
        assert_eq!(summary.issues[0].line, 2);
        assert!(summary.issues[0].message.contains("string"));
    }

    #[test]
    fn reports_unbalanced_parentheses() {
        assert!(!analyze("CREATE TABLE a (id INT;").is_valid());
        assert!(!analyze("SELECT 1);").is_valid());
    }

    #[test]
    fn rejects_transaction_control_but_not_trigger_bodies() {
        let summary =
            analyze("CREATE TABLE a (id INT);\nBEGIN;\nINSERT INTO a VALUES (1);\ncommit;");
        assert_eq!(summary.issues.len(), 2);
        assert_eq!(summary.issues[0].line, 2);
        assert_eq!(summary.issues[1].line, 4);

        let trigger = analyze(
            "CREATE TRIGGER a_touch AFTER INSERT ON a BEGIN\n  UPDATE a SET id = id;\nEND;",
        );
        assert!(trigger.is_valid(), "{:?}", trigger.issues);
    }

    #[test]
    fn empty_script_is_invalid() {
        let summary = analyze("  -- nothing here\n ; ");
        assert!(!summary.is_valid());
        assert!(summary.issues[0].message.contains("no statements"));
    }
}
