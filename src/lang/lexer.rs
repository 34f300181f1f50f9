//! Tokenizer for the taught language.
//!
//! Indentation-structured: emits `Indent`/`Dedent` tokens from leading
//! spaces, suppresses newlines and indentation inside brackets so
//! expressions can span lines.

use super::ast::Span;
use super::SyntaxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Str(String),
    // Keywords
    Def,
    Return,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    And,
    Or,
    Not,
    True,
    False,
    None,
    Break,
    Continue,
    Pass,
    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Assign,
    PlusEq,
    MinusEq,
    StarEq,
    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    // Structure
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

impl Token {
    fn new(tok: Tok, line: u32, col: u32) -> Self {
        Self {
            tok,
            span: Span::new(line, col),
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut depth = 0usize;
    let mut last_line = 1u32;

    for (line_idx, raw_line) in source.split('\n').enumerate() {
        let line_no = line_idx as u32 + 1;
        last_line = line_no;
        let chars: Vec<char> = raw_line.chars().collect();

        let mut pos = 0usize;
        if depth == 0 {
            // Measure indentation; skip blank and comment-only lines.
            let mut indent = 0usize;
            while pos < chars.len() {
                match chars[pos] {
                    ' ' => {
                        indent += 1;
                        pos += 1;
                    }
                    '\t' => {
                        return Err(SyntaxError::new(
                            "tabs are not supported, indent with spaces",
                            line_no,
                            pos as u32 + 1,
                        ));
                    }
                    _ => break,
                }
            }
            if pos >= chars.len() || chars[pos] == '#' {
                continue;
            }
            let current = *indents.last().unwrap_or(&0);
            if indent > current {
                indents.push(indent);
                tokens.push(Token::new(Tok::Indent, line_no, 1));
            } else if indent < current {
                while indents.len() > 1 && *indents.last().unwrap() > indent {
                    indents.pop();
                    tokens.push(Token::new(Tok::Dedent, line_no, 1));
                }
                if *indents.last().unwrap() != indent {
                    return Err(SyntaxError::new(
                        "unindent does not match any outer indentation level",
                        line_no,
                        1,
                    ));
                }
            }
        }

        let produced_any = scan_line(&chars, pos, line_no, &mut tokens, &mut depth)?;
        if depth == 0 && produced_any {
            tokens.push(Token::new(Tok::Newline, line_no, chars.len() as u32 + 1));
        }
    }

    if depth > 0 {
        return Err(SyntaxError::new(
            "unexpected end of input inside brackets",
            last_line,
            1,
        ));
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token::new(Tok::Dedent, last_line, 1));
    }
    tokens.push(Token::new(Tok::Eof, last_line, 1));
    Ok(tokens)
}

/// Scan one physical line's tokens. Returns whether any token was emitted.
fn scan_line(
    chars: &[char],
    mut pos: usize,
    line_no: u32,
    tokens: &mut Vec<Token>,
    depth: &mut usize,
) -> Result<bool, SyntaxError> {
    let start_len = tokens.len();

    while pos < chars.len() {
        let c = chars[pos];
        let col = pos as u32 + 1;
        match c {
            ' ' => {
                pos += 1;
            }
            '\t' => {
                return Err(SyntaxError::new("tabs are not supported", line_no, col));
            }
            '#' => break,
            '"' | '\'' => {
                let (s, next) = scan_string(chars, pos, line_no)?;
                tokens.push(Token::new(Tok::Str(s), line_no, col));
                pos = next;
            }
            '0'..='9' => {
                let mut end = pos;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                let text: String = chars[pos..end].iter().collect();
                let value = text.parse::<i64>().map_err(|_| {
                    SyntaxError::new(format!("number too large: {}", text), line_no, col)
                })?;
                tokens.push(Token::new(Tok::Int(value), line_no, col));
                pos = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = pos;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[pos..end].iter().collect();
                tokens.push(Token::new(keyword_or_ident(word), line_no, col));
                pos = end;
            }
            '(' | '[' | '{' => {
                *depth += 1;
                let tok = match c {
                    '(' => Tok::LParen,
                    '[' => Tok::LBracket,
                    _ => Tok::LBrace,
                };
                tokens.push(Token::new(tok, line_no, col));
                pos += 1;
            }
            ')' | ']' | '}' => {
                if *depth == 0 {
                    return Err(SyntaxError::new(
                        format!("unmatched {:?}", c),
                        line_no,
                        col,
                    ));
                }
                *depth -= 1;
                let tok = match c {
                    ')' => Tok::RParen,
                    ']' => Tok::RBracket,
                    _ => Tok::RBrace,
                };
                tokens.push(Token::new(tok, line_no, col));
                pos += 1;
            }
            _ => {
                let next = chars.get(pos + 1).copied();
                let (tok, width) = match (c, next) {
                    ('=', Some('=')) => (Tok::EqEq, 2),
                    ('!', Some('=')) => (Tok::NotEq, 2),
                    ('<', Some('=')) => (Tok::LtE, 2),
                    ('>', Some('=')) => (Tok::GtE, 2),
                    ('+', Some('=')) => (Tok::PlusEq, 2),
                    ('-', Some('=')) => (Tok::MinusEq, 2),
                    ('*', Some('=')) => (Tok::StarEq, 2),
                    ('/', Some('/')) => (Tok::SlashSlash, 2),
                    ('=', _) => (Tok::Assign, 1),
                    ('<', _) => (Tok::Lt, 1),
                    ('>', _) => (Tok::Gt, 1),
                    ('+', _) => (Tok::Plus, 1),
                    ('-', _) => (Tok::Minus, 1),
                    ('*', _) => (Tok::Star, 1),
                    ('/', _) => (Tok::Slash, 1),
                    ('%', _) => (Tok::Percent, 1),
                    (',', _) => (Tok::Comma, 1),
                    (':', _) => (Tok::Colon, 1),
                    ('.', _) => (Tok::Dot, 1),
                    _ => {
                        return Err(SyntaxError::new(
                            format!("unexpected character {:?}", c),
                            line_no,
                            col,
                        ));
                    }
                };
                tokens.push(Token::new(tok, line_no, col));
                pos += width;
            }
        }
    }

    Ok(tokens.len() > start_len)
}

fn scan_string(
    chars: &[char],
    start: usize,
    line_no: u32,
) -> Result<(String, usize), SyntaxError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut pos = start + 1;
    while pos < chars.len() {
        let c = chars[pos];
        if c == quote {
            return Ok((out, pos + 1));
        }
        if c == '\\' {
            let escaped = chars.get(pos + 1).copied().ok_or_else(|| {
                SyntaxError::new("unterminated string", line_no, start as u32 + 1)
            })?;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                other => {
                    return Err(SyntaxError::new(
                        format!("unknown escape sequence \\{}", other),
                        line_no,
                        pos as u32 + 1,
                    ));
                }
            }
            pos += 2;
        } else {
            out.push(c);
            pos += 1;
        }
    }
    Err(SyntaxError::new(
        "unterminated string",
        line_no,
        start as u32 + 1,
    ))
}

fn keyword_or_ident(word: String) -> Tok {
    match word.as_str() {
        "def" => Tok::Def,
        "return" => Tok::Return,
        "if" => Tok::If,
        "elif" => Tok::Elif,
        "else" => Tok::Else,
        "while" => Tok::While,
        "for" => Tok::For,
        "in" => Tok::In,
        "and" => Tok::And,
        "or" => Tok::Or,
        "not" => Tok::Not,
        "True" => Tok::True,
        "False" => Tok::False,
        "None" => Tok::None,
        "break" => Tok::Break,
        "continue" => Tok::Continue,
        "pass" => Tok::Pass,
        _ => Tok::Ident(word),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn test_simple_line() {
        assert_eq!(
            toks("x = 1"),
            vec![
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indentation() {
        let tokens = toks("for x in items:\n    print(x)\ndone = True");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        let indent_pos = tokens.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent_pos = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        let tokens = toks("x = 1\n\n# comment\ny = 2");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn test_newlines_suppressed_in_brackets() {
        let tokens = toks("x = [1,\n     2]");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#"s = 'a\n\'b'"#),
            vec![
                Tok::Ident("s".into()),
                Tok::Assign,
                Tok::Str("a\n'b".into()),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        let tokens = toks("a // b <= c != d");
        assert!(tokens.contains(&Tok::SlashSlash));
        assert!(tokens.contains(&Tok::LtE));
        assert!(tokens.contains(&Tok::NotEq));
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(tokenize("s = 'oops").is_err());
    }

    #[test]
    fn test_tab_indent_is_error() {
        let err = tokenize("if x:\n\tprint(x)").unwrap_err();
        assert!(err.message.contains("tabs"));
    }

    #[test]
    fn test_bad_dedent_is_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2").unwrap_err();
        assert!(err.message.contains("unindent"));
    }
}
