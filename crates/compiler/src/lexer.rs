//! Tokenizer for Mica source text
//!
//! A small state machine over the contexts {Default, Whitespace, String,
//! LineComment, BlockComment}. Operators are greedily maximal: one
//! character of lookahead decides whether a two-character operator or a
//! comment delimiter is being formed. Whitespace is coalesced into a
//! single token per run; whitespace and comment tokens are stripped
//! before parsing.
//!
//! The tokenizer never fails: malformed input is passed through as
//! `Unknown` tokens for the parser to reject.

/// A classified source token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Keyword(String),
    Operator(String),
    Char(String),
    /// A primitive type name.
    Type(String),
    /// Identifier or integer literal; resolved by the parser.
    Unknown(String),
    /// The body of a string literal (without the surrounding quotes).
    Str(String),
    Whitespace(String),
    LineComment(String),
    BlockComment(String),
    CommentDelimiter(String),
}

impl Token {
    /// The raw text of the token.
    pub fn text(&self) -> &str {
        match self {
            Token::Keyword(s)
            | Token::Operator(s)
            | Token::Char(s)
            | Token::Type(s)
            | Token::Unknown(s)
            | Token::Str(s)
            | Token::Whitespace(s)
            | Token::LineComment(s)
            | Token::BlockComment(s)
            | Token::CommentDelimiter(s) => s,
        }
    }

    /// Whitespace and comment tokens, dropped before parsing.
    pub fn is_trivia(&self) -> bool {
        matches!(
            self,
            Token::Whitespace(_)
                | Token::LineComment(_)
                | Token::BlockComment(_)
                | Token::CommentDelimiter(_)
        )
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

const KEYWORDS: &[&str] = &[
    "func", "mutable", "let", "while", "if", "else", "return", "type", "enum", "match", "case",
    "cast", "as", "affects", "assert",
];

const PRIMITIVE_TYPES: &[&str] = &[
    "int", "uint", "int8", "int16", "int32", "int64", "uint8", "uint16", "uint32", "uint64",
    "byte", "bool", "string",
];

fn is_operator(s: &str) -> bool {
    matches!(
        s,
        "+" | "-" | "*" | "/" | "%" | "<=" | "<" | "==" | ">" | ">=" | "=" | "!=" | "|" | "->"
    )
}

fn is_comment_delimiter(s: &str) -> bool {
    matches!(s, "//" | "/*" | "*/")
}

/// Whether `s` could still grow into a longer operator or comment
/// delimiter (e.g. `<` awaiting `=`, `/` awaiting `/` or `*`).
fn is_operator_prefix(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| "<=>|!+-*/%".contains(c))
}

/// Classify a completed chunk of non-trivia text.
fn classify(val: &str) -> Token {
    if KEYWORDS.contains(&val) {
        return Token::Keyword(val.to_string());
    }
    match val {
        "(" | ")" | "{" | "}" | "\"" | "," | ":" | "." => return Token::Char(val.to_string()),
        _ => {}
    }
    if is_comment_delimiter(val) {
        return Token::CommentDelimiter(val.to_string());
    }
    if is_operator(val) {
        return Token::Operator(val.to_string());
    }
    if PRIMITIVE_TYPES.contains(&val) {
        return Token::Type(val.to_string());
    }
    if val.trim().is_empty() {
        return Token::Whitespace(val.to_string());
    }
    Token::Unknown(val.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Default,
    Whitespace,
    Str,
    LineComment,
    BlockComment,
}

/// Tokenize a complete source text.
pub fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut current = String::new();
    let mut ctx = Context::Default;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            match ctx {
                Context::LineComment => {
                    if c == '\n' {
                        tokens.push(Token::LineComment(std::mem::take(&mut current)));
                        ctx = Context::Default;
                        i += 1;
                        continue;
                    }
                    current.push(c);
                }
                Context::Whitespace | Context::Str | Context::BlockComment => current.push(c),
                Context::Default => {
                    if !current.is_empty() {
                        tokens.push(classify(&current));
                        current.clear();
                    }
                    current.push(c);
                    ctx = Context::Whitespace;
                }
            }
            i += 1;
            continue;
        }

        match ctx {
            Context::Whitespace | Context::Default => {
                if ctx == Context::Whitespace {
                    tokens.push(Token::Whitespace(std::mem::take(&mut current)));
                    ctx = Context::Default;
                }
                match c {
                    '<' | '=' | '>' | '|' | '!' | '+' | '-' | '*' | '/' | '%' => {
                        // An identifier in progress ends here; only a
                        // partial operator may keep accumulating.
                        if !current.is_empty() && !is_operator_prefix(&current) {
                            tokens.push(classify(&current));
                            current.clear();
                        }
                        let peeked = chars.get(i + 1).copied();
                        if let Some(p) = peeked {
                            let longer = format!("{}{}{}", current, c, p);
                            if is_operator(&longer) || is_comment_delimiter(&longer) {
                                current.push(c);
                                i += 1;
                                continue;
                            }
                        }
                        let formed = format!("{}{}", current, c);
                        if is_operator(&formed) {
                            tokens.push(classify(&formed));
                            current.clear();
                        } else if is_comment_delimiter(&formed) {
                            tokens.push(classify(&formed));
                            ctx = match formed.as_str() {
                                "//" => Context::LineComment,
                                "/*" => Context::BlockComment,
                                // A stray close delimiter stays in the
                                // stream for the parser to reject.
                                _ => Context::Default,
                            };
                            current.clear();
                        } else {
                            if !current.is_empty() {
                                tokens.push(classify(&current));
                                current.clear();
                            }
                            tokens.push(Token::Operator(c.to_string()));
                        }
                        i += 1;
                    }
                    '(' | ')' | '{' | '}' | '"' | ',' | ':' | '[' | ']' | '.' => {
                        if !current.is_empty() {
                            tokens.push(classify(&current));
                            current.clear();
                        }
                        tokens.push(Token::Char(c.to_string()));
                        if c == '"' {
                            ctx = Context::Str;
                        }
                        i += 1;
                    }
                    _ => {
                        current.push(c);
                        i += 1;
                    }
                }
            }
            Context::Str => {
                // A quote preceded by an unescaped backslash stays part
                // of the literal.
                if c == '"' && !current.ends_with('\\') {
                    tokens.push(Token::Str(std::mem::take(&mut current)));
                    tokens.push(Token::Char("\"".to_string()));
                    ctx = Context::Default;
                } else {
                    current.push(c);
                }
                i += 1;
            }
            Context::BlockComment => {
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::BlockComment(std::mem::take(&mut current)));
                    tokens.push(Token::CommentDelimiter("*/".to_string()));
                    ctx = Context::Default;
                    i += 2;
                } else {
                    current.push(c);
                    i += 1;
                }
            }
            Context::LineComment => {
                current.push(c);
                i += 1;
            }
        }
    }

    if !current.is_empty() {
        match ctx {
            Context::Whitespace => tokens.push(Token::Whitespace(current)),
            Context::Str => tokens.push(Token::Unknown(current)),
            Context::LineComment => tokens.push(Token::LineComment(current)),
            Context::BlockComment => tokens.push(Token::BlockComment(current)),
            Context::Default => tokens.push(classify(&current)),
        }
    }

    tracing::trace!(count = tokens.len(), "tokenized source");
    tokens
}

/// Drop whitespace and comment tokens.
pub fn strip_trivia(tokens: Vec<Token>) -> Vec<Token> {
    tokens.into_iter().filter(|t| !t.is_trivia()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        strip_trivia(tokenize(src))
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = lex("func main");
        assert_eq!(
            tokens,
            vec![
                Token::Keyword("func".into()),
                Token::Unknown("main".into())
            ]
        );
    }

    #[test]
    fn test_primitive_type_tokens() {
        let tokens = lex("int uint byte string myname");
        assert_eq!(
            tokens,
            vec![
                Token::Type("int".into()),
                Token::Type("uint".into()),
                Token::Type("byte".into()),
                Token::Type("string".into()),
                Token::Unknown("myname".into()),
            ]
        );
    }

    #[test]
    fn test_maximal_munch_operators() {
        let tokens = lex("a <= b");
        assert_eq!(
            tokens,
            vec![
                Token::Unknown("a".into()),
                Token::Operator("<=".into()),
                Token::Unknown("b".into()),
            ]
        );

        // No spaces: the two-character operator must still win.
        let tokens = lex("a<=b");
        assert_eq!(
            tokens,
            vec![
                Token::Unknown("a".into()),
                Token::Operator("<=".into()),
                Token::Unknown("b".into()),
            ]
        );

        let tokens = lex("x != y");
        assert_eq!(tokens[1], Token::Operator("!=".into()));

        let tokens = lex("-> affects");
        assert_eq!(
            tokens,
            vec![
                Token::Operator("->".into()),
                Token::Keyword("affects".into())
            ]
        );
    }

    #[test]
    fn test_single_char_operators() {
        let tokens = lex("a < b > c = d");
        assert_eq!(tokens[1], Token::Operator("<".into()));
        assert_eq!(tokens[3], Token::Operator(">".into()));
        assert_eq!(tokens[5], Token::Operator("=".into()));
    }

    #[test]
    fn test_line_comment() {
        let tokens = tokenize("let x // trailing\nlet y");
        assert!(tokens.contains(&Token::CommentDelimiter("//".into())));
        assert!(tokens.contains(&Token::LineComment(" trailing".into())));
        let stripped = strip_trivia(tokens);
        assert_eq!(stripped.len(), 4);
    }

    #[test]
    fn test_block_comment() {
        let tokens = tokenize("a /* inner * stuff */ b");
        assert!(tokens.contains(&Token::CommentDelimiter("/*".into())));
        assert!(tokens.contains(&Token::BlockComment(" inner * stuff ".into())));
        assert!(tokens.contains(&Token::CommentDelimiter("*/".into())));
        let stripped = strip_trivia(tokens);
        assert_eq!(
            stripped,
            vec![Token::Unknown("a".into()), Token::Unknown("b".into())]
        );
    }

    #[test]
    fn test_string_literal() {
        let tokens = lex(r#"let s = "hello world""#);
        assert!(tokens.contains(&Token::Str("hello world".into())));
    }

    #[test]
    fn test_string_with_escaped_quote() {
        let tokens = lex(r#""say \"hi\"""#);
        assert_eq!(
            tokens,
            vec![
                Token::Char("\"".into()),
                Token::Str(r#"say \"hi\""#.into()),
                Token::Char("\"".into()),
            ]
        );
    }

    #[test]
    fn test_empty_string_literal() {
        let tokens = lex(r#""""#);
        assert_eq!(
            tokens,
            vec![
                Token::Char("\"".into()),
                Token::Str(String::new()),
                Token::Char("\"".into()),
            ]
        );
    }

    #[test]
    fn test_whitespace_coalesced() {
        let tokens = tokenize("a   \t\n  b");
        let ws: Vec<_> = tokens
            .iter()
            .filter(|t| matches!(t, Token::Whitespace(_)))
            .collect();
        assert_eq!(ws.len(), 1);
    }

    #[test]
    fn test_punctuation_and_brackets() {
        let tokens = lex("f(a[0], b)");
        assert_eq!(
            tokens,
            vec![
                Token::Unknown("f".into()),
                Token::Char("(".into()),
                Token::Unknown("a".into()),
                Token::Char("[".into()),
                Token::Unknown("0".into()),
                Token::Char("]".into()),
                Token::Char(",".into()),
                Token::Unknown("b".into()),
                Token::Char(")".into()),
            ]
        );
    }

    #[test]
    fn test_sum_type_pipe() {
        let tokens = lex("int | string");
        assert_eq!(tokens[1], Token::Operator("|".into()));
    }

    #[test]
    fn test_division_not_comment() {
        let tokens = lex("a / b");
        assert_eq!(tokens[1], Token::Operator("/".into()));
    }
}
