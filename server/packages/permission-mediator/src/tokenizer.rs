//! Shell command tokenizer.
//!
//! The command is first cut into simple commands at unquoted control
//! operators (`&&`, `||`, `;`, `|`, `&`, `|&`, and newline as `;`), even when
//! they are not surrounded by whitespace. Each simple command is then split
//! into words with [`shlex`], which removes quoting and backslash escapes.
//! Redirections are not interpreted and stay part of their word.
//!
//! A command with an unterminated quote does not parse and yields `None`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
    /// The simple command holding this word runs a command substitution
    /// (`$(` or a backtick) outside single quotes, or an unquoted process
    /// substitution (`<(` or `>(`).
    pub substitutes: bool,
}

impl Token {
    fn operator(text: &str) -> Self {
        Token {
            text: text.to_string(),
            kind: TokenKind::Operator,
            substitutes: false,
        }
    }

    fn word(text: String, substitutes: bool) -> Self {
        Token {
            text,
            kind: TokenKind::Word,
            substitutes,
        }
    }

    pub fn is_operator(&self) -> bool {
        self.kind == TokenKind::Operator
    }
}

/// Splits `command` into token texts.
pub fn tokenize(command: &str) -> Option<Vec<String>> {
    lex(command).map(|tokens| tokens.into_iter().map(|token| token.text).collect())
}

/// Splits `command` into classified tokens.
pub fn lex(command: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    for piece in split_commands(command.trim()) {
        match piece {
            Piece::Command(segment) => {
                let words = shlex::split(&segment.text)?;
                tokens.extend(
                    words
                        .into_iter()
                        .map(|word| Token::word(word, segment.substitutes)),
                );
            }
            Piece::Operator(text) => tokens.push(Token::operator(text)),
        }
    }
    Some(tokens)
}

#[derive(Debug, Default)]
struct Segment {
    text: String,
    substitutes: bool,
}

#[derive(Debug)]
enum Piece {
    Command(Segment),
    Operator(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

#[derive(Default)]
struct Splitter {
    pieces: Vec<Piece>,
    current: Segment,
}

impl Splitter {
    fn push(&mut self, ch: char) {
        self.current.text.push(ch);
    }

    fn push_substitution(&mut self, ch: char) {
        self.current.substitutes = true;
        self.push(ch);
    }

    fn operator(&mut self, text: &'static str) {
        let segment = std::mem::take(&mut self.current);
        self.pieces.push(Piece::Command(segment));
        self.pieces.push(Piece::Operator(text));
    }

    fn finish(mut self) -> Vec<Piece> {
        self.pieces.push(Piece::Command(self.current));
        self.pieces
    }
}

/// Cuts `command` at unquoted control operators. Segment text keeps its
/// quoting so it can be handed to `shlex` as is.
fn split_commands(command: &str) -> Vec<Piece> {
    let mut splitter = Splitter::default();
    let mut quote = Quote::None;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        let next = chars.peek().copied();
        match (quote, ch) {
            (Quote::Single, '\'') => {
                quote = Quote::None;
                splitter.push(ch);
            }
            (Quote::Single, _) => splitter.push(ch),
            (_, '\\') => match chars.next() {
                // Line continuation.
                Some('\n') => {}
                Some(escaped) => {
                    splitter.push(ch);
                    splitter.push(escaped);
                }
                None => splitter.push(ch),
            },
            (Quote::Double, '"') => {
                quote = Quote::None;
                splitter.push(ch);
            }
            (Quote::None, '\'') => {
                quote = Quote::Single;
                splitter.push(ch);
            }
            (Quote::None, '"') => {
                quote = Quote::Double;
                splitter.push(ch);
            }
            (_, '`') => splitter.push_substitution(ch),
            (_, '$') if next == Some('(') => splitter.push_substitution(ch),
            (Quote::None, '<' | '>') if next == Some('(') => splitter.push_substitution(ch),
            (Quote::Double, _) => splitter.push(ch),
            (Quote::None, '\n') => splitter.operator(";"),
            // `2>&1`, `>&2` and `&>file` are redirections, not background jobs.
            (Quote::None, '&')
                if splitter
                    .current
                    .text
                    .ends_with(|c: char| c == '>' || c == '<')
                    || next == Some('>') =>
            {
                splitter.push(ch);
            }
            (Quote::None, '&') => {
                if next == Some('&') {
                    chars.next();
                    splitter.operator("&&");
                } else {
                    splitter.operator("&");
                }
            }
            (Quote::None, '|') => match next {
                Some('|') => {
                    chars.next();
                    splitter.operator("||");
                }
                Some('&') => {
                    chars.next();
                    splitter.operator("|&");
                }
                _ => splitter.operator("|"),
            },
            (Quote::None, ';') => splitter.operator(";"),
            _ => splitter.push(ch),
        }
    }

    splitter.finish()
}
