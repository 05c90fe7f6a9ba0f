use std::collections::HashSet;
use std::rc::Rc;

use crate::ast::{Bind, Expr, ExprKind, Formal, Pattern, Pos};
use crate::error::MarlError;
use crate::store::canon_path;
use crate::symbols::Sym;

/// Name of the synthetic attribute `let … in body` desugars through. The
/// lexer can never produce it as an identifier, so user code cannot collide
/// with it.
const LET_BODY: &str = "<let-body>";

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Str(Vec<StrPart>),
    Path(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Semi,
    Colon,
    Comma,
    Dot,
    At,
    Question,
    Assign,
    Ellipsis,
    Eq,
    NEq,
    AndAnd,
    OrOr,
    Impl,
    Update,
    Concat,
    Plus,
    Not,
    Rec,
    Let,
    In,
    With,
    If,
    Then,
    Else,
    Assert,
    Inherit,
}

#[derive(Clone, Debug, PartialEq)]
enum StrPart {
    Text(String),
    Interp(Vec<Spanned>),
}

#[derive(Clone, Debug, PartialEq)]
struct Spanned {
    token: Token,
    pos: Pos,
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(n) => format!("integer `{}`", n),
        Token::Ident(name) => format!("`{}`", name),
        Token::Str(_) => "string literal".into(),
        Token::Path(p) => format!("path `{}`", p),
        Token::LBrace => "`{`".into(),
        Token::RBrace => "`}`".into(),
        Token::LBracket => "`[`".into(),
        Token::RBracket => "`]`".into(),
        Token::LParen => "`(`".into(),
        Token::RParen => "`)`".into(),
        Token::Semi => "`;`".into(),
        Token::Colon => "`:`".into(),
        Token::Comma => "`,`".into(),
        Token::Dot => "`.`".into(),
        Token::At => "`@`".into(),
        Token::Question => "`?`".into(),
        Token::Assign => "`=`".into(),
        Token::Ellipsis => "`...`".into(),
        Token::Eq => "`==`".into(),
        Token::NEq => "`!=`".into(),
        Token::AndAnd => "`&&`".into(),
        Token::OrOr => "`||`".into(),
        Token::Impl => "`->`".into(),
        Token::Update => "`//`".into(),
        Token::Concat => "`++`".into(),
        Token::Plus => "`+`".into(),
        Token::Not => "`!`".into(),
        Token::Rec => "`rec`".into(),
        Token::Let => "`let`".into(),
        Token::In => "`in`".into(),
        Token::With => "`with`".into(),
        Token::If => "`if`".into(),
        Token::Then => "`then`".into(),
        Token::Else => "`else`".into(),
        Token::Assert => "`assert`".into(),
        Token::Inherit => "`inherit`".into(),
    }
}

struct Lexer {
    src: Vec<char>,
    idx: usize,
    line: usize,
    col: usize,
    base_dir: String,
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '\''
}

fn is_path_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '+' | '~' | '/')
}

impl Lexer {
    fn new(src: &str, base_dir: &str) -> Self {
        Self {
            src: src.chars().collect(),
            idx: 0,
            line: 1,
            col: 1,
            base_dir: base_dir.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.idx).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src.get(self.idx + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.src.get(self.idx).copied()?;
        self.idx += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn error(&self, message: impl Into<String>) -> MarlError {
        MarlError::parse(message).with_pos(self.pos())
    }

    fn skip_trivia(&mut self) -> Result<(), MarlError> {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Spanned>, MarlError> {
        self.skip_trivia()?;
        let pos = self.pos();
        let Some(ch) = self.peek() else {
            return Ok(None);
        };

        let token = if ch.is_ascii_digit() {
            self.lex_int()?
        } else if is_ident_start(ch) {
            self.lex_ident()
        } else if ch == '"' {
            self.bump();
            self.lex_string()?
        } else if ch == '.' {
            if self.peek_at(1) == Some('.') && self.peek_at(2) == Some('.') {
                self.bump();
                self.bump();
                self.bump();
                Token::Ellipsis
            } else if self.peek_at(1) == Some('/')
                || (self.peek_at(1) == Some('.') && self.peek_at(2) == Some('/'))
            {
                self.lex_path()
            } else {
                self.bump();
                Token::Dot
            }
        } else if ch == '/' {
            if self.peek_at(1) == Some('/') {
                self.bump();
                self.bump();
                Token::Update
            } else if self.peek_at(1).map(is_path_char).unwrap_or(false) {
                self.lex_path()
            } else {
                return Err(self.error("unexpected character `/`"));
            }
        } else {
            self.bump();
            match ch {
                '{' => Token::LBrace,
                '}' => Token::RBrace,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ';' => Token::Semi,
                ':' => Token::Colon,
                ',' => Token::Comma,
                '@' => Token::At,
                '?' => Token::Question,
                '=' => {
                    if self.peek() == Some('=') {
                        self.bump();
                        Token::Eq
                    } else {
                        Token::Assign
                    }
                }
                '!' => {
                    if self.peek() == Some('=') {
                        self.bump();
                        Token::NEq
                    } else {
                        Token::Not
                    }
                }
                '&' => {
                    if self.peek() == Some('&') {
                        self.bump();
                        Token::AndAnd
                    } else {
                        return Err(self.error("unexpected character `&`"));
                    }
                }
                '|' => {
                    if self.peek() == Some('|') {
                        self.bump();
                        Token::OrOr
                    } else {
                        return Err(self.error("unexpected character `|`"));
                    }
                }
                '-' => {
                    if self.peek() == Some('>') {
                        self.bump();
                        Token::Impl
                    } else {
                        return Err(self.error("unexpected character `-`"));
                    }
                }
                '+' => {
                    if self.peek() == Some('+') {
                        self.bump();
                        Token::Concat
                    } else {
                        Token::Plus
                    }
                }
                other => {
                    return Err(self.error(format!("unexpected character `{}`", other)));
                }
            }
        };

        Ok(Some(Spanned { token, pos }))
    }

    fn lex_int(&mut self) -> Result<Token, MarlError> {
        let mut digits = String::new();
        while let Some(ch) = self.peek() {
            if !ch.is_ascii_digit() {
                break;
            }
            digits.push(ch);
            self.bump();
        }
        let value = digits
            .parse::<i64>()
            .map_err(|_| self.error(format!("integer literal `{}` is out of range", digits)))?;
        Ok(Token::Int(value))
    }

    fn lex_ident(&mut self) -> Token {
        let mut name = String::new();
        while let Some(ch) = self.peek() {
            if is_ident_char(ch) {
                name.push(ch);
                self.bump();
            } else if ch == '-' && self.peek_at(1).map(is_ident_char).unwrap_or(false) {
                name.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        match name.as_str() {
            "rec" => Token::Rec,
            "let" => Token::Let,
            "in" => Token::In,
            "with" => Token::With,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "assert" => Token::Assert,
            "inherit" => Token::Inherit,
            _ => Token::Ident(name),
        }
    }

    fn lex_path(&mut self) -> Token {
        let mut text = String::new();
        while let Some(ch) = self.peek() {
            if !is_path_char(ch) {
                break;
            }
            text.push(ch);
            self.bump();
        }
        // Relative path literals are anchored to the source file's directory
        // at parse time.
        let resolved = if text.starts_with('/') {
            canon_path(&text)
        } else {
            canon_path(&format!("{}/{}", self.base_dir, text))
        };
        Token::Path(resolved)
    }

    fn lex_string(&mut self) -> Result<Token, MarlError> {
        let mut parts: Vec<StrPart> = Vec::new();
        let mut buf = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('"') => {
                    self.bump();
                    if !buf.is_empty() || parts.is_empty() {
                        parts.push(StrPart::Text(buf));
                    }
                    return Ok(Token::Str(parts));
                }
                Some('\\') => {
                    self.bump();
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.error("unterminated string"))?;
                    match escaped {
                        'n' => buf.push('\n'),
                        'r' => buf.push('\r'),
                        't' => buf.push('\t'),
                        '\\' => buf.push('\\'),
                        '"' => buf.push('"'),
                        '$' => buf.push('$'),
                        other => {
                            return Err(
                                self.error(format!("invalid escape sequence `\\{}`", other))
                            )
                        }
                    }
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    if !buf.is_empty() {
                        parts.push(StrPart::Text(std::mem::take(&mut buf)));
                    }
                    parts.push(StrPart::Interp(self.lex_interpolation()?));
                }
                Some(other) => {
                    buf.push(other);
                    self.bump();
                }
            }
        }
    }

    /// Collect the tokens of a `${…}` splice up to its closing brace.
    fn lex_interpolation(&mut self) -> Result<Vec<Spanned>, MarlError> {
        let mut tokens = Vec::new();
        let mut depth = 0usize;
        loop {
            let Some(spanned) = self.next_token()? else {
                return Err(self.error("unterminated `${` interpolation"));
            };
            match &spanned.token {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    if depth == 0 {
                        return Ok(tokens);
                    }
                    depth -= 1;
                }
                _ => {}
            }
            tokens.push(spanned);
        }
    }
}

fn lex_all(src: &str, base_dir: &str) -> Result<Vec<Spanned>, MarlError> {
    let mut lexer = Lexer::new(src, base_dir);
    let mut tokens = Vec::new();
    while let Some(spanned) = lexer.next_token()? {
        tokens.push(spanned);
    }
    Ok(tokens)
}

/// Parse a source string; relative path literals resolve against the current
/// directory.
pub fn parse_source(src: &str) -> Result<Expr, MarlError> {
    let base = std::env::current_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/".into());
    parse_source_in(src, &base)
}

/// Parse a source string, resolving relative path literals against
/// `base_dir`.
pub fn parse_source_in(src: &str, base_dir: &str) -> Result<Expr, MarlError> {
    let tokens = lex_all(src, base_dir)?;
    let mut parser = Parser { tokens, idx: 0 };
    let expr = parser.parse_expr()?;
    if let Some(extra) = parser.peek_spanned() {
        return Err(MarlError::parse(format!(
            "unexpected {} after expression",
            describe(&extra.token)
        ))
        .with_pos(extra.pos));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    idx: usize,
}

impl Parser {
    fn peek_spanned(&self) -> Option<&Spanned> {
        self.tokens.get(self.idx)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx).map(|s| &s.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.idx + offset).map(|s| &s.token)
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.idx)
            .or_else(|| self.tokens.last())
            .map(|s| s.pos)
            .unwrap_or(Pos { line: 1, col: 1 })
    }

    fn bump(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.idx).cloned();
        if spanned.is_some() {
            self.idx += 1;
        }
        spanned
    }

    fn expect(&mut self, token: Token) -> Result<Pos, MarlError> {
        match self.peek_spanned() {
            Some(spanned) if spanned.token == token => {
                let pos = spanned.pos;
                self.idx += 1;
                Ok(pos)
            }
            Some(spanned) => Err(MarlError::parse(format!(
                "expected {}, found {}",
                describe(&token),
                describe(&spanned.token)
            ))
            .with_pos(spanned.pos)),
            None => Err(MarlError::parse(format!(
                "expected {}, found end of input",
                describe(&token)
            ))
            .with_pos(self.pos())),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(Sym, Pos), MarlError> {
        match self.peek_spanned().cloned() {
            Some(Spanned {
                token: Token::Ident(name),
                pos,
            }) => {
                self.idx += 1;
                Ok((Sym::new(&name), pos))
            }
            Some(spanned) => Err(MarlError::parse(format!(
                "expected {}, found {}",
                what,
                describe(&spanned.token)
            ))
            .with_pos(spanned.pos)),
            None => Err(
                MarlError::parse(format!("expected {}, found end of input", what))
                    .with_pos(self.pos()),
            ),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, MarlError> {
        let pos = self.pos();
        match self.peek() {
            Some(Token::Assert) => {
                self.bump();
                let cond = self.parse_expr()?;
                self.expect(Token::Semi)?;
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::Assert {
                        cond: Rc::new(cond),
                        body: Rc::new(body),
                    },
                    pos,
                ))
            }
            Some(Token::With) => {
                self.bump();
                let attrs = self.parse_expr()?;
                self.expect(Token::Semi)?;
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::With {
                        attrs: Rc::new(attrs),
                        body: Rc::new(body),
                    },
                    pos,
                ))
            }
            Some(Token::Let) => self.parse_let(),
            Some(Token::If) => {
                self.bump();
                let cond = self.parse_expr()?;
                self.expect(Token::Then)?;
                let then = self.parse_expr()?;
                self.expect(Token::Else)?;
                let els = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::If {
                        cond: Rc::new(cond),
                        then: Rc::new(then),
                        els: Rc::new(els),
                    },
                    pos,
                ))
            }
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::Colon) => {
                let (name, pos) = self.expect_ident("parameter name")?;
                self.expect(Token::Colon)?;
                let body = self.parse_expr()?;
                Ok(Expr::new(
                    ExprKind::Function {
                        pattern: Rc::new(Pattern::Var(name)),
                        body: Rc::new(body),
                    },
                    pos,
                ))
            }
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::At) => {
                let (alias, pos) = self.expect_ident("parameter name")?;
                self.expect(Token::At)?;
                self.parse_pattern_lambda(Some(alias), pos)
            }
            Some(Token::LBrace) if self.brace_starts_pattern() => {
                self.parse_pattern_lambda(None, pos)
            }
            _ => self.parse_op_impl(),
        }
    }

    /// Decide whether the `{` at the cursor opens an attribute-set pattern
    /// rather than an attribute-set literal, by looking behind the matching
    /// `}` for `:` or `@`.
    fn brace_starts_pattern(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.idx;
        while let Some(spanned) = self.tokens.get(i) {
            match spanned.token {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.tokens.get(i + 1).map(|s| &s.token),
                            Some(Token::Colon) | Some(Token::At)
                        );
                    }
                }
                _ => {}
            }
            i += 1;
        }
        false
    }

    fn parse_let(&mut self) -> Result<Expr, MarlError> {
        let pos = self.expect(Token::Let)?;
        let (mut rec_binds, nonrec_binds) = self.parse_binds(&Token::In)?;
        self.expect(Token::In)?;
        let body = self.parse_expr()?;
        let body_name = Sym::new(LET_BODY);
        rec_binds.push(Bind {
            name: body_name.clone(),
            expr: Rc::new(body),
            pos,
        });
        let set = Expr::new(
            ExprKind::Rec {
                rec_binds,
                nonrec_binds,
            },
            pos,
        );
        Ok(Expr::new(
            ExprKind::Select {
                subject: Rc::new(set),
                name: body_name,
            },
            pos,
        ))
    }

    /// Parse `name = expr;` and `inherit` bindings up to (not including)
    /// `terminator`. Returns plain binds and inherit-derived binds
    /// separately; the latter always close over the enclosing scope.
    fn parse_binds(&mut self, terminator: &Token) -> Result<(Vec<Bind>, Vec<Bind>), MarlError> {
        let mut binds = Vec::new();
        let mut inherits = Vec::new();
        let mut seen: HashSet<Sym> = HashSet::new();
        loop {
            match self.peek() {
                Some(token) if token == terminator => return Ok((binds, inherits)),
                Some(Token::Inherit) => {
                    self.bump();
                    let source = if self.peek() == Some(&Token::LParen) {
                        self.bump();
                        let subject = self.parse_expr()?;
                        self.expect(Token::RParen)?;
                        Some(Rc::new(subject))
                    } else {
                        None
                    };
                    while matches!(self.peek(), Some(Token::Ident(_))) {
                        let (name, pos) = self.expect_ident("attribute name")?;
                        if !seen.insert(name.clone()) {
                            return Err(MarlError::parse(format!(
                                "duplicate attribute `{}`",
                                name
                            ))
                            .with_pos(pos));
                        }
                        let kind = match &source {
                            Some(subject) => ExprKind::Select {
                                subject: subject.clone(),
                                name: name.clone(),
                            },
                            None => ExprKind::Var(name.clone()),
                        };
                        inherits.push(Bind {
                            name,
                            expr: Rc::new(Expr::new(kind, pos)),
                            pos,
                        });
                    }
                    self.expect(Token::Semi)?;
                }
                Some(Token::Ident(_)) => {
                    let (name, pos) = self.expect_ident("attribute name")?;
                    if !seen.insert(name.clone()) {
                        return Err(
                            MarlError::parse(format!("duplicate attribute `{}`", name))
                                .with_pos(pos),
                        );
                    }
                    self.expect(Token::Assign)?;
                    let expr = self.parse_expr()?;
                    self.expect(Token::Semi)?;
                    binds.push(Bind {
                        name,
                        expr: Rc::new(expr),
                        pos,
                    });
                }
                Some(other) => {
                    return Err(MarlError::parse(format!(
                        "expected attribute binding, found {}",
                        describe(&other.clone())
                    ))
                    .with_pos(self.pos()))
                }
                None => {
                    return Err(MarlError::parse(format!(
                        "expected {}, found end of input",
                        describe(terminator)
                    ))
                    .with_pos(self.pos()))
                }
            }
        }
    }

    fn parse_pattern_lambda(
        &mut self,
        alias: Option<Sym>,
        pos: Pos,
    ) -> Result<Expr, MarlError> {
        self.expect(Token::LBrace)?;
        let mut formals = Vec::new();
        let mut ellipsis = false;
        let mut seen: HashSet<Sym> = HashSet::new();
        loop {
            match self.peek() {
                Some(Token::RBrace) => break,
                Some(Token::Ellipsis) => {
                    self.bump();
                    ellipsis = true;
                    break;
                }
                _ => {
                    let (name, formal_pos) = self.expect_ident("formal parameter name")?;
                    if !seen.insert(name.clone()) {
                        return Err(MarlError::parse(format!(
                            "duplicate formal parameter `{}`",
                            name
                        ))
                        .with_pos(formal_pos));
                    }
                    let default = if self.peek() == Some(&Token::Question) {
                        self.bump();
                        Some(Rc::new(self.parse_expr()?))
                    } else {
                        None
                    };
                    formals.push(Formal { name, default });
                    if self.peek() == Some(&Token::Comma) {
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        self.expect(Token::RBrace)?;
        let alias = match (alias, self.peek()) {
            (None, Some(Token::At)) => {
                self.bump();
                let (name, _) = self.expect_ident("parameter name")?;
                Some(name)
            }
            (existing, _) => existing,
        };
        self.expect(Token::Colon)?;
        let body = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Function {
                pattern: Rc::new(Pattern::Attrs {
                    formals,
                    ellipsis,
                    alias,
                }),
                body: Rc::new(body),
            },
            pos,
        ))
    }

    fn parse_op_impl(&mut self) -> Result<Expr, MarlError> {
        let left = self.parse_op_or()?;
        if self.peek() == Some(&Token::Impl) {
            let pos = self.pos();
            self.bump();
            let right = self.parse_op_impl()?;
            return Ok(Expr::new(
                ExprKind::OpImpl(Rc::new(left), Rc::new(right)),
                pos,
            ));
        }
        Ok(left)
    }

    fn parse_op_or(&mut self) -> Result<Expr, MarlError> {
        let mut left = self.parse_op_and()?;
        while self.peek() == Some(&Token::OrOr) {
            let pos = self.pos();
            self.bump();
            let right = self.parse_op_and()?;
            left = Expr::new(ExprKind::OpOr(Rc::new(left), Rc::new(right)), pos);
        }
        Ok(left)
    }

    fn parse_op_and(&mut self) -> Result<Expr, MarlError> {
        let mut left = self.parse_op_eq()?;
        while self.peek() == Some(&Token::AndAnd) {
            let pos = self.pos();
            self.bump();
            let right = self.parse_op_eq()?;
            left = Expr::new(ExprKind::OpAnd(Rc::new(left), Rc::new(right)), pos);
        }
        Ok(left)
    }

    fn parse_op_eq(&mut self) -> Result<Expr, MarlError> {
        let left = self.parse_op_update()?;
        match self.peek() {
            Some(Token::Eq) => {
                let pos = self.pos();
                self.bump();
                let right = self.parse_op_update()?;
                Ok(Expr::new(ExprKind::OpEq(Rc::new(left), Rc::new(right)), pos))
            }
            Some(Token::NEq) => {
                let pos = self.pos();
                self.bump();
                let right = self.parse_op_update()?;
                Ok(Expr::new(
                    ExprKind::OpNEq(Rc::new(left), Rc::new(right)),
                    pos,
                ))
            }
            _ => Ok(left),
        }
    }

    fn parse_op_update(&mut self) -> Result<Expr, MarlError> {
        let left = self.parse_op_not()?;
        if self.peek() == Some(&Token::Update) {
            let pos = self.pos();
            self.bump();
            let right = self.parse_op_update()?;
            return Ok(Expr::new(
                ExprKind::OpUpdate(Rc::new(left), Rc::new(right)),
                pos,
            ));
        }
        Ok(left)
    }

    fn parse_op_not(&mut self) -> Result<Expr, MarlError> {
        if self.peek() == Some(&Token::Not) {
            let pos = self.pos();
            self.bump();
            let operand = self.parse_op_not()?;
            return Ok(Expr::new(ExprKind::OpNot(Rc::new(operand)), pos));
        }
        self.parse_op_plus()
    }

    /// A `+` chain folds into a single concatenation node, so the evaluator
    /// sees all components at once.
    fn parse_op_plus(&mut self) -> Result<Expr, MarlError> {
        let first = self.parse_op_concat()?;
        if self.peek() != Some(&Token::Plus) {
            return Ok(first);
        }
        let pos = first.pos;
        let mut parts = vec![Rc::new(first)];
        while self.peek() == Some(&Token::Plus) {
            self.bump();
            parts.push(Rc::new(self.parse_op_concat()?));
        }
        Ok(Expr::new(ExprKind::ConcatStrings(parts), pos))
    }

    fn parse_op_concat(&mut self) -> Result<Expr, MarlError> {
        let left = self.parse_op_has_attr()?;
        if self.peek() == Some(&Token::Concat) {
            let pos = self.pos();
            self.bump();
            let right = self.parse_op_concat()?;
            return Ok(Expr::new(
                ExprKind::OpConcat(Rc::new(left), Rc::new(right)),
                pos,
            ));
        }
        Ok(left)
    }

    fn parse_op_has_attr(&mut self) -> Result<Expr, MarlError> {
        let mut left = self.parse_app()?;
        while self.peek() == Some(&Token::Question) {
            let pos = self.pos();
            self.bump();
            let (name, _) = self.expect_ident("attribute name")?;
            left = Expr::new(
                ExprKind::HasAttr {
                    subject: Rc::new(left),
                    name,
                },
                pos,
            );
        }
        Ok(left)
    }

    fn starts_atom(token: &Token) -> bool {
        matches!(
            token,
            Token::Int(_)
                | Token::Ident(_)
                | Token::Str(_)
                | Token::Path(_)
                | Token::LParen
                | Token::LBracket
                | Token::LBrace
                | Token::Rec
        )
    }

    fn parse_app(&mut self) -> Result<Expr, MarlError> {
        let mut fun = self.parse_select()?;
        while self.peek().map(Self::starts_atom).unwrap_or(false) {
            let pos = fun.pos;
            let arg = self.parse_select()?;
            fun = Expr::new(
                ExprKind::Call {
                    fun: Rc::new(fun),
                    arg: Rc::new(arg),
                },
                pos,
            );
        }
        Ok(fun)
    }

    fn parse_select(&mut self) -> Result<Expr, MarlError> {
        let mut subject = self.parse_atom()?;
        while self.peek() == Some(&Token::Dot) {
            let pos = self.pos();
            self.bump();
            let (name, _) = self.expect_ident("attribute name")?;
            subject = Expr::new(
                ExprKind::Select {
                    subject: Rc::new(subject),
                    name,
                },
                pos,
            );
        }
        Ok(subject)
    }

    fn parse_atom(&mut self) -> Result<Expr, MarlError> {
        let pos = self.pos();
        match self.peek().cloned() {
            Some(Token::Int(n)) => {
                self.bump();
                Ok(Expr::new(ExprKind::Int(n), pos))
            }
            Some(Token::Str(parts)) => {
                self.bump();
                self.desugar_string(parts, pos)
            }
            Some(Token::Path(path)) => {
                self.bump();
                Ok(Expr::new(ExprKind::Path(path), pos))
            }
            Some(Token::Ident(name)) => {
                self.bump();
                Ok(Expr::new(ExprKind::Var(Sym::new(&name)), pos))
            }
            Some(Token::LParen) => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.bump();
                let mut items = Vec::new();
                while self.peek() != Some(&Token::RBracket) {
                    if self.peek().is_none() {
                        return Err(MarlError::parse("expected `]`, found end of input")
                            .with_pos(self.pos()));
                    }
                    items.push(Rc::new(self.parse_select()?));
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::new(ExprKind::List(items), pos))
            }
            Some(Token::LBrace) => {
                self.bump();
                let (mut binds, inherits) = self.parse_binds(&Token::RBrace)?;
                self.expect(Token::RBrace)?;
                binds.extend(inherits);
                Ok(Expr::new(ExprKind::Attrs(binds), pos))
            }
            Some(Token::Rec) => {
                self.bump();
                self.expect(Token::LBrace)?;
                let (rec_binds, nonrec_binds) = self.parse_binds(&Token::RBrace)?;
                self.expect(Token::RBrace)?;
                Ok(Expr::new(
                    ExprKind::Rec {
                        rec_binds,
                        nonrec_binds,
                    },
                    pos,
                ))
            }
            Some(other) => Err(MarlError::parse(format!(
                "unexpected {}",
                describe(&other)
            ))
            .with_pos(pos)),
            None => {
                Err(MarlError::parse("unexpected end of input").with_pos(self.pos()))
            }
        }
    }

    /// A literal without splices stays a plain string; one with splices
    /// becomes a concatenation. A leading splice gets an empty string
    /// prepended so the result is always a string, never a path or integer.
    fn desugar_string(&mut self, parts: Vec<StrPart>, pos: Pos) -> Result<Expr, MarlError> {
        if parts.iter().all(|p| matches!(p, StrPart::Text(_))) {
            let mut text = String::new();
            for part in parts {
                if let StrPart::Text(t) = part {
                    text.push_str(&t);
                }
            }
            return Ok(Expr::new(ExprKind::Str(text), pos));
        }

        let mut pieces: Vec<Rc<Expr>> = Vec::new();
        if matches!(parts.first(), Some(StrPart::Interp(_))) {
            pieces.push(Rc::new(Expr::new(ExprKind::Str(String::new()), pos)));
        }
        for part in parts {
            match part {
                StrPart::Text(text) => {
                    pieces.push(Rc::new(Expr::new(ExprKind::Str(text), pos)));
                }
                StrPart::Interp(tokens) => {
                    let mut sub = Parser { tokens, idx: 0 };
                    let inner = sub.parse_expr()?;
                    if let Some(extra) = sub.peek_spanned() {
                        return Err(MarlError::parse(format!(
                            "unexpected {} in interpolation",
                            describe(&extra.token)
                        ))
                        .with_pos(extra.pos));
                    }
                    pieces.push(Rc::new(inner));
                }
            }
        }
        Ok(Expr::new(ExprKind::ConcatStrings(pieces), pos))
    }
}
