//! A small expression frontend.
//!
//! The real compiler is an external collaborator; this one exists so the
//! driver binary can execute scripts and run a REPL against the core. It
//! covers the expression subset (literals, symbols, calls with named
//! arguments and `...`, `function` with defaults, assignment, `<<-`,
//! arithmetic, comparison, `:`, `[[`, `if`/`else`, braces) and lowers each
//! program to an ordinary [`Prototype`].

use crate::code::{CompiledCall, Instruction, Opcode, Prototype};
use crate::error::{Error, Result};
use crate::intern::intern;
use crate::state::Global;
use crate::value::{Type, Value, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE};

#[derive(Debug)]
pub enum FrontendError {
    /// The input is a syntactically valid prefix; the REPL should keep
    /// reading.
    Incomplete,
    Message(String),
}

impl FrontendError {
    fn msg(m: impl Into<String>) -> FrontendError {
        FrontendError::Message(m.into())
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num { value: f64, int: bool },
    Str(String),
    Ident(String),
    True,
    False,
    Na,
    NullTok,
    If,
    Else,
    FunctionTok,
    Arrow,      // <-
    SuperArrow, // <<-
    EqSign,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Modulo,
    Caret,
    Bang,
    LParen,
    RParen,
    LBrace,
    RBrace,
    DLBracket,
    DRBracket,
    Comma,
    Colon,
    DotsTok,
    Newline,
    Eof,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn peek2(&self) -> u8 {
        *self.src.get(self.pos + 1).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn tokens(mut self) -> std::result::Result<Vec<Tok>, FrontendError> {
        let mut out = Vec::new();
        loop {
            let t = self.next_token()?;
            let done = t == Tok::Eof;
            out.push(t);
            if done {
                return Ok(out);
            }
        }
    }

    fn next_token(&mut self) -> std::result::Result<Tok, FrontendError> {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.pos += 1;
                }
                b'#' => {
                    while self.peek() != b'\n' && self.peek() != 0 {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let c = self.peek();
        match c {
            0 => Ok(Tok::Eof),
            b'\n' | b';' => {
                self.pos += 1;
                Ok(Tok::Newline)
            }
            b'0'..=b'9' => self.number(),
            b'.' if self.peek2().is_ascii_digit() => self.number(),
            b'.' if self.peek2() == b'.' => {
                // "..."
                if self.src.get(self.pos + 2) == Some(&b'.') {
                    self.pos += 3;
                    Ok(Tok::DotsTok)
                } else {
                    Err(FrontendError::msg("unexpected '..'"))
                }
            }
            b'"' | b'\'' => self.string(c),
            b'_' | b'.' | b'a'..=b'z' | b'A'..=b'Z' => Ok(self.ident()),
            b'<' => {
                self.pos += 1;
                if self.peek() == b'-' {
                    self.pos += 1;
                    Ok(Tok::Arrow)
                } else if self.peek() == b'<' && self.peek2() == b'-' {
                    self.pos += 2;
                    Ok(Tok::SuperArrow)
                } else if self.peek() == b'=' {
                    self.pos += 1;
                    Ok(Tok::Le)
                } else {
                    Ok(Tok::Lt)
                }
            }
            b'>' => {
                self.pos += 1;
                if self.peek() == b'=' {
                    self.pos += 1;
                    Ok(Tok::Ge)
                } else {
                    Ok(Tok::Gt)
                }
            }
            b'=' => {
                self.pos += 1;
                if self.peek() == b'=' {
                    self.pos += 1;
                    Ok(Tok::Eq)
                } else {
                    Ok(Tok::EqSign)
                }
            }
            b'!' => {
                self.pos += 1;
                if self.peek() == b'=' {
                    self.pos += 1;
                    Ok(Tok::Neq)
                } else {
                    Ok(Tok::Bang)
                }
            }
            b'%' => {
                self.pos += 1;
                if self.peek() == b'%' {
                    self.pos += 1;
                    Ok(Tok::Modulo)
                } else {
                    Err(FrontendError::msg("unsupported %-operator"))
                }
            }
            b'[' => {
                self.pos += 1;
                if self.peek() == b'[' {
                    self.pos += 1;
                    Ok(Tok::DLBracket)
                } else {
                    Err(FrontendError::msg("single-bracket indexing is not supported"))
                }
            }
            b']' => {
                self.pos += 1;
                if self.peek() == b']' {
                    self.pos += 1;
                    Ok(Tok::DRBracket)
                } else {
                    Err(FrontendError::msg("unexpected ']'"))
                }
            }
            b'+' => {
                self.pos += 1;
                Ok(Tok::Plus)
            }
            b'-' => {
                self.pos += 1;
                Ok(Tok::Minus)
            }
            b'*' => {
                self.pos += 1;
                Ok(Tok::Star)
            }
            b'/' => {
                self.pos += 1;
                Ok(Tok::Slash)
            }
            b'^' => {
                self.pos += 1;
                Ok(Tok::Caret)
            }
            b'(' => {
                self.pos += 1;
                Ok(Tok::LParen)
            }
            b')' => {
                self.pos += 1;
                Ok(Tok::RParen)
            }
            b'{' => {
                self.pos += 1;
                Ok(Tok::LBrace)
            }
            b'}' => {
                self.pos += 1;
                Ok(Tok::RBrace)
            }
            b',' => {
                self.pos += 1;
                Ok(Tok::Comma)
            }
            b':' => {
                self.pos += 1;
                Ok(Tok::Colon)
            }
            _ => Err(FrontendError::msg(format!(
                "unexpected character '{}'",
                c as char
            ))),
        }
    }

    fn number(&mut self) -> std::result::Result<Tok, FrontendError> {
        let start = self.pos;
        let mut int = true;
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek() == b'.' {
            int = false;
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.peek() == b'e' || self.peek() == b'E' {
            int = false;
            self.pos += 1;
            if self.peek() == b'+' || self.peek() == b'-' {
                self.pos += 1;
            }
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        let value: f64 = text
            .parse()
            .map_err(|_| FrontendError::msg(format!("bad number '{}'", text)))?;
        if self.peek() == b'L' {
            self.pos += 1;
            return Ok(Tok::Num { value, int: true });
        }
        Ok(Tok::Num { value, int })
    }

    fn string(&mut self, quote: u8) -> std::result::Result<Tok, FrontendError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.bump() {
                0 => return Err(FrontendError::Incomplete),
                b'\\' => match self.bump() {
                    b'n' => out.push('\n'),
                    b't' => out.push('\t'),
                    b'\\' => out.push('\\'),
                    c if c == quote => out.push(c as char),
                    c => {
                        out.push('\\');
                        out.push(c as char);
                    }
                },
                c if c == quote => return Ok(Tok::Str(out)),
                c => out.push(c as char),
            }
        }
    }

    fn ident(&mut self) -> Tok {
        let start = self.pos;
        while matches!(self.peek(), b'_' | b'.' | b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9') {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        match text {
            "TRUE" => Tok::True,
            "FALSE" => Tok::False,
            "NA" => Tok::Na,
            "NULL" => Tok::NullTok,
            "if" => Tok::If,
            "else" => Tok::Else,
            "function" => Tok::FunctionTok,
            _ => Tok::Ident(text.to_string()),
        }
    }
}

// ── AST ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinTok {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Colon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnTok {
    Neg,
    Not,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Integer(i64),
    Double(f64),
    Str(String),
    Logical(u8),
    Null,
    Symbol(String),
    Dots,
    Missing,
    Binary(BinTok, Box<Expr>, Box<Expr>),
    Unary(UnTok, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<(Option<String>, Expr)>),
    Function(Vec<(String, Option<Expr>)>, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Block(Vec<Expr>),
    Assign {
        name: String,
        value: Box<Expr>,
        superassign: bool,
    },
}

// ── Parser ────────────────────────────────────────────────────────────

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

type PResult<T> = std::result::Result<T, FrontendError>;

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos]
    }

    fn peek2(&self) -> &Tok {
        self.toks.get(self.pos + 1).unwrap_or(&Tok::Eof)
    }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.pos].clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Tok) -> bool {
        if self.peek() == t {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Tok, what: &str) -> PResult<()> {
        if self.eat(t) {
            Ok(())
        } else if *self.peek() == Tok::Eof {
            Err(FrontendError::Incomplete)
        } else {
            Err(FrontendError::msg(format!(
                "expected {} near {:?}",
                what,
                self.peek()
            )))
        }
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == Tok::Newline {
            self.bump();
        }
    }

    fn program(&mut self) -> PResult<Vec<Expr>> {
        let mut out = Vec::new();
        self.skip_newlines();
        while *self.peek() != Tok::Eof {
            out.push(self.expr()?);
            match self.peek() {
                Tok::Newline => self.skip_newlines(),
                Tok::Eof => {}
                t => return Err(FrontendError::msg(format!("unexpected {:?}", t))),
            }
        }
        Ok(out)
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.assign()
    }

    fn assign(&mut self) -> PResult<Expr> {
        let lhs = self.comparison()?;
        let superassign = match self.peek() {
            Tok::Arrow | Tok::EqSign => false,
            Tok::SuperArrow => true,
            _ => return Ok(lhs),
        };
        self.bump();
        self.skip_newlines();
        let name = match lhs {
            Expr::Symbol(n) => n,
            _ => return Err(FrontendError::msg("invalid assignment target")),
        };
        let value = self.assign()?;
        Ok(Expr::Assign {
            name,
            value: Box::new(value),
            superassign,
        })
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut lhs = self.addsub()?;
        loop {
            let op = match self.peek() {
                Tok::Eq => BinTok::Eq,
                Tok::Neq => BinTok::Neq,
                Tok::Lt => BinTok::Lt,
                Tok::Le => BinTok::Le,
                Tok::Gt => BinTok::Gt,
                Tok::Ge => BinTok::Ge,
                _ => return Ok(lhs),
            };
            self.bump();
            self.skip_newlines();
            let rhs = self.addsub()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn addsub(&mut self) -> PResult<Expr> {
        let mut lhs = self.muldiv()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinTok::Add,
                Tok::Minus => BinTok::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            self.skip_newlines();
            let rhs = self.muldiv()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn muldiv(&mut self) -> PResult<Expr> {
        let mut lhs = self.range()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinTok::Mul,
                Tok::Slash => BinTok::Div,
                Tok::Modulo => BinTok::Mod,
                _ => return Ok(lhs),
            };
            self.bump();
            self.skip_newlines();
            let rhs = self.range()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn range(&mut self) -> PResult<Expr> {
        let lhs = self.unary()?;
        if self.eat(&Tok::Colon) {
            self.skip_newlines();
            let rhs = self.unary()?;
            return Ok(Expr::Binary(BinTok::Colon, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<Expr> {
        match self.peek() {
            Tok::Minus => {
                self.bump();
                Ok(Expr::Unary(UnTok::Neg, Box::new(self.unary()?)))
            }
            Tok::Bang => {
                self.bump();
                Ok(Expr::Unary(UnTok::Not, Box::new(self.unary()?)))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if self.eat(&Tok::Caret) {
            self.skip_newlines();
            let rhs = self.unary()?;
            return Ok(Expr::Binary(BinTok::Pow, Box::new(base), Box::new(rhs)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut e = self.primary()?;
        loop {
            match self.peek() {
                Tok::LParen => {
                    self.bump();
                    let args = self.call_args()?;
                    e = Expr::Call(Box::new(e), args);
                }
                Tok::DLBracket => {
                    self.bump();
                    self.skip_newlines();
                    let idx = self.expr()?;
                    self.skip_newlines();
                    self.expect(&Tok::DRBracket, "']]'")?;
                    e = Expr::Index(Box::new(e), Box::new(idx));
                }
                _ => return Ok(e),
            }
        }
    }

    fn call_args(&mut self) -> PResult<Vec<(Option<String>, Expr)>> {
        let mut args = Vec::new();
        self.skip_newlines();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            self.skip_newlines();
            // A hole: f(, x) or f(x, ).
            if *self.peek() == Tok::Comma {
                args.push((None, Expr::Missing));
                self.bump();
                continue;
            }
            if *self.peek() == Tok::RParen {
                args.push((None, Expr::Missing));
                self.bump();
                return Ok(args);
            }
            // name = value?
            let name = match (self.peek(), self.peek2()) {
                (Tok::Ident(n), Tok::EqSign) => {
                    let n = n.clone();
                    self.bump();
                    self.bump();
                    self.skip_newlines();
                    Some(n)
                }
                (Tok::Str(n), Tok::EqSign) => {
                    let n = n.clone();
                    self.bump();
                    self.bump();
                    self.skip_newlines();
                    Some(n)
                }
                _ => None,
            };
            let value = if *self.peek() == Tok::DotsTok {
                self.bump();
                Expr::Dots
            } else {
                self.expr()?
            };
            args.push((name, value));
            self.skip_newlines();
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RParen, "')'")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> PResult<Expr> {
        match self.bump() {
            Tok::Num { value, int } => {
                if int && value.fract() == 0.0 {
                    Ok(Expr::Integer(value as i64))
                } else {
                    Ok(Expr::Double(value))
                }
            }
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::True => Ok(Expr::Logical(LOGICAL_TRUE)),
            Tok::False => Ok(Expr::Logical(LOGICAL_FALSE)),
            Tok::Na => Ok(Expr::Logical(LOGICAL_NA)),
            Tok::NullTok => Ok(Expr::Null),
            Tok::Ident(n) => Ok(Expr::Symbol(n)),
            Tok::DotsTok => Ok(Expr::Dots),
            Tok::LParen => {
                self.skip_newlines();
                let e = self.expr()?;
                self.skip_newlines();
                self.expect(&Tok::RParen, "')'")?;
                Ok(e)
            }
            Tok::LBrace => {
                let mut stmts = Vec::new();
                self.skip_newlines();
                while !self.eat(&Tok::RBrace) {
                    if *self.peek() == Tok::Eof {
                        return Err(FrontendError::Incomplete);
                    }
                    stmts.push(self.expr()?);
                    self.skip_newlines();
                }
                Ok(Expr::Block(stmts))
            }
            Tok::If => {
                self.expect(&Tok::LParen, "'('")?;
                self.skip_newlines();
                let cond = self.expr()?;
                self.skip_newlines();
                self.expect(&Tok::RParen, "')'")?;
                self.skip_newlines();
                let yes = self.expr()?;
                let save = self.pos;
                self.skip_newlines();
                if self.eat(&Tok::Else) {
                    self.skip_newlines();
                    let no = self.expr()?;
                    Ok(Expr::If(Box::new(cond), Box::new(yes), Some(Box::new(no))))
                } else {
                    self.pos = save;
                    Ok(Expr::If(Box::new(cond), Box::new(yes), None))
                }
            }
            Tok::FunctionTok => {
                self.expect(&Tok::LParen, "'('")?;
                let mut params = Vec::new();
                self.skip_newlines();
                if !self.eat(&Tok::RParen) {
                    loop {
                        self.skip_newlines();
                        let name = match self.bump() {
                            Tok::Ident(n) => n,
                            Tok::DotsTok => "...".to_string(),
                            Tok::Eof => return Err(FrontendError::Incomplete),
                            t => {
                                return Err(FrontendError::msg(format!(
                                    "bad parameter near {:?}",
                                    t
                                )))
                            }
                        };
                        let default = if self.eat(&Tok::EqSign) {
                            self.skip_newlines();
                            Some(self.expr()?)
                        } else {
                            None
                        };
                        params.push((name, default));
                        self.skip_newlines();
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(&Tok::RParen, "')'")?;
                        break;
                    }
                }
                self.skip_newlines();
                let body = self.expr()?;
                Ok(Expr::Function(params, Box::new(body)))
            }
            Tok::Eof => Err(FrontendError::Incomplete),
            t => Err(FrontendError::msg(format!("unexpected {:?}", t))),
        }
    }
}

/// Parse a program into top-level expressions.
pub fn parse(source: &str) -> std::result::Result<Vec<Expr>, FrontendError> {
    let toks = Lexer::new(source).tokens()?;
    Parser { toks, pos: 0 }.program()
}

// ── Compiler ──────────────────────────────────────────────────────────

struct Compiler<'g> {
    global: &'g Global,
    constants: Vec<Value>,
    calls: Vec<CompiledCall>,
    code: Vec<Instruction>,
    next_reg: i64,
    max_reg: i64,
}

impl<'g> Compiler<'g> {
    /// `reserve` registers stay untouched; promise bodies reserve the three
    /// forcing-seed registers.
    fn new(global: &'g Global, reserve: i64) -> Compiler<'g> {
        Compiler {
            global,
            constants: Vec::new(),
            calls: Vec::new(),
            code: Vec::new(),
            next_reg: reserve,
            max_reg: reserve,
        }
    }

    fn alloc(&mut self) -> i64 {
        let r = self.next_reg;
        self.next_reg += 1;
        self.max_reg = self.max_reg.max(self.next_reg);
        r
    }

    fn constant(&mut self, v: Value) -> i64 {
        self.constants.push(v);
        (self.constants.len() - 1) as i64
    }

    fn emit(&mut self, i: Instruction) {
        self.code.push(i);
    }

    fn literal(&self, e: &Expr) -> Option<Value> {
        match e {
            Expr::Integer(x) => Some(Value::integer(*x)),
            Expr::Double(x) => Some(Value::double(*x)),
            Expr::Str(s) => Some(Value::character(intern(s))),
            Expr::Logical(b) => Some(Value::logical(*b)),
            Expr::Null => Some(Value::null()),
            _ => None,
        }
    }

    fn compile(&mut self, e: &Expr) -> Result<i64> {
        if let Some(v) = self.literal(e) {
            let k = self.constant(v);
            let r = self.alloc();
            self.emit(Instruction::ac(Opcode::Kget, k, r));
            return Ok(r);
        }
        match e {
            Expr::Symbol(n) => {
                let k = self.constant(Value::symbol(intern(n)));
                let r = self.alloc();
                self.emit(Instruction::ac(Opcode::Ld, k, r));
                Ok(r)
            }
            Expr::Dots => Err(Error::compile("'...' used out of context")),
            Expr::Missing => Err(Error::compile("missing argument used out of context")),
            Expr::Binary(op, a, b) => {
                let ra = self.compile(a)?;
                let rb = self.compile(b)?;
                let rc = self.alloc();
                let opcode = match op {
                    BinTok::Add => Opcode::Add,
                    BinTok::Sub => Opcode::Sub,
                    BinTok::Mul => Opcode::Mul,
                    BinTok::Div => Opcode::Div,
                    BinTok::Mod => Opcode::Mod,
                    BinTok::Pow => Opcode::Pow,
                    BinTok::Eq => Opcode::Eq,
                    BinTok::Neq => Opcode::Neq,
                    BinTok::Lt => Opcode::Lt,
                    BinTok::Le => Opcode::Le,
                    BinTok::Gt => Opcode::Gt,
                    BinTok::Ge => Opcode::Ge,
                    BinTok::Colon => Opcode::Seq,
                };
                self.emit(Instruction::abc(opcode, ra, rb, rc));
                Ok(rc)
            }
            Expr::Unary(op, a) => {
                let ra = self.compile(a)?;
                let rc = self.alloc();
                let opcode = match op {
                    UnTok::Neg => Opcode::Neg,
                    UnTok::Not => Opcode::Not,
                };
                self.emit(Instruction::ac(opcode, ra, rc));
                Ok(rc)
            }
            Expr::Index(a, idx) => {
                let ra = self.compile(a)?;
                let rb = self.compile(idx)?;
                let rc = self.alloc();
                self.emit(Instruction::abc(Opcode::Get, ra, rb, rc));
                Ok(rc)
            }
            Expr::Assign {
                name,
                value,
                superassign,
            } => {
                let r = self.compile(value)?;
                let k = self.constant(Value::symbol(intern(name)));
                let op = if *superassign { Opcode::Sts } else { Opcode::St };
                self.emit(Instruction::ac(op, k, r));
                Ok(r)
            }
            Expr::Block(stmts) => {
                let mut last = None;
                for s in stmts {
                    last = Some(self.compile(s)?);
                }
                match last {
                    Some(r) => Ok(r),
                    None => {
                        let k = self.constant(Value::null());
                        let r = self.alloc();
                        self.emit(Instruction::ac(Opcode::Kget, k, r));
                        Ok(r)
                    }
                }
            }
            Expr::If(cond, yes, no) => {
                let rc = self.compile(cond)?;
                let out = self.alloc();
                let jc_at = self.code.len();
                self.emit(Instruction::abc(Opcode::Jc, 0, 0, rc));
                let ry = self.compile(yes)?;
                self.emit(Instruction::ac(Opcode::Mov, ry, out));
                let jmp_at = self.code.len();
                self.emit(Instruction::a(Opcode::Jmp, 0));
                let false_at = self.code.len();
                let rn = match no {
                    Some(no) => self.compile(no)?,
                    None => {
                        let k = self.constant(Value::null());
                        let r = self.alloc();
                        self.emit(Instruction::ac(Opcode::Kget, k, r));
                        r
                    }
                };
                self.emit(Instruction::ac(Opcode::Mov, rn, out));
                let end = self.code.len();
                self.code[jc_at].a = 1;
                self.code[jc_at].b = (false_at - jc_at) as i64;
                self.code[jmp_at].a = (end - jmp_at) as i64;
                Ok(out)
            }
            Expr::Function(params, body) => {
                let template = self.compile_function(params, body)?;
                let k = self.constant(template);
                let r = self.alloc();
                self.emit(Instruction::ac(Opcode::Fun, k, r));
                Ok(r)
            }
            Expr::Call(func, args) => self.compile_call(func, args),
            _ => unreachable!("literals handled above"),
        }
    }

    fn compile_call(&mut self, func: &Expr, args: &[(Option<String>, Expr)]) -> Result<i64> {
        // ifelse is a builtin with the adjacent-register convention.
        if let Expr::Symbol(n) = func {
            if n == "ifelse"
                && args.len() == 3
                && args.iter().all(|(n, a)| n.is_none() && !matches!(a, Expr::Dots))
            {
                let rc = self.compile(&args[0].1)?;
                let ry = self.compile(&args[1].1)?;
                let rn = self.compile(&args[2].1)?;
                let y2 = self.alloc();
                let n2 = self.alloc();
                debug_assert_eq!(n2, y2 + 1);
                self.emit(Instruction::ac(Opcode::Mov, ry, y2));
                self.emit(Instruction::ac(Opcode::Mov, rn, n2));
                let out = self.alloc();
                self.emit(Instruction::abc(Opcode::Ifelse, rc, y2, out));
                return Ok(out);
            }
        }

        let heap = &self.global.heap;
        let rf = self.compile(func)?;

        let mut templates: Vec<Value> = Vec::new();
        let mut names: Vec<crate::intern::Symbol> = Vec::new();
        let mut any_named = false;
        let mut dot_index = args.len() as i64;
        for (i, (name, arg)) in args.iter().enumerate() {
            let v = match arg {
                Expr::Dots => {
                    dot_index = i as i64;
                    Value::nil()
                }
                Expr::Missing => Value::nil(),
                _ => match self.literal(arg) {
                    Some(v) => v,
                    None => self.compile_thunk(arg)?,
                },
            };
            templates.push(v);
            match name {
                Some(n) => {
                    any_named = true;
                    names.push(intern(n));
                }
                None => names.push(crate::intern::strings().empty),
            }
        }

        let mut arguments = Value::alloc_vector(heap, Type::List, templates.len());
        arguments.list_slice_mut().copy_from_slice(&templates);
        let names_v = if any_named {
            let mut v = Value::alloc_vector(heap, Type::Character, names.len());
            v.character_slice_mut().copy_from_slice(&names);
            v
        } else {
            Value::null()
        };

        let call_expr = call_to_value(heap, func, args);
        let cc = CompiledCall::new(call_expr, arguments, names_v, dot_index);
        self.calls.push(cc);
        let call_index = (self.calls.len() - 1) as i64;

        let out = self.alloc();
        self.emit(Instruction::abc(Opcode::Call, call_index, rf, out));
        Ok(out)
    }

    /// Lower an argument or default expression to a promise template.
    fn compile_thunk(&mut self, e: &Expr) -> Result<Value> {
        let mut inner = Compiler::new(self.global, 3);
        let r = inner.compile(e)?;
        inner.emit(Instruction::a(Opcode::Ret, r));
        let proto = inner.finish("thunk", Value::null(), Value::null(), 0, true, e);
        Ok(Value::promise_expression(
            &self.global.heap,
            proto,
            std::ptr::null_mut(),
        ))
    }

    fn compile_function(
        &mut self,
        params: &[(String, Option<Expr>)],
        body: &Expr,
    ) -> Result<Value> {
        let heap = &self.global.heap;
        let mut parameters = Value::alloc_vector(heap, Type::Character, params.len());
        let mut defaults = Value::alloc_vector(heap, Type::List, params.len());
        let mut dot_index = params.len() as i64;
        for (i, (name, default)) in params.iter().enumerate() {
            parameters.character_slice_mut()[i] = intern(name);
            if name == "..." {
                dot_index = i as i64;
            }
            let d = match default {
                None => Value::nil(),
                Some(e) => match self.literal(e) {
                    Some(v) => v,
                    None => self.compile_thunk(e)?,
                },
            };
            defaults.list_slice_mut()[i] = d;
        }

        let mut inner = Compiler::new(self.global, 0);
        let r = inner.compile(body)?;
        inner.emit(Instruction::a(Opcode::Ret, r));
        let proto = inner.finish("function", parameters, defaults, dot_index, true, body);
        Ok(Value::closure(heap, proto, std::ptr::null_mut()))
    }

    fn finish(
        self,
        name: &str,
        parameters: Value,
        defaults: Value,
        dot_index: i64,
        visible: bool,
        expr: &Expr,
    ) -> *const Prototype {
        Prototype::alloc(
            &self.global.heap,
            Prototype {
                expression: expr_to_value(&self.global.heap, expr),
                name: intern(name),
                parameters,
                defaults,
                dot_index,
                registers: self.max_reg,
                visible,
                constants: self.constants,
                calls: self.calls,
                bc: self.code,
            },
        )
    }
}

/// Compile a parsed program into a single prototype.
pub fn compile(global: &Global, exprs: &[Expr]) -> Result<*const Prototype> {
    let mut c = Compiler::new(global, 0);
    let mut last = None;
    for e in exprs {
        last = Some(c.compile(e)?);
    }
    let r = match last {
        Some(r) => r,
        None => {
            let k = c.constant(Value::null());
            let r = c.alloc();
            c.emit(Instruction::ac(Opcode::Kget, k, r));
            r
        }
    };
    c.emit(Instruction::a(Opcode::Ret, r));
    let visible = !matches!(exprs.last(), Some(Expr::Assign { .. }));
    let block = Expr::Block(exprs.to_vec());
    Ok(c.finish("top", Value::null(), Value::null(), 0, visible, &block))
}

/// The quoted-form value of an expression, for `__call__` bindings and
/// prototype source slots.
fn expr_to_value(heap: &crate::heap::Heap, e: &Expr) -> Value {
    match e {
        Expr::Integer(x) => Value::integer(*x),
        Expr::Double(x) => Value::double(*x),
        Expr::Str(s) => Value::character(intern(s)),
        Expr::Logical(b) => Value::logical(*b),
        Expr::Null => Value::null(),
        Expr::Symbol(n) => Value::symbol(intern(n)),
        Expr::Dots => Value::symbol(crate::intern::strings().dots),
        Expr::Missing => Value::nil(),
        Expr::Call(func, args) => call_to_value(heap, func, args),
        Expr::Binary(op, a, b) => {
            let name = match op {
                BinTok::Add => "+",
                BinTok::Sub => "-",
                BinTok::Mul => "*",
                BinTok::Div => "/",
                BinTok::Mod => "%%",
                BinTok::Pow => "^",
                BinTok::Eq => "==",
                BinTok::Neq => "!=",
                BinTok::Lt => "<",
                BinTok::Le => "<=",
                BinTok::Gt => ">",
                BinTok::Ge => ">=",
                BinTok::Colon => ":",
            };
            let c2 = Value::pairlist(heap, expr_to_value(heap, b), Value::null(), Value::nil());
            let c1 = Value::pairlist(heap, expr_to_value(heap, a), c2, Value::nil());
            Value::pairlist(heap, Value::symbol(intern(name)), c1, Value::nil())
        }
        Expr::Unary(op, a) => {
            let name = match op {
                UnTok::Neg => "-",
                UnTok::Not => "!",
            };
            let c1 = Value::pairlist(heap, expr_to_value(heap, a), Value::null(), Value::nil());
            Value::pairlist(heap, Value::symbol(intern(name)), c1, Value::nil())
        }
        Expr::Index(a, i) => {
            let c2 = Value::pairlist(heap, expr_to_value(heap, i), Value::null(), Value::nil());
            let c1 = Value::pairlist(heap, expr_to_value(heap, a), c2, Value::nil());
            Value::pairlist(heap, Value::symbol(intern("[[")), c1, Value::nil())
        }
        Expr::Function(..) => Value::symbol(intern("function")),
        Expr::If(..) => Value::symbol(intern("if")),
        Expr::Block(..) => Value::symbol(intern("{")),
        Expr::Assign { name, .. } => {
            let c1 = Value::pairlist(heap, Value::symbol(intern(name)), Value::null(), Value::nil());
            Value::pairlist(heap, Value::symbol(intern("<-")), c1, Value::nil())
        }
    }
}

fn call_to_value(heap: &crate::heap::Heap, func: &Expr, args: &[(Option<String>, Expr)]) -> Value {
    let mut form = Value::null();
    for (name, arg) in args.iter().rev() {
        let tag = match name {
            Some(n) => Value::symbol(intern(n)),
            None => Value::nil(),
        };
        form = Value::pairlist(heap, expr_to_value(heap, arg), form, tag);
    }
    Value::pairlist(heap, expr_to_value(heap, func), form, Value::nil())
}
