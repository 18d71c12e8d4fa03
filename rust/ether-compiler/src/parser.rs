//! Recursive-descent parser producing the AST.
//!
//! Top-level `let` may omit `in`; the rest of the script becomes its body,
//! which is how scripts chain definitions. Everywhere else `in` is required.

use crate::ast::{Ast, AstNode, AstPattern, AstRef, Binop, MatchTable, Unop};
use crate::lexer::{Tok, Token};
use ether_core::attr::{Attr, AttrFlags};
use ether_core::location::Loc;
use ether_core::types;
use ether_core::value::Value;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected token at line {line}:{col}: {what}")]
    Unexpected { what: String, line: u32, col: u32 },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("{what} at line {line}:{col}")]
    Invalid { what: String, line: u32, col: u32 },
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: Option<Rc<str>>,
    /// Suppresses postfix `with`-update while a match/try scrutinee is parsed.
    no_with: bool,
    /// Interactive mode: every top-level binding becomes public so the REPL
    /// can carry it over to the next input.
    toplevel_pub: bool,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Parser {
        Parser { tokens, pos: 0, file: None, no_with: false, toplevel_pub: false }
    }

    pub fn with_file(mut self, file: Option<Rc<str>>) -> Parser {
        self.file = file;
        self
    }

    pub fn with_toplevel_pub(mut self, yes: bool) -> Parser {
        self.toplevel_pub = yes;
        self
    }

    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek2(&self) -> &Tok {
        const EOF: Tok = Tok::Eof;
        if self.pos + 1 < self.tokens.len() {
            &self.tokens[self.pos + 1].tok
        } else {
            &EOF
        }
    }

    fn loc(&self) -> Option<Loc> {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        Some(Loc::point(self.file.clone(), t.line, t.col))
    }

    fn bump(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn unexpected<T>(&self, what: &str) -> PResult<T> {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if t.tok == Tok::Eof {
            Err(ParseError::UnexpectedEof)
        } else {
            Err(ParseError::Unexpected {
                what: format!("{} (found {:?})", what, t.tok),
                line: t.line,
                col: t.col,
            })
        }
    }

    fn invalid<T>(&self, what: &str) -> PResult<T> {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        Err(ParseError::Invalid { what: what.to_string(), line: t.line, col: t.col })
    }

    fn expect(&mut self, tok: Tok, what: &str) -> PResult<()> {
        if self.eat(&tok) {
            Ok(())
        } else {
            self.unexpected(what)
        }
    }

    /// Whole program: a top-level sequence where `let` needs no `in`.
    pub fn parse_program(mut self) -> PResult<AstRef> {
        let body = self.parse_toplevel()?;
        if *self.peek() != Tok::Eof {
            return self.unexpected("end of input");
        }
        Ok(body)
    }

    fn parse_toplevel(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        match self.peek() {
            Tok::Eof => Ok(Ast::cval(Value::Nil, loc)),
            Tok::Import => {
                self.bump();
                let module = match self.bump() {
                    Tok::Ident(name) => name,
                    _ => return self.unexpected("module name after `import`"),
                };
                self.eat(&Tok::In); // optional at top level
                let body = self.parse_toplevel()?;
                Ok(Ast::import(&module, body, loc))
            }
            Tok::Let => {
                let (rec, mut pats, vals) = self.parse_let_head()?;
                if self.toplevel_pub {
                    for pat in &mut pats {
                        mark_pub(pat);
                    }
                }
                self.eat(&Tok::In); // optional at top level
                let body = self.parse_toplevel()?;
                Ok(if rec {
                    Ast::letrec(pats, vals, body, loc)
                } else {
                    Ast::let_(pats, vals, body, loc)
                })
            }
            _ => {
                let e = self.parse_nonseq()?;
                if self.eat(&Tok::Semi) {
                    let rest = self.parse_toplevel()?;
                    Ok(Ast::seq(e, rest, loc))
                } else {
                    Ok(e)
                }
            }
        }
    }

    /// Expression including `;` sequencing.
    fn parse_expr(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        let e1 = self.parse_nonseq()?;
        if self.eat(&Tok::Semi) {
            let e2 = self.parse_expr()?;
            Ok(Ast::seq(e1, e2, loc))
        } else {
            Ok(e1)
        }
    }

    fn at_prefix_form(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Let | Tok::If | Tok::Fn | Tok::Match | Tok::Try | Tok::Assert | Tok::Return
        )
    }

    fn parse_nonseq(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        match self.peek() {
            Tok::Let => {
                let (rec, pats, vals) = self.parse_let_head()?;
                self.expect(Tok::In, "`in` after let-bindings")?;
                let body = self.parse_nonseq()?;
                Ok(if rec {
                    Ast::letrec(pats, vals, body, loc)
                } else {
                    Ast::let_(pats, vals, body, loc)
                })
            }
            Tok::If => {
                self.bump();
                let cond = self.parse_nonseq()?;
                self.expect(Tok::Then, "`then`")?;
                let then = self.parse_nonseq()?;
                let els = if self.eat(&Tok::Else) {
                    self.parse_nonseq()?
                } else {
                    Ast::cval(Value::Nil, None)
                };
                Ok(Ast::iff(cond, then, els, loc))
            }
            Tok::Fn => {
                self.bump();
                let mut args = Vec::new();
                while !self.eat(&Tok::Arrow) {
                    args.push(self.parse_pattern_atom()?);
                }
                let body = self.parse_nonseq()?;
                Ok(Ast::fn_(args, body, loc))
            }
            Tok::Match => self.parse_match(),
            Tok::Try => self.parse_try(),
            Tok::Assert => {
                self.bump();
                let expr = self.parse_nonseq()?;
                Ok(Ast::assert(expr, loc))
            }
            Tok::Return => {
                self.bump();
                let expr = self.parse_nonseq()?;
                Ok(Ast::return_(expr, loc))
            }
            Tok::Ident(name) if *self.peek2() == Tok::Assign => {
                let name = name.clone();
                self.bump();
                self.bump();
                let val = self.parse_nonseq()?;
                Ok(Ast::assign(&name, val, loc))
            }
            _ => self.parse_pipe(),
        }
    }

    fn parse_pipe(&mut self) -> PResult<AstRef> {
        let mut lhs = self.parse_or()?;
        while *self.peek() == Tok::Pipe {
            let loc = self.loc();
            self.bump();
            let rhs = if self.at_prefix_form() {
                self.parse_nonseq()?
            } else {
                self.parse_or()?
            };
            // x |> f is an application of the pipe operator, so it can be
            // rebound like any identifier
            lhs = Ast::apply(Ast::ident("|>", loc.clone()), vec![lhs, rhs], loc);
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> PResult<AstRef> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Tok::OrOr {
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Ast::or(lhs, rhs, loc);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<AstRef> {
        let mut lhs = self.parse_cmp()?;
        while *self.peek() == Tok::AndAnd {
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_cmp()?;
            lhs = Ast::and(lhs, rhs, loc);
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> PResult<AstRef> {
        let mut lhs = self.parse_cons()?;
        loop {
            let op = match self.peek() {
                Tok::Lt => Binop::Lt,
                Tok::Le => Binop::Le,
                Tok::Gt => Binop::Gt,
                Tok::Ge => Binop::Ge,
                Tok::EqSym => Binop::Eq,
                Tok::Ne | Tok::BangEq => Binop::Ne,
                Tok::EqEq => Binop::Equal,
                Tok::IsKw => Binop::Is,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_cons()?;
            lhs = Ast::binop(op, lhs, rhs, loc);
        }
    }

    fn parse_cons(&mut self) -> PResult<AstRef> {
        let lhs = self.parse_add()?;
        if *self.peek() == Tok::ColonColon {
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_cons()?;
            Ok(Ast::binop(Binop::Cons, lhs, rhs, loc))
        } else {
            Ok(lhs)
        }
    }

    fn parse_add(&mut self) -> PResult<AstRef> {
        let mut lhs = self.parse_mul()?;
        loop {
            let loc = self.loc();
            match self.peek() {
                Tok::Plus => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = Ast::binop(Binop::Add, lhs, rhs, loc);
                }
                Tok::Minus => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = Ast::binop(Binop::Sub, lhs, rhs, loc);
                }
                Tok::PlusPlus => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = Ast::apply(Ast::ident("++", loc.clone()), vec![lhs, rhs], loc);
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_mul(&mut self) -> PResult<AstRef> {
        let mut lhs = self.parse_pow()?;
        loop {
            let op = match self.peek() {
                Tok::Star => Binop::Mul,
                Tok::Slash => Binop::Div,
                Tok::Mod => Binop::Mod,
                Tok::LandKw => Binop::Land,
                Tok::LorKw => Binop::Lor,
                Tok::LxorKw => Binop::Lxor,
                Tok::Lsl => Binop::Lshl,
                Tok::Lsr => Binop::Lshr,
                Tok::Asl => Binop::Ashl,
                Tok::Asr => Binop::Ashr,
                _ => return Ok(lhs),
            };
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_pow()?;
            lhs = Ast::binop(op, lhs, rhs, loc);
        }
    }

    fn parse_pow(&mut self) -> PResult<AstRef> {
        let lhs = self.parse_unary()?;
        if *self.peek() == Tok::Caret {
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_pow()?;
            Ok(Ast::binop(Binop::Pow, lhs, rhs, loc))
        } else {
            Ok(lhs)
        }
    }

    fn parse_unary(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        match self.peek() {
            Tok::Not => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Ast::unop(Unop::Not, expr, loc))
            }
            Tok::Lnot => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Ast::unop(Unop::Lnot, expr, loc))
            }
            Tok::Minus => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Ast::binop(
                    Binop::Sub,
                    Ast::cval(Value::num(0), loc.clone()),
                    expr,
                    loc,
                ))
            }
            _ => self.parse_app(),
        }
    }

    fn at_atom_start(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Num(_)
                | Tok::Str(_)
                | Tok::Quote(_)
                | Tok::Ident(_)
                | Tok::True
                | Tok::False
                | Tok::Nil
                | Tok::LParen
                | Tok::LBracket
                | Tok::LBrace
                | Tok::Dollar
                | Tok::DefinedQ
        )
    }

    fn parse_app(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        let f = self.parse_postfix()?;
        let mut args = Vec::new();
        while self.at_atom_start() {
            args.push(self.parse_postfix()?);
        }
        if args.is_empty() {
            Ok(f)
        } else {
            Ok(Ast::apply(f, args, loc))
        }
    }

    fn parse_postfix(&mut self) -> PResult<AstRef> {
        let mut expr = self.parse_atom()?;
        loop {
            let loc = self.loc();
            if *self.peek() == Tok::Dot {
                self.bump();
                match self.bump() {
                    Tok::Ident(field) => expr = Ast::access(expr, &field, loc),
                    _ => return self.unexpected("field name after '.'"),
                }
            } else if !self.no_with && *self.peek() == Tok::With && *self.peek2() == Tok::LBrace
            {
                self.bump();
                let fields = self.parse_record_fields()?;
                expr = Ast::update(expr, fields, loc);
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_atom(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        match self.peek().clone() {
            Tok::Num(n) => {
                self.bump();
                Ok(Ast::cval(Value::Num(n), loc))
            }
            Tok::Str(s) => {
                self.bump();
                Ok(Ast::cval(Value::str(s), loc))
            }
            Tok::True => {
                self.bump();
                Ok(Ast::cval(Value::Bool(true), loc))
            }
            Tok::False => {
                self.bump();
                Ok(Ast::cval(Value::Bool(false), loc))
            }
            Tok::Nil => {
                self.bump();
                Ok(Ast::cval(Value::Nil, loc))
            }
            Tok::Quote(tag) => {
                self.bump();
                if self.at_atom_start() {
                    let payload = self.parse_postfix()?;
                    Ok(Ast::mkrcrd(
                        types::variant_type(&tag),
                        vec![("_1".to_string(), payload)],
                        loc,
                    ))
                } else {
                    Ok(Ast::cval(Value::sym(&tag), loc))
                }
            }
            Tok::Ident(name) => {
                self.bump();
                Ok(Ast::ident(&name, loc))
            }
            Tok::DefinedQ => {
                self.bump();
                match self.bump() {
                    Tok::Ident(name) => Ok(Ast::defined(&name, loc)),
                    _ => self.unexpected("identifier after `defined?`"),
                }
            }
            Tok::Dollar => {
                self.bump();
                self.expect(Tok::LParen, "`(` after `$`")?;
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(Ast::evmac(expr, loc))
            }
            Tok::LParen => {
                self.bump();
                // operator name: (+), (::), ...
                if let Some(sym) = self.operator_name() {
                    if *self.peek2() == Tok::RParen {
                        self.bump();
                        self.bump();
                        return Ok(Ast::ident(&sym, loc));
                    }
                }
                if self.eat(&Tok::RParen) {
                    return Ok(Ast::cval(Value::Nil, loc));
                }
                let saved = std::mem::replace(&mut self.no_with, false);
                let first = self.parse_expr();
                self.no_with = saved;
                let first = first?;
                if self.eat(&Tok::Comma) {
                    let mut items = vec![first];
                    loop {
                        items.push(self.parse_nonseq()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RParen, "`)`")?;
                    let ty = types::tuple_type(items.len());
                    let fields = items
                        .into_iter()
                        .enumerate()
                        .map(|(i, e)| (format!("_{}", i + 1), e))
                        .collect();
                    Ok(Ast::mkrcrd(ty, fields, loc))
                } else {
                    self.expect(Tok::RParen, "`)`")?;
                    Ok(first)
                }
            }
            Tok::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_nonseq()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RBracket, "`]`")?;
                }
                let mut acc = Ast::cval(Value::Nil, None);
                for item in items.into_iter().rev() {
                    acc = Ast::binop(Binop::Cons, item, acc, loc.clone());
                }
                Ok(acc)
            }
            Tok::LBrace => {
                let fields = self.parse_record_fields()?;
                if fields.is_empty() {
                    return self.invalid("record must have at least one field");
                }
                let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
                let ty = types::record_type(&names);
                Ok(Ast::mkrcrd(ty, fields, loc))
            }
            _ => self.unexpected("expression"),
        }
    }

    /// `{ field = expr, shorthand, ... }`, braces included.
    fn parse_record_fields(&mut self) -> PResult<Vec<(String, AstRef)>> {
        self.expect(Tok::LBrace, "`{`")?;
        let mut fields = Vec::new();
        if self.eat(&Tok::RBrace) {
            return Ok(fields);
        }
        loop {
            let loc = self.loc();
            let name = match self.bump() {
                Tok::Ident(name) => name,
                _ => return self.unexpected("field name"),
            };
            let value = if self.eat(&Tok::EqSym) {
                self.parse_nonseq()?
            } else {
                Ast::ident(&name, loc)
            };
            fields.push((name, value));
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RBrace, "`}`")?;
        Ok(fields)
    }

    fn operator_name(&self) -> Option<String> {
        let sym = match self.peek() {
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Caret => "^",
            Tok::Mod => "mod",
            Tok::ColonColon => "::",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::EqSym => "=",
            Tok::Ne => "<>",
            Tok::EqEq => "==",
            Tok::IsKw => "is",
            Tok::Pipe => "|>",
            Tok::PlusPlus => "++",
            Tok::AndAnd => "&&",
            Tok::OrOr => "||",
            _ => return None,
        };
        Some(sym.to_string())
    }

    // -- let bindings --

    fn parse_let_head(&mut self) -> PResult<(bool, Vec<AstPattern>, Vec<AstRef>)> {
        self.expect(Tok::Let, "`let`")?;
        let rec = self.eat(&Tok::Rec);
        let mut pats = Vec::new();
        let mut vals = Vec::new();
        loop {
            let (pat, val) = self.parse_binding()?;
            pats.push(pat);
            vals.push(val);
            if !self.eat(&Tok::And) {
                break;
            }
        }
        Ok((rec, pats, vals))
    }

    fn parse_binding(&mut self) -> PResult<(AstPattern, AstRef)> {
        let mut flags = AttrFlags::empty();
        loop {
            if self.eat(&Tok::Pub) {
                flags |= AttrFlags::PUB;
            } else if self.eat(&Tok::Mut) {
                flags |= AttrFlags::MUT;
            } else {
                break;
            }
        }
        let attr = (!flags.is_empty()).then(|| Attr::new(flags));

        // operator rebinding: let (+) a b = ...
        let name = if *self.peek() == Tok::LParen {
            if let Some(sym) = {
                let save = self.pos;
                self.bump();
                let name = self.operator_name();
                if name.is_some() && *self.peek2() == Tok::RParen {
                    self.bump();
                    self.bump();
                } else {
                    self.pos = save;
                }
                if self.pos == save {
                    None
                } else {
                    name
                }
            } {
                Some(sym)
            } else {
                None
            }
        } else if let Tok::Ident(name) = self.peek() {
            let name = name.clone();
            self.bump();
            Some(name)
        } else {
            None
        };

        match name {
            Some(name) => {
                // function sugar: let f x y = e
                let mut args = Vec::new();
                while *self.peek() != Tok::EqSym {
                    args.push(self.parse_pattern_atom()?);
                }
                self.expect(Tok::EqSym, "`=`")?;
                let loc = self.loc();
                let mut val = self.parse_nonseq()?;
                if !args.is_empty() {
                    val = Ast::fn_(args, val, loc);
                }
                let pat = if name == "_" {
                    AstPattern::Dummy
                } else {
                    AstPattern::Ident { name, attr }
                };
                let val = self.wrap_mut(&pat, val);
                Ok((pat, val))
            }
            None => {
                let pat = self.parse_pattern()?;
                self.expect(Tok::EqSym, "`=`")?;
                let val = self.parse_nonseq()?;
                Ok((pat, val))
            }
        }
    }

    /// A `mut` binding stores a strong reference; identifier uses dereference
    /// it implicitly.
    fn wrap_mut(&self, pat: &AstPattern, val: AstRef) -> AstRef {
        match pat {
            AstPattern::Ident { attr: Some(attr), .. } if attr.is_mut() => {
                let loc = val.loc.clone();
                Ast::apply(Ast::ident("__ref", loc.clone()), vec![val], loc)
            }
            _ => val,
        }
    }

    // -- match / try --

    fn parse_scrutinee(&mut self) -> PResult<AstRef> {
        let saved = std::mem::replace(&mut self.no_with, true);
        let result = self.parse_pipe();
        self.no_with = saved;
        result
    }

    fn parse_match(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        self.expect(Tok::Match, "`match`")?;
        let expr = self.parse_scrutinee()?;
        self.expect(Tok::With, "`with`")?;
        self.eat(&Tok::Bar);
        let mut pats = Vec::new();
        let mut bodies = Vec::new();
        loop {
            pats.push(self.parse_pattern()?);
            self.expect(Tok::Arrow, "`->`")?;
            bodies.push(self.parse_nonseq()?);
            if !self.eat(&Tok::Bar) {
                break;
            }
        }

        // a tuple scrutinee matched only against same-arity tuple rows
        // becomes a multi-scrutinee match that compiles to a decision tree
        if let Some(ast) = self.try_multimatch(&expr, &pats, &bodies, &loc) {
            return Ok(ast);
        }

        let mut elsebr = Ast::apply(
            Ast::ident("raise", loc.clone()),
            vec![Ast::cval(Value::sym("type_error"), loc.clone())],
            loc.clone(),
        );
        for (pat, body) in pats.into_iter().zip(bodies).rev() {
            elsebr = Ast::match_(pat, expr.clone(), body, elsebr, loc.clone());
        }
        Ok(elsebr)
    }

    fn try_multimatch(
        &self,
        expr: &AstRef,
        pats: &[AstPattern],
        bodies: &[AstRef],
        loc: &Option<Loc>,
    ) -> Option<AstRef> {
        // decision trees dispatch on constructors only; anything with
        // constant or record leaves falls back to a nested match chain
        fn tree_compatible(pat: &AstPattern) -> bool {
            match pat {
                AstPattern::Dummy | AstPattern::Ident { .. } => true,
                AstPattern::Unpack { fields, alias: None, .. } => {
                    fields.iter().all(|(_, p)| tree_compatible(p))
                }
                _ => false,
            }
        }

        let AstNode::MkRcrd { ty, fields } = &expr.node else { return None };
        if !ty.is_tuple() || pats.len() < 2 {
            return None;
        }
        let width = fields.len();
        let mut rows = Vec::new();
        for pat in pats {
            let AstPattern::Unpack { ty: pty, fields: pfields, alias: None } = pat else {
                return None;
            };
            if !Rc::ptr_eq(pty, ty)
                || pfields.len() != width
                || !pfields.iter().all(|(_, p)| tree_compatible(p))
            {
                return None;
            }
            rows.push(pfields.iter().map(|(_, p)| p.clone()).collect());
        }
        let exprs = fields.iter().map(|(_, e)| e.clone()).collect();
        let table = MatchTable { rows, actions: bodies.to_vec() };
        Some(Ast::multimatch(table, exprs, loc.clone()))
    }

    fn parse_try(&mut self) -> PResult<AstRef> {
        let loc = self.loc();
        self.expect(Tok::Try, "`try`")?;
        let trybr = self.parse_nonseq()?;
        self.expect(Tok::With, "`with`")?;
        self.eat(&Tok::Bar);
        let mut pats = Vec::new();
        let mut handlers = Vec::new();
        loop {
            pats.push(self.parse_pattern()?);
            self.expect(Tok::Arrow, "`->`")?;
            handlers.push(self.parse_nonseq()?);
            if !self.eat(&Tok::Bar) {
                break;
            }
        }
        Ok(Ast::try_(pats, trybr, handlers, true, loc))
    }

    // -- patterns --

    fn parse_pattern(&mut self) -> PResult<AstPattern> {
        let pat = self.parse_pattern_cons()?;
        if self.eat(&Tok::As) {
            let alias = match self.bump() {
                Tok::Ident(name) => name,
                _ => return self.unexpected("identifier after `as`"),
            };
            match pat {
                AstPattern::Unpack { ty, fields, .. } => {
                    Ok(AstPattern::Unpack { ty, fields, alias: Some(alias) })
                }
                AstPattern::Record { fields, .. } => {
                    Ok(AstPattern::Record { fields, alias: Some(alias) })
                }
                AstPattern::RecordStar { attr, .. } => {
                    Ok(AstPattern::RecordStar { attr, alias: Some(alias) })
                }
                _ => self.invalid("`as` alias is only allowed on unpack patterns"),
            }
        } else {
            Ok(pat)
        }
    }

    fn parse_pattern_cons(&mut self) -> PResult<AstPattern> {
        let head = self.parse_pattern_atom()?;
        if self.eat(&Tok::ColonColon) {
            let tail = self.parse_pattern_cons()?;
            Ok(AstPattern::Unpack {
                ty: types::pair_type(),
                fields: vec![("car".to_string(), head), ("cdr".to_string(), tail)],
                alias: None,
            })
        } else {
            Ok(head)
        }
    }

    fn parse_pattern_atom(&mut self) -> PResult<AstPattern> {
        match self.peek().clone() {
            Tok::Num(n) => {
                self.bump();
                Ok(AstPattern::Constant(Value::Num(n)))
            }
            Tok::Str(s) => {
                self.bump();
                Ok(AstPattern::Constant(Value::str(s)))
            }
            Tok::True => {
                self.bump();
                Ok(AstPattern::Constant(Value::Bool(true)))
            }
            Tok::False => {
                self.bump();
                Ok(AstPattern::Constant(Value::Bool(false)))
            }
            Tok::Nil => {
                self.bump();
                Ok(AstPattern::Constant(Value::Nil))
            }
            Tok::Quote(tag) => {
                self.bump();
                if self.at_pattern_start() {
                    let payload = self.parse_pattern_atom()?;
                    Ok(AstPattern::Unpack {
                        ty: types::variant_type(&tag),
                        fields: vec![("_1".to_string(), payload)],
                        alias: None,
                    })
                } else {
                    Ok(AstPattern::Constant(Value::sym(&tag)))
                }
            }
            Tok::Ident(name) => {
                self.bump();
                if name == "_" {
                    Ok(AstPattern::Dummy)
                } else {
                    Ok(AstPattern::Ident { name, attr: None })
                }
            }
            Tok::LParen => {
                self.bump();
                if self.eat(&Tok::RParen) {
                    return Ok(AstPattern::Constant(Value::Nil));
                }
                let first = self.parse_pattern()?;
                if self.eat(&Tok::Comma) {
                    let mut items = vec![first];
                    loop {
                        items.push(self.parse_pattern()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RParen, "`)`")?;
                    let ty = types::tuple_type(items.len());
                    let fields = items
                        .into_iter()
                        .enumerate()
                        .map(|(i, p)| (format!("_{}", i + 1), p))
                        .collect();
                    Ok(AstPattern::Unpack { ty, fields, alias: None })
                } else {
                    self.expect(Tok::RParen, "`)`")?;
                    Ok(first)
                }
            }
            Tok::LBracket => {
                self.bump();
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.parse_pattern()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RBracket, "`]`")?;
                }
                let mut acc = AstPattern::Constant(Value::Nil);
                for item in items.into_iter().rev() {
                    acc = AstPattern::Unpack {
                        ty: types::pair_type(),
                        fields: vec![("car".to_string(), item), ("cdr".to_string(), acc)],
                        alias: None,
                    };
                }
                Ok(acc)
            }
            Tok::LBrace => {
                self.bump();
                if self.eat(&Tok::Star) {
                    self.expect(Tok::RBrace, "`}`")?;
                    return Ok(AstPattern::RecordStar { attr: None, alias: None });
                }
                let mut fields = Vec::new();
                loop {
                    let name = match self.bump() {
                        Tok::Ident(name) => name,
                        _ => return self.unexpected("field name in record pattern"),
                    };
                    let sub = if self.eat(&Tok::EqSym) {
                        self.parse_pattern()?
                    } else {
                        AstPattern::ident(&name)
                    };
                    fields.push((name, sub));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(Tok::RBrace, "`}`")?;
                Ok(AstPattern::Record { fields, alias: None })
            }
            _ => self.unexpected("pattern"),
        }
    }

    fn at_pattern_start(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Num(_)
                | Tok::Str(_)
                | Tok::Ident(_)
                | Tok::True
                | Tok::False
                | Tok::Nil
                | Tok::LParen
                | Tok::LBracket
                | Tok::LBrace
        )
    }
}

fn mark_pub(pat: &mut AstPattern) {
    match pat {
        AstPattern::Ident { attr, .. } | AstPattern::RecordStar { attr, .. } => {
            attr.get_or_insert_with(Attr::default).flags |= AttrFlags::PUB;
        }
        AstPattern::Unpack { fields, .. } | AstPattern::Record { fields, .. } => {
            for (_, sub) in fields {
                mark_pub(sub);
            }
        }
        AstPattern::Dummy | AstPattern::Constant(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(src: &str) -> AstRef {
        let tokens = Lexer::new(src).tokenize().unwrap();
        Parser::new(tokens).parse_program().unwrap()
    }

    #[test]
    fn test_precedence() {
        let ast = parse("1 + 2 * 3");
        match &ast.node {
            AstNode::Binop { op: Binop::Add, rhs, .. } => match &rhs.node {
                AstNode::Binop { op: Binop::Mul, .. } => {}
                other => panic!("expected mul on the right, got {:?}", other),
            },
            other => panic!("expected add at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_application_binds_tighter_than_ops() {
        let ast = parse("f 1 + g 2");
        match &ast.node {
            AstNode::Binop { op: Binop::Add, lhs, rhs } => {
                assert!(matches!(lhs.node, AstNode::Apply { .. }));
                assert!(matches!(rhs.node, AstNode::Apply { .. }));
            }
            other => panic!("expected add, got {:?}", other),
        }
    }

    #[test]
    fn test_let_function_sugar() {
        let ast = parse("let f x = x in f 1");
        match &ast.node {
            AstNode::Let { pats, vals, .. } => {
                assert!(matches!(&pats[0], AstPattern::Ident { name, .. } if name == "f"));
                assert!(matches!(vals[0].node, AstNode::Fn { .. }));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_toplevel_let_without_in() {
        let ast = parse("let x = 1\nx + 1");
        assert!(matches!(ast.node, AstNode::Let { .. }));
    }

    #[test]
    fn test_match_desugars_to_nested_matches() {
        let ast = parse("match x with 1 -> true | _ -> false");
        match &ast.node {
            AstNode::Match { pat, elsebr, .. } => {
                assert!(matches!(pat, AstPattern::Constant(_)));
                assert!(matches!(elsebr.node, AstNode::Match { .. }));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_tuple_match_becomes_multimatch() {
        let ast = parse("match (a, b) with (x, _) -> x | (_, y) -> y");
        match &ast.node {
            AstNode::Multimatch { table, exprs } => {
                assert_eq!(exprs.len(), 2);
                assert_eq!(table.rows.len(), 2);
            }
            other => panic!("expected multimatch, got {:?}", other),
        }
    }

    #[test]
    fn test_constant_rows_fall_back_to_match_chain() {
        // constants cannot drive the constructor decision tree
        let ast = parse("match (a, b) with (1, _) -> 1 | (_, _) -> 2");
        assert!(matches!(ast.node, AstNode::Match { .. }));
    }

    #[test]
    fn test_list_literal_is_cons_chain() {
        let ast = parse("[1, 2]");
        match &ast.node {
            AstNode::Binop { op: Binop::Cons, rhs, .. } => {
                assert!(matches!(rhs.node, AstNode::Binop { op: Binop::Cons, .. }));
            }
            other => panic!("expected cons, got {:?}", other),
        }
    }

    #[test]
    fn test_record_update() {
        let ast = parse("{ x = 1, y = 2 } with { y = 20 }");
        match &ast.node {
            AstNode::Update { src, fields } => {
                assert!(matches!(src.node, AstNode::MkRcrd { .. }));
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].0, "y");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_try_with_symbol_pattern() {
        let ast = parse("try raise `foo with `foo -> 42");
        match &ast.node {
            AstNode::Try { pats, check_exit, .. } => {
                assert!(matches!(&pats[0], AstPattern::Constant(Value::Sym(_))));
                assert!(*check_exit);
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_pipe_is_an_application() {
        let ast = parse("[1] |> f");
        match &ast.node {
            AstNode::Apply { f, args } => {
                assert!(matches!(&f.node, AstNode::Ident(name) if name == "|>"));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[test]
    fn test_variant_pattern_and_constructor() {
        let ast = parse("match x with `some v -> v | `none -> nil");
        match &ast.node {
            AstNode::Match { pat, .. } => {
                assert!(matches!(pat, AstPattern::Unpack { ty, .. } if ty.is_variant()));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_operator_rebinding() {
        let ast = parse("let (+) a b = a - b in 1 + 2");
        match &ast.node {
            AstNode::Let { pats, .. } => {
                assert!(matches!(&pats[0], AstPattern::Ident { name, .. } if name == "+"));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_mut_binding_wraps_in_ref() {
        let ast = parse("let mut x = 1 in x := 2");
        match &ast.node {
            AstNode::Let { vals, body, .. } => {
                match &vals[0].node {
                    AstNode::Apply { f, .. } => {
                        assert!(matches!(&f.node, AstNode::Ident(n) if n == "__ref"));
                    }
                    other => panic!("expected __ref wrap, got {:?}", other),
                }
                assert!(matches!(body.node, AstNode::Assign { .. }));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }
}
