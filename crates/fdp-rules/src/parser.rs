//! Operator-precedence parser for rule conditions.
//!
//! Grammar (lowest binding first): `OR` < `AND` < `NOT` (prefix, right
//! binding) < comparisons and `IN`. Parentheses are explicit; calls are
//! restricted to the registered whitelist with string-literal arguments, so
//! everything outside the grammar fails at load time.

use crate::scanner::{scan, Token};
use fdp_schemas::{ListKind, ListType};
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// The whitelisted callables. Anything else is a parse error.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// `velocity_1h('<field>')`
    Velocity1h(String),
    /// `velocity_24h('<field>')`
    Velocity24h(String),
    /// `member_of('<allow|deny>', '<ip|device|user|card|country>')`
    MemberOf(ListType, ListKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    /// `[literal, …]` outside an `IN`; evaluates to a list value.
    ListLit(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// `expr IN [literal, …]`
    InList(Box<Expr>, Vec<Expr>),
    /// `expr IN name` — the name resolves to a list value in the context.
    InNamed(Box<Expr>, String),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

fn err<T>(message: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError {
        message: message.into(),
    })
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse one condition into an AST.
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let tokens = scan(src).map_err(|e| ParseError {
        message: e.to_string(),
    })?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_expr(0)?;
    if p.pos != p.tokens.len() {
        return err(format!("unexpected trailing token: {:?}", p.tokens[p.pos]));
    }
    Ok(expr)
}

const BP_OR: u8 = 1;
const BP_AND: u8 = 2;
const BP_NOT: u8 = 3;
const BP_CMP: u8 = 4;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Token) -> Result<(), ParseError> {
        match self.bump() {
            Some(ref t) if t == want => Ok(()),
            Some(t) => err(format!("expected {want:?}, found {t:?}")),
            None => err(format!("expected {want:?}, found end of condition")),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let (bp, tok) = match self.peek() {
                Some(Token::Or) => (BP_OR, Token::Or),
                Some(Token::And) => (BP_AND, Token::And),
                Some(Token::In) => (BP_CMP, Token::In),
                Some(t @ (Token::Lt | Token::Le | Token::Gt | Token::Ge | Token::EqEq | Token::Ne)) => {
                    (BP_CMP, t.clone())
                }
                _ => break,
            };
            if bp < min_bp {
                break;
            }
            self.bump();

            lhs = match tok {
                Token::Or => Expr::Or(Box::new(lhs), Box::new(self.parse_expr(BP_OR + 1)?)),
                Token::And => Expr::And(Box::new(lhs), Box::new(self.parse_expr(BP_AND + 1)?)),
                Token::In => self.parse_in_target(lhs)?,
                cmp => {
                    let op = match cmp {
                        Token::Lt => CmpOp::Lt,
                        Token::Le => CmpOp::Le,
                        Token::Gt => CmpOp::Gt,
                        Token::Ge => CmpOp::Ge,
                        Token::EqEq => CmpOp::Eq,
                        Token::Ne => CmpOp::Ne,
                        _ => unreachable!(),
                    };
                    Expr::Cmp(op, Box::new(lhs), Box::new(self.parse_expr(BP_CMP + 1)?))
                }
            };
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_expr(BP_NOT)?))),
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let items = self.parse_literal_list()?;
                err_if_empty(&items)?;
                Ok(Expr::ListLit(items))
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.bump();
                    self.parse_call(&name)
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(t) => err(format!("unexpected token: {t:?}")),
            None => err("empty condition"),
        }
    }

    /// Parse the right side of `IN`: a literal list or a named list.
    fn parse_in_target(&mut self, lhs: Expr) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(Token::LBracket) => {
                let items = self.parse_literal_list()?;
                err_if_empty(&items)?;
                Ok(Expr::InList(Box::new(lhs), items))
            }
            Some(Token::Ident(name)) => Ok(Expr::InNamed(Box::new(lhs), name)),
            Some(t) => err(format!("IN expects a list literal or name, found {t:?}")),
            None => err("IN expects a list literal or name"),
        }
    }

    fn parse_literal_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.bump();
            return Ok(items);
        }
        loop {
            match self.bump() {
                Some(Token::Num(n)) => items.push(Expr::Num(n)),
                Some(Token::Str(s)) => items.push(Expr::Str(s)),
                Some(Token::True) => items.push(Expr::Bool(true)),
                Some(Token::False) => items.push(Expr::Bool(false)),
                Some(t) => return err(format!("list literals hold scalars only, found {t:?}")),
                None => return err("unterminated list literal"),
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => break,
                Some(t) => return err(format!("expected ',' or ']', found {t:?}")),
                None => return err("unterminated list literal"),
            }
        }
        Ok(items)
    }

    /// Whitelisted calls only, string-argument form only.
    fn parse_call(&mut self, name: &str) -> Result<Expr, ParseError> {
        let args = self.parse_string_args()?;
        let call = match name {
            "velocity_1h" | "velocity_24h" => {
                if args.len() != 1 {
                    return err(format!("{name} takes exactly one string argument"));
                }
                let field = args.into_iter().next().expect("checked len");
                if field.is_empty() {
                    return err(format!("{name} field must be non-empty"));
                }
                if name == "velocity_1h" {
                    Call::Velocity1h(field)
                } else {
                    Call::Velocity24h(field)
                }
            }
            "member_of" => {
                if args.len() != 2 {
                    return err("member_of takes exactly two string arguments");
                }
                let list_type = ListType::parse(&args[0])
                    .ok_or_else(|| ParseError {
                        message: format!("member_of: unknown list type {:?}", args[0]),
                    })?;
                let kind = ListKind::parse(&args[1]).ok_or_else(|| ParseError {
                    message: format!("member_of: unknown list kind {:?}", args[1]),
                })?;
                Call::MemberOf(list_type, kind)
            }
            other => return err(format!("unknown function: {other}")),
        };
        Ok(Expr::Call(call))
    }

    fn parse_string_args(&mut self) -> Result<Vec<String>, ParseError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.bump();
            return Ok(args);
        }
        loop {
            match self.bump() {
                Some(Token::Str(s)) => args.push(s),
                Some(t) => {
                    return err(format!(
                        "function arguments must be string literals, found {t:?}"
                    ))
                }
                None => return err("unterminated argument list"),
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                Some(t) => return err(format!("expected ',' or ')', found {t:?}")),
                None => return err("unterminated argument list"),
            }
        }
        Ok(args)
    }
}

fn err_if_empty(items: &[Expr]) -> Result<(), ParseError> {
    if items.is_empty() {
        return err("empty list literal");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Prefetch plan
// ---------------------------------------------------------------------------

/// I/O the engine must resolve before evaluation: every velocity key and
/// list lookup the compiled ASTs can touch. Derived statically so evaluation
/// itself stays pure and CPU-bounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchPlan {
    /// `(window_secs, field)` pairs.
    pub velocity: BTreeSet<(u64, String)>,
    /// `(list_type, kind)` pairs reachable through `member_of`.
    pub lists: BTreeSet<(ListType, ListKind)>,
}

impl PrefetchPlan {
    pub fn collect(&mut self, expr: &Expr) {
        match expr {
            Expr::Call(Call::Velocity1h(field)) => {
                self.velocity
                    .insert((fdp_config::WINDOW_1H_SECS, field.clone()));
            }
            Expr::Call(Call::Velocity24h(field)) => {
                self.velocity
                    .insert((fdp_config::WINDOW_24H_SECS, field.clone()));
            }
            Expr::Call(Call::MemberOf(list_type, kind)) => {
                self.lists.insert((*list_type, *kind));
            }
            Expr::Not(inner) => self.collect(inner),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Cmp(_, l, r) => {
                self.collect(l);
                self.collect(r);
            }
            Expr::InList(l, _) | Expr::InNamed(l, _) => self.collect(l),
            Expr::Num(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Ident(_) | Expr::ListLit(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_or_binds_loosest() {
        // a AND b OR c  →  (a AND b) OR c
        let e = parse("a AND b OR c").unwrap();
        match e {
            Expr::Or(l, _) => assert!(matches!(*l, Expr::And(_, _))),
            other => panic!("expected Or at root, got {other:?}"),
        }
    }

    #[test]
    fn not_binds_looser_than_comparison() {
        // NOT a == b  →  NOT (a == b)
        let e = parse("NOT amount == 3").unwrap();
        match e {
            Expr::Not(inner) => assert!(matches!(*inner, Expr::Cmp(CmpOp::Eq, _, _))),
            other => panic!("expected Not at root, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_override() {
        let e = parse("a AND (b OR c)").unwrap();
        match e {
            Expr::And(_, r) => assert!(matches!(*r, Expr::Or(_, _))),
            other => panic!("expected And at root, got {other:?}"),
        }
    }

    #[test]
    fn in_with_literal_list_and_named_list() {
        let e = parse("merchant_country IN [\"RU\", \"IR\"]").unwrap();
        assert!(matches!(e, Expr::InList(_, ref items) if items.len() == 2));

        let e = parse("channel IN high_risk_channels").unwrap();
        assert!(matches!(e, Expr::InNamed(_, ref name) if name == "high_risk_channels"));
    }

    #[test]
    fn whitelisted_calls_parse() {
        assert_eq!(
            parse("velocity_1h('count') > 2").unwrap(),
            Expr::Cmp(
                CmpOp::Gt,
                Box::new(Expr::Call(Call::Velocity1h("count".into()))),
                Box::new(Expr::Num(2.0)),
            )
        );
        assert!(matches!(
            parse("member_of('deny', 'ip')").unwrap(),
            Expr::Call(Call::MemberOf(ListType::Deny, ListKind::Ip))
        ));
    }

    #[test]
    fn unknown_function_rejected() {
        let e = parse("exec('rm')").unwrap_err();
        assert!(e.message.contains("unknown function"));
    }

    #[test]
    fn non_string_call_arguments_rejected() {
        assert!(parse("velocity_1h(amount)").is_err());
        assert!(parse("velocity_1h(1)").is_err());
    }

    #[test]
    fn member_of_validates_type_and_kind() {
        assert!(parse("member_of('deny', 'ip')").is_ok());
        assert!(parse("member_of('block', 'ip')").is_err());
        assert!(parse("member_of('deny', 'email')").is_err());
        assert!(parse("member_of('deny')").is_err());
    }

    #[test]
    fn forbidden_constructs_fail_to_parse() {
        for bad in ["a = 1", "obj.attr", "arr[0] > 1", "a AND", "(a", "velocity_1h('x'"] {
            assert!(parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn prefetch_plan_collects_calls() {
        let e = parse(
            "velocity_1h('count') > 2 AND velocity_24h('amount') > 1000 OR member_of('deny', 'ip')",
        )
        .unwrap();
        let mut plan = PrefetchPlan::default();
        plan.collect(&e);
        assert!(plan.velocity.contains(&(3_600, "count".to_string())));
        assert!(plan.velocity.contains(&(86_400, "amount".to_string())));
        assert!(plan.lists.contains(&(ListType::Deny, ListKind::Ip)));
    }
}
