//! Parsing for the supported subset of GNU linker scripts: input-list
//! commands (`GROUP`, `INPUT`, `AS_NEEDED`), `ENTRY`, `OUTPUT_FORMAT`,
//! `OUTPUT_ARCH`, `SEARCH_DIR`, and symbol assignments (`=`, `+=`,
//! `PROVIDE`, `PROVIDE_HIDDEN`, `HIDDEN`) whose right-hand sides are
//! expressions over integers, symbol values and `.`. Expressions are parsed
//! into RPN at read time and evaluated after layout, when section addresses
//! and symbol values are known.

use crate::args::InputSpec;
use crate::error::Result;
use anyhow::anyhow;
use anyhow::bail;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub(crate) struct ParsedScript {
    pub(crate) commands: Vec<Command>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Inputs(Vec<InputRequest>),
    Entry(String),
    SearchDir(PathBuf),
    OutputArch(String),
    /// Recorded but otherwise ignored; the backend determines the format.
    OutputFormat(String),
    Assignment(Assignment),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InputRequest {
    pub(crate) spec: InputSpec,
    pub(crate) as_needed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub(crate) name: String,
    pub(crate) kind: AssignmentKind,
    pub(crate) expression: RpnExpression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignmentKind {
    /// `name = expr;`: always defines, overriding an input definition.
    Force,
    /// `HIDDEN(name = expr)`: as `Force`, with hidden visibility.
    ForceHidden,
    /// `PROVIDE(name = expr)`: defines only if referenced and undefined.
    Provide,
    ProvideHidden,
}

impl AssignmentKind {
    pub(crate) fn is_hidden(self) -> bool {
        matches!(
            self,
            AssignmentKind::ForceHidden | AssignmentKind::ProvideHidden
        )
    }

    pub(crate) fn is_provide(self) -> bool {
        matches!(
            self,
            AssignmentKind::Provide | AssignmentKind::ProvideHidden
        )
    }
}

/// A symbol-assignment expression in reverse polish order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct RpnExpression {
    tokens: Vec<ExprToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExprToken {
    Number(u64),
    Symbol(String),
    /// The location counter.
    Dot,
    Op(Operator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Shr,
    BitAnd,
    BitOr,
}

impl Operator {
    fn precedence(self) -> u8 {
        match self {
            Operator::Mul | Operator::Div => 5,
            Operator::Add | Operator::Sub => 4,
            Operator::Shl | Operator::Shr => 3,
            Operator::BitAnd => 2,
            Operator::BitOr => 1,
        }
    }

    fn from_token(token: &str) -> Option<Operator> {
        match token {
            "+" => Some(Operator::Add),
            "-" => Some(Operator::Sub),
            "*" => Some(Operator::Mul),
            "/" => Some(Operator::Div),
            "<<" => Some(Operator::Shl),
            ">>" => Some(Operator::Shr),
            "&" => Some(Operator::BitAnd),
            "|" => Some(Operator::BitOr),
            _ => None,
        }
    }
}

impl RpnExpression {
    /// Evaluates the expression. `lookup` supplies symbol values; `dot` is
    /// the current location counter.
    pub(crate) fn evaluate(
        &self,
        lookup: &dyn Fn(&str) -> Option<u64>,
        dot: u64,
    ) -> Result<u64> {
        let mut stack: Vec<u64> = Vec::with_capacity(4);
        for token in &self.tokens {
            match token {
                ExprToken::Number(value) => stack.push(*value),
                ExprToken::Dot => stack.push(dot),
                ExprToken::Symbol(name) => stack.push(
                    lookup(name)
                        .ok_or_else(|| anyhow!("Undefined symbol `{name}` in script expression"))?,
                ),
                ExprToken::Op(op) => {
                    let rhs = stack.pop().ok_or_else(|| anyhow!("Malformed expression"))?;
                    let lhs = stack.pop().ok_or_else(|| anyhow!("Malformed expression"))?;
                    let value = match op {
                        Operator::Add => lhs.wrapping_add(rhs),
                        Operator::Sub => lhs.wrapping_sub(rhs),
                        Operator::Mul => lhs.wrapping_mul(rhs),
                        Operator::Div => {
                            if rhs == 0 {
                                bail!("Division by zero in script expression");
                            }
                            lhs / rhs
                        }
                        Operator::Shl => lhs.wrapping_shl(rhs as u32),
                        Operator::Shr => lhs.wrapping_shr(rhs as u32),
                        Operator::BitAnd => lhs & rhs,
                        Operator::BitOr => lhs | rhs,
                    };
                    stack.push(value);
                }
            }
        }
        match stack.as_slice() {
            [value] => Ok(*value),
            _ => bail!("Malformed expression"),
        }
    }
}

/// Parses a standalone expression, as used by `--defsym SYM=EXPR`.
pub(crate) fn parse_expression_text(text: &str) -> Result<RpnExpression> {
    let terminated = format!("{text} ;");
    let mut tokens = Tokeniser::new(&terminated);
    parse_expression(&mut tokens, ";")
}

pub(crate) fn parse_script(text: &str) -> Result<ParsedScript> {
    let mut tokens = Tokeniser::new(text);
    let mut commands = Vec::new();
    while let Some(token) = tokens.next() {
        commands.push(parse_command(&mut tokens, token)?);
    }
    Ok(ParsedScript { commands })
}

fn parse_command(tokens: &mut Tokeniser, token: &str) -> Result<Command> {
    match token {
        "GROUP" | "INPUT" => {
            tokens.expect("(")?;
            Ok(Command::Inputs(parse_input_list(tokens, false)?))
        }
        "AS_NEEDED" => {
            tokens.expect("(")?;
            Ok(Command::Inputs(parse_input_list(tokens, true)?))
        }
        "ENTRY" => Ok(Command::Entry(parse_single_arg(tokens, "ENTRY")?)),
        "SEARCH_DIR" => Ok(Command::SearchDir(PathBuf::from(parse_single_arg(
            tokens,
            "SEARCH_DIR",
        )?))),
        "OUTPUT_ARCH" => Ok(Command::OutputArch(parse_single_arg(
            tokens,
            "OUTPUT_ARCH",
        )?)),
        "OUTPUT_FORMAT" => {
            tokens.expect("(")?;
            let mut names = Vec::new();
            loop {
                let token = tokens
                    .next()
                    .ok_or_else(|| anyhow!("Unterminated OUTPUT_FORMAT"))?;
                if token == ")" {
                    break;
                }
                if token != "," {
                    names.push(token.to_owned());
                }
            }
            Ok(Command::OutputFormat(names.join(",")))
        }
        "PROVIDE" | "PROVIDE_HIDDEN" | "HIDDEN" => {
            let kind = match token {
                "PROVIDE" => AssignmentKind::Provide,
                "PROVIDE_HIDDEN" => AssignmentKind::ProvideHidden,
                _ => AssignmentKind::ForceHidden,
            };
            tokens.expect("(")?;
            let name = tokens
                .next()
                .ok_or_else(|| anyhow!("Missing symbol name in {token}"))?
                .to_owned();
            tokens.expect("=")?;
            let expression = parse_expression(tokens, ")")?;
            finish_statement(tokens);
            Ok(Command::Assignment(Assignment {
                name,
                kind,
                expression,
            }))
        }
        name => {
            // Anything else at top level must be `symbol = expr;` or
            // `symbol += expr;`.
            let op = tokens
                .next()
                .ok_or_else(|| anyhow!("Unsupported linker script command `{name}`"))?;
            let name = name.to_owned();
            match op {
                "=" => {
                    let expression = parse_expression(tokens, ";")?;
                    Ok(Command::Assignment(Assignment {
                        name,
                        kind: AssignmentKind::Force,
                        expression,
                    }))
                }
                "+=" => {
                    let mut expression = parse_expression(tokens, ";")?;
                    // Desugar `sym += expr` to `sym = sym + expr`.
                    expression.tokens.insert(0, ExprToken::Symbol(name.clone()));
                    expression.tokens.push(ExprToken::Op(Operator::Add));
                    Ok(Command::Assignment(Assignment {
                        name,
                        kind: AssignmentKind::Force,
                        expression,
                    }))
                }
                other => bail!("Unsupported linker script construct `{name} {other}`"),
            }
        }
    }
}

/// Consumes a trailing `;` if present. `PROVIDE(...)` may appear with or
/// without one.
fn finish_statement(tokens: &mut Tokeniser) {
    let mut lookahead = Tokeniser { text: tokens.text };
    if lookahead.next() == Some(";") {
        tokens.text = lookahead.text;
    }
}

fn parse_single_arg(tokens: &mut Tokeniser, command: &str) -> Result<String> {
    tokens.expect("(")?;
    let value = tokens
        .next()
        .ok_or_else(|| anyhow!("Missing argument to {command}"))?
        .to_owned();
    tokens.expect(")")?;
    Ok(value)
}

fn parse_input_list(tokens: &mut Tokeniser, as_needed: bool) -> Result<Vec<InputRequest>> {
    let mut out = Vec::new();
    loop {
        let token = tokens
            .next()
            .ok_or_else(|| anyhow!("Unterminated input list in script"))?;
        match token {
            ")" => return Ok(out),
            "AS_NEEDED" => {
                tokens.expect("(")?;
                out.extend(parse_input_list(tokens, true)?);
            }
            "," => {}
            arg => {
                let spec = if let Some(lib_name) = arg.strip_prefix("-l") {
                    InputSpec::Lib(Box::from(lib_name))
                } else {
                    InputSpec::File(Box::from(Path::new(arg)))
                };
                out.push(InputRequest { spec, as_needed });
            }
        }
    }
}

/// Parses an infix expression, ending at `terminator` (consumed), into RPN
/// via the shunting-yard algorithm.
fn parse_expression(tokens: &mut Tokeniser, terminator: &str) -> Result<RpnExpression> {
    let mut output = Vec::new();
    let mut operators: Vec<StackEntry> = Vec::new();

    loop {
        let token = tokens
            .next()
            .ok_or_else(|| anyhow!("Expression not terminated with `{terminator}`"))?;
        if token == terminator {
            break;
        }
        if token == "(" {
            operators.push(StackEntry::Paren);
        } else if token == ")" {
            loop {
                match operators.pop() {
                    Some(StackEntry::Op(op)) => output.push(ExprToken::Op(op)),
                    Some(StackEntry::Paren) => break,
                    None => bail!("Unbalanced parentheses in script expression"),
                }
            }
        } else if let Some(op) = Operator::from_token(token) {
            while let Some(StackEntry::Op(top)) = operators.last() {
                if top.precedence() >= op.precedence() {
                    output.push(ExprToken::Op(*top));
                    operators.pop();
                } else {
                    break;
                }
            }
            operators.push(StackEntry::Op(op));
        } else if token == "." {
            output.push(ExprToken::Dot);
        } else if let Some(value) = parse_number(token) {
            output.push(ExprToken::Number(value));
        } else {
            output.push(ExprToken::Symbol(token.to_owned()));
        }
    }

    while let Some(entry) = operators.pop() {
        match entry {
            StackEntry::Op(op) => output.push(ExprToken::Op(op)),
            StackEntry::Paren => bail!("Unbalanced parentheses in script expression"),
        }
    }
    if output.is_empty() {
        bail!("Empty script expression");
    }
    Ok(RpnExpression { tokens: output })
}

enum StackEntry {
    Op(Operator),
    Paren,
}

fn parse_number(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(kilo) = token.strip_suffix(['K', 'k']) {
        kilo.parse::<u64>().ok().map(|v| v * 1024)
    } else if let Some(mega) = token.strip_suffix(['M', 'm']) {
        mega.parse::<u64>().ok().map(|v| v * 1024 * 1024)
    } else if token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

struct Tokeniser<'a> {
    text: &'a str,
}

impl<'a> Tokeniser<'a> {
    fn new(text: &'a str) -> Self {
        Tokeniser { text }
    }

    fn next(&mut self) -> Option<&'a str> {
        loop {
            self.text = self.text.trim_start();
            // An unterminated comment swallows the rest of the script.
            if let Some(rest) = self.text.strip_prefix("/*") {
                self.text = rest.split_once("*/").map_or("", |(_, after)| after);
                continue;
            }
            if let Some(rest) = self.text.strip_prefix('#') {
                self.text = rest.split_once('\n').map_or("", |(_, after)| after);
                continue;
            }
            if self.text.is_empty() {
                return None;
            }
            // Multi-character operator tokens first so that `<<` doesn't
            // split.
            for op in ["<<", ">>", "+="] {
                if let Some(rest) = self.text.strip_prefix(op) {
                    self.text = rest;
                    return Some(op);
                }
            }
            let mut len = 0;
            for byte in self.text.as_bytes() {
                if b" \n\t(){};=+*&|,".contains(byte) {
                    break;
                }
                // `-` begins `-lfoo` within input lists but also acts as an
                // operator; treat it as a break unless it starts the token.
                if *byte == b'-' && len > 0 {
                    break;
                }
                len += 1;
            }
            if len == 0 {
                len = 1;
            }
            let token = &self.text[..len];
            self.text = &self.text[len..];
            return Some(token);
        }
    }

    fn expect(&mut self, expected: &str) -> Result {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => bail!("Expected `{expected}` in linker script, found `{token}`"),
            None => bail!("Expected `{expected}` in linker script, found end of input"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::assert_equal;

    fn input_specs(script: &ParsedScript) -> Vec<InputSpec> {
        script
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Inputs(requests) => {
                    Some(requests.iter().map(|r| r.spec.clone()).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_group_parsing() {
        let script = parse_script(
            r#"/* GNU ld script */
            GROUP ( libgcc_s.so.1 -lgcc )
        "#,
        )
        .unwrap();
        assert_equal(
            input_specs(&script),
            [
                InputSpec::File(Box::from(Path::new("libgcc_s.so.1"))),
                InputSpec::Lib(Box::from("gcc")),
            ],
        );
    }

    #[test]
    fn test_as_needed() {
        let script = parse_script(
            "GROUP ( /lib/libc.so.6 AS_NEEDED ( /lib/ld-linux.so.2 ) )",
        )
        .unwrap();
        let Command::Inputs(requests) = &script.commands[0] else {
            panic!("expected inputs");
        };
        assert!(!requests[0].as_needed);
        assert!(requests[1].as_needed);
    }

    #[test]
    fn test_entry_and_search_dir() {
        let script = parse_script("ENTRY(reset)\nSEARCH_DIR(/opt/lib)").unwrap();
        assert!(matches!(&script.commands[0], Command::Entry(name) if name == "reset"));
        assert!(
            matches!(&script.commands[1], Command::SearchDir(dir) if dir == Path::new("/opt/lib"))
        );
    }

    #[test]
    fn test_assignment_rpn() {
        let script = parse_script("__stack_top = 0x8000 + 16 * 4;").unwrap();
        let Command::Assignment(assignment) = &script.commands[0] else {
            panic!("expected assignment");
        };
        assert_eq!(assignment.kind, AssignmentKind::Force);
        let value = assignment.expression.evaluate(&|_| None, 0).unwrap();
        assert_eq!(value, 0x8000 + 64);
    }

    #[test]
    fn test_assignment_precedence_and_parens() {
        let script = parse_script("x = (1 + 2) * 3;").unwrap();
        let Command::Assignment(assignment) = &script.commands[0] else {
            panic!("expected assignment");
        };
        assert_eq!(assignment.expression.evaluate(&|_| None, 0).unwrap(), 9);
    }

    #[test]
    fn test_provide_and_dot() {
        let script = parse_script("PROVIDE(_end = . + 8);").unwrap();
        let Command::Assignment(assignment) = &script.commands[0] else {
            panic!("expected assignment");
        };
        assert_eq!(assignment.kind, AssignmentKind::Provide);
        assert_eq!(assignment.expression.evaluate(&|_| None, 0x100).unwrap(), 0x108);
    }

    #[test]
    fn test_plus_equals() {
        let script = parse_script("counter += 2;").unwrap();
        let Command::Assignment(assignment) = &script.commands[0] else {
            panic!("expected assignment");
        };
        let value = assignment
            .expression
            .evaluate(&|name| (name == "counter").then_some(40), 0)
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_symbol_lookup_failure() {
        let script = parse_script("x = missing + 1;").unwrap();
        let Command::Assignment(assignment) = &script.commands[0] else {
            panic!("expected assignment");
        };
        assert!(assignment.expression.evaluate(&|_| None, 0).is_err());
    }

    #[test]
    fn test_shift_tokenisation() {
        let script = parse_script("x = 1 << 12 | 3;").unwrap();
        let Command::Assignment(assignment) = &script.commands[0] else {
            panic!("expected assignment");
        };
        assert_eq!(
            assignment.expression.evaluate(&|_| None, 0).unwrap(),
            (1 << 12) | 3
        );
    }
}
