//! Search engine filter expressions
//!
//! The grammar follows the engine's: `field = 'value'`, `field != 'value'`,
//! numeric comparisons, `field IN ['a', 'b']`, `field IS [NOT] NULL`, `NOT`,
//! `AND`, `OR` and parentheses. Expressions are built as an AST, rendered to
//! text for the engine, and parsed back for the in-process engine.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterParseError {
    #[error("Unexpected end of filter")]
    UnexpectedEnd,

    #[error("Unexpected token '{0}' at {1}")]
    UnexpectedToken(String, usize),

    #[error("Unterminated string starting at {0}")]
    UnterminatedString(usize),

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Number(f64),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "'{}'", escape(s)),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Boolean filter over document fields
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Compare {
        field: String,
        op: CompareOp,
        value: FilterValue,
    },
    In {
        field: String,
        values: Vec<FilterValue>,
    },
    IsNull {
        field: String,
        negated: bool,
    },
    Not(Box<FilterExpr>),
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
}

impl FilterExpr {
    pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::Compare {
            field: field.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<FilterValue>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::IsNull {
            field: field.into(),
            negated: true,
        }
    }

    /// Parse the engine's textual filter syntax
    pub fn parse(input: &str) -> Result<Self, FilterParseError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((token, at)) => Err(FilterParseError::UnexpectedToken(token.to_string(), *at)),
        }
    }

    /// Field names referenced anywhere in the expression
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Compare { field, .. } | Self::In { field, .. } | Self::IsNull { field, .. } => {
                out.push(field.as_str())
            }
            Self::Not(inner) => inner.collect_fields(out),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
        }
    }

    /// Evaluate against a JSON document
    ///
    /// String equality ignores ASCII case. A field holding an array matches
    /// when any element does. Missing fields count as null.
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        match self {
            Self::Compare { field, op, value } => match doc.get(field) {
                Some(Value::Array(items)) => items.iter().any(|v| compare(v, *op, value)),
                Some(v) => compare(v, *op, value),
                None => false,
            },
            Self::In { field, values } => match doc.get(field) {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|v| values.iter().any(|want| compare(v, CompareOp::Eq, want))),
                Some(v) => values.iter().any(|want| compare(v, CompareOp::Eq, want)),
                None => false,
            },
            Self::IsNull { field, negated } => {
                let is_null = matches!(doc.get(field), None | Some(Value::Null));
                is_null != *negated
            }
            Self::Not(inner) => !inner.matches(doc),
            Self::And(children) => children.iter().all(|c| c.matches(doc)),
            Self::Or(children) => children.iter().any(|c| c.matches(doc)),
        }
    }
}

fn compare(doc_value: &Value, op: CompareOp, want: &FilterValue) -> bool {
    match want {
        FilterValue::Number(n) => {
            let have = match doc_value {
                Value::Number(num) => num.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            let Some(have) = have else {
                return op == CompareOp::Ne;
            };
            match op {
                CompareOp::Eq => have == *n,
                CompareOp::Ne => have != *n,
                CompareOp::Gt => have > *n,
                CompareOp::Ge => have >= *n,
                CompareOp::Lt => have < *n,
                CompareOp::Le => have <= *n,
            }
        }
        FilterValue::Text(s) => {
            let have = match doc_value {
                Value::String(text) => text.clone(),
                Value::Number(num) => num.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return op == CompareOp::Ne,
            };
            let have = have.to_lowercase();
            let want = s.to_lowercase();
            match op {
                CompareOp::Eq => have == want,
                CompareOp::Ne => have != want,
                CompareOp::Gt => have > want,
                CompareOp::Ge => have >= want,
                CompareOp::Lt => have < want,
                CompareOp::Le => have <= want,
            }
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { field, op, value } => write!(f, "{} {} {}", field, op.as_str(), value),
            Self::In { field, values } => {
                let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{} IN [{}]", field, rendered.join(", "))
            }
            Self::IsNull { field, negated } => {
                if *negated {
                    write!(f, "{} IS NOT NULL", field)
                } else {
                    write!(f, "{} IS NULL", field)
                }
            }
            Self::Not(inner) => write!(f, "NOT ({})", inner),
            Self::And(children) => {
                let parts: Vec<String> = children
                    .iter()
                    .map(|c| match c {
                        Self::Or(_) => format!("({})", c),
                        _ => c.to_string(),
                    })
                    .collect();
                f.write_str(&parts.join(" AND "))
            }
            Self::Or(children) => {
                let parts: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                f.write_str(&parts.join(" OR "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CompareOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => f.write_str(s),
            Self::Str(s) => write!(f, "'{}'", s),
            Self::Num(n) => write!(f, "{}", n),
            Self::Op(op) => f.write_str(op.as_str()),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::LBracket => f.write_str("["),
            Self::RBracket => f.write_str("]"),
            Self::Comma => f.write_str(","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, FilterParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' | ')' | '[' | ']' | ',' => {
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    _ => Token::Comma,
                };
                tokens.push((token, start));
                i += 1;
            }
            '=' => {
                tokens.push((Token::Op(CompareOp::Eq), start));
                i += 1;
            }
            '!' | '>' | '<' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, next_is_eq) {
                    ('!', true) => CompareOp::Ne,
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    ('<', false) => CompareOp::Lt,
                    _ => return Err(FilterParseError::UnexpectedToken(c.to_string(), start)),
                };
                tokens.push((Token::Op(op), start));
                i += if next_is_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(FilterParseError::UnterminatedString(start)),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                value.push(escaped);
                                i += 2;
                            } else {
                                return Err(FilterParseError::UnterminatedString(start));
                            }
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(value), start));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| FilterParseError::InvalidNumber(text.clone()))?;
                tokens.push((Token::Num(n), start));
            }
            c if c.is_alphanumeric() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push((Token::Ident(text), start));
            }
            other => return Err(FilterParseError::UnexpectedToken(other.to_string(), start)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), FilterParseError> {
        let item = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(FilterParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(item)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), FilterParseError> {
        let (token, at) = self.next()?;
        match token {
            Token::Ident(s) if s.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(FilterParseError::UnexpectedToken(other.to_string(), at)),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr, FilterParseError> {
        let mut children = vec![self.parse_and()?];
        while self.peek_keyword("OR") {
            self.pos += 1;
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            FilterExpr::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<FilterExpr, FilterParseError> {
        let mut children = vec![self.parse_unary()?];
        while self.peek_keyword("AND") {
            self.pos += 1;
            children.push(self.parse_unary()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            FilterExpr::And(children)
        })
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, FilterParseError> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(FilterExpr::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            let (token, at) = self.next()?;
            if token != Token::RParen {
                return Err(FilterParseError::UnexpectedToken(token.to_string(), at));
            }
            return Ok(inner);
        }
        self.parse_condition()
    }

    fn parse_condition(&mut self) -> Result<FilterExpr, FilterParseError> {
        let (token, at) = self.next()?;
        let field = match token {
            Token::Ident(name) => name,
            other => return Err(FilterParseError::UnexpectedToken(other.to_string(), at)),
        };

        let (token, at) = self.next()?;
        match token {
            Token::Op(op) => {
                let value = self.parse_value()?;
                Ok(FilterExpr::Compare { field, op, value })
            }
            Token::Ident(kw) if kw.eq_ignore_ascii_case("IN") => {
                let values = self.parse_list()?;
                Ok(FilterExpr::In { field, values })
            }
            Token::Ident(kw) if kw.eq_ignore_ascii_case("NOT") => {
                self.expect_keyword("IN")?;
                let values = self.parse_list()?;
                Ok(FilterExpr::Not(Box::new(FilterExpr::In { field, values })))
            }
            Token::Ident(kw) if kw.eq_ignore_ascii_case("IS") => {
                let negated = if self.peek_keyword("NOT") {
                    self.pos += 1;
                    true
                } else {
                    false
                };
                self.expect_keyword("NULL")?;
                Ok(FilterExpr::IsNull { field, negated })
            }
            other => Err(FilterParseError::UnexpectedToken(other.to_string(), at)),
        }
    }

    fn parse_value(&mut self) -> Result<FilterValue, FilterParseError> {
        let (token, at) = self.next()?;
        match token {
            Token::Str(s) => Ok(FilterValue::Text(s)),
            Token::Num(n) => Ok(FilterValue::Number(n)),
            Token::Ident(s) => Ok(FilterValue::Text(s)),
            other => Err(FilterParseError::UnexpectedToken(other.to_string(), at)),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<FilterValue>, FilterParseError> {
        let (token, at) = self.next()?;
        if token != Token::LBracket {
            return Err(FilterParseError::UnexpectedToken(token.to_string(), at));
        }

        let mut values = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.pos += 1;
            return Ok(values);
        }
        loop {
            values.push(self.parse_value()?);
            let (token, at) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RBracket => break,
                other => return Err(FilterParseError::UnexpectedToken(other.to_string(), at)),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_render() {
        let expr = FilterExpr::And(vec![
            FilterExpr::eq("module_name", "Motor Vehicle Theft"),
            FilterExpr::Or(vec![
                FilterExpr::is_not_null("victim_name"),
                FilterExpr::is_not_null("suspect_name"),
            ]),
            FilterExpr::compare("submitted_at", CompareOp::Ge, 1_700_000_000i64),
        ]);

        assert_eq!(
            expr.to_string(),
            "module_name = 'Motor Vehicle Theft' AND (victim_name IS NOT NULL OR suspect_name IS NOT NULL) AND submitted_at >= 1700000000"
        );
    }

    #[test]
    fn test_render_escapes_quotes() {
        let expr = FilterExpr::eq("location", "O'Brien's yard");
        assert_eq!(expr.to_string(), r"location = 'O\'Brien\'s yard'");
        assert_eq!(FilterExpr::parse(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn test_parse_roundtrip() {
        let expr = FilterExpr::And(vec![
            FilterExpr::In {
                field: "module_name".into(),
                values: vec!["Arson".into(), "Death".into()],
            },
            FilterExpr::compare("submitted_at", CompareOp::Lt, 1_750_000_000i64),
            FilterExpr::Not(Box::new(FilterExpr::eq("urgency", "Low"))),
        ]);
        assert_eq!(FilterExpr::parse(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn test_parse_precedence() {
        let expr = FilterExpr::parse("a = 1 OR b = 2 AND c IS NULL").unwrap();
        match expr {
            FilterExpr::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], FilterExpr::And(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            FilterExpr::parse("module_name = 'open"),
            Err(FilterParseError::UnterminatedString(_))
        ));
        assert!(FilterExpr::parse("module_name =").is_err());
        assert!(FilterExpr::parse("module_name IS MAYBE").is_err());
    }

    #[test]
    fn test_fields() {
        let expr = FilterExpr::parse("a = 1 AND (b IS NULL OR a != 2) AND NOT c IN [1]").unwrap();
        assert_eq!(expr.fields(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_matches() {
        let d = doc(json!({
            "module_name": "Motor Vehicle Theft",
            "vehicle_registration": "KDA 123A",
            "victim_name": null,
            "submitted_at": 1_720_000_000,
            "tags": ["red", "sedan"]
        }));

        assert!(FilterExpr::parse("module_name = 'motor vehicle theft'").unwrap().matches(&d));
        assert!(FilterExpr::parse("vehicle_registration IS NOT NULL").unwrap().matches(&d));
        assert!(FilterExpr::parse("victim_name IS NULL").unwrap().matches(&d));
        assert!(FilterExpr::parse("missing IS NULL").unwrap().matches(&d));
        assert!(FilterExpr::parse("submitted_at >= 1700000000 AND submitted_at < 1730000000")
            .unwrap()
            .matches(&d));
        assert!(FilterExpr::parse("tags = 'sedan'").unwrap().matches(&d));
        assert!(FilterExpr::parse("module_name IN ['Arson', 'Motor Vehicle Theft']")
            .unwrap()
            .matches(&d));
        assert!(!FilterExpr::parse("module_name NOT IN ['Motor Vehicle Theft']")
            .unwrap()
            .matches(&d));
    }
}
