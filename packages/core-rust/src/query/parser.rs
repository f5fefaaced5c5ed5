//! Recursive-descent parser for the restricted SQL dialect.
//!
//! ```text
//! query      := SELECT [DISTINCT] ( '*' | derived, ... ) FROM table
//!               [WHERE condition] [GROUP BY column, ...]
//!               [ORDER BY value [ASC|DESC], ...] [LIMIT n [OFFSET m]]
//! condition  := and { OR and }
//! and        := not { AND not }
//! not        := NOT not | '(' condition ')' | predicate
//! predicate  := value ( op value | [NOT] BETWEEN value AND value
//!               | [NOT] IN '(' value, ... ')' | [NOT] LIKE value
//!               | IS [NOT] (NULL | TRUE | FALSE) )
//! ```

use super::ast::{
    AggregateFunction, ColumnReference, ComparisonOperator, DerivedColumn, Literal, Pagination,
    Predicate, QuerySpecification, ScalarFunction, SearchCondition, SelectList, SortDirection,
    SortSpecification, TruthValue, ValueExpression,
};
use super::lexer::Lexer;
use super::token::{Keyword, Token, TokenKind};
use super::QueryError;

/// Deepest nesting of parentheses, `NOT`s and function calls accepted.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Most `AND`/`OR` operands accepted in one query. Conditions are trees, so
/// a long chain is as deep as it is long.
pub const MAX_CONDITION_OPERANDS: usize = 1_000;

/// Parses one query.
///
/// # Errors
///
/// Returns [`QueryError::InvalidQuery`] for anything outside the grammar.
pub fn parse_query(sql: &str) -> Result<QuerySpecification, QueryError> {
    let tokens = Lexer::new(sql).tokenize()?;
    let mut parser = Parser::new(tokens);
    let query = parser.query()?;
    parser.expect(&TokenKind::Eof)?;
    Ok(query)
}

/// Parses a stand-alone search condition, as used for filters.
///
/// # Errors
///
/// Returns [`QueryError::InvalidQuery`] for anything outside the grammar.
pub fn parse_search_condition(sql: &str) -> Result<SearchCondition, QueryError> {
    let tokens = Lexer::new(sql).tokenize()?;
    let mut parser = Parser::new(tokens);
    let condition = parser.search_condition()?;
    parser.expect(&TokenKind::Eof)?;
    Ok(condition)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    operands: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            operands: 0,
        }
    }

    // -- helpers -------------------------------------------------------------

    fn current(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.check(&TokenKind::Keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), QueryError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {kind}")))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<(), QueryError> {
        self.expect(&TokenKind::Keyword(keyword))
    }

    fn error(&self, message: &str) -> QueryError {
        let token = self.current();
        QueryError::InvalidQuery(format!(
            "Encountered \"{}\" at position {}: {message}",
            token.kind, token.position
        ))
    }

    /// Runs `f` one nesting level down.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error("query is nested too deeply"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn count_operand(&mut self) -> Result<(), QueryError> {
        self.operands += 1;
        if self.operands > MAX_CONDITION_OPERANDS {
            return Err(self.error("too many AND/OR conditions"));
        }
        Ok(())
    }

    // -- statement -----------------------------------------------------------

    fn query(&mut self) -> Result<QuerySpecification, QueryError> {
        self.expect_keyword(Keyword::Select)?;
        let distinct = self.eat_keyword(Keyword::Distinct);
        let select_list = self.select_list()?;
        self.expect_keyword(Keyword::From)?;
        let table_name = self.table_name()?;

        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.search_condition()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By)?;
            loop {
                group_by.push(self.column_reference()?);
                if !self.eat_comma() {
                    break;
                }
            }
        }

        let mut order_by = Vec::new();
        if self.eat_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                let key = self.value_expression()?;
                let direction = if self.eat_keyword(Keyword::Asc) {
                    Some(SortDirection::Asc)
                } else if self.eat_keyword(Keyword::Desc) {
                    Some(SortDirection::Desc)
                } else {
                    None
                };
                order_by.push(SortSpecification { key, direction });
                if !self.eat_comma() {
                    break;
                }
            }
        }

        let pagination = if self.eat_keyword(Keyword::Limit) {
            let limit = self.unsigned_integer()?;
            let offset = if self.eat_keyword(Keyword::Offset) {
                Some(self.unsigned_integer()?)
            } else {
                None
            };
            Some(Pagination { limit, offset })
        } else {
            None
        };

        Ok(QuerySpecification {
            distinct,
            select_list,
            table_name,
            where_clause,
            group_by,
            order_by,
            pagination,
        })
    }

    fn eat_comma(&mut self) -> bool {
        if self.check(&TokenKind::Comma) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn select_list(&mut self) -> Result<SelectList, QueryError> {
        if self.check(&TokenKind::Star) {
            self.advance();
            return Ok(SelectList::Star);
        }
        let mut columns = Vec::new();
        loop {
            let expression = self.value_expression()?;
            let alias = if self.eat_keyword(Keyword::As) {
                Some(self.identifier()?)
            } else if matches!(
                self.current().kind,
                TokenKind::Identifier(_) | TokenKind::QuotedIdentifier(_)
            ) {
                Some(self.identifier()?)
            } else {
                None
            };
            columns.push(DerivedColumn { expression, alias });
            if !self.eat_comma() {
                return Ok(SelectList::Columns(columns));
            }
        }
    }

    fn table_name(&mut self) -> Result<String, QueryError> {
        match self.current().kind.clone() {
            TokenKind::Identifier(name)
            | TokenKind::QuotedIdentifier(name)
            | TokenKind::Number(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected a table name")),
        }
    }

    fn identifier(&mut self) -> Result<String, QueryError> {
        match self.current().kind.clone() {
            TokenKind::Identifier(name) | TokenKind::QuotedIdentifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected an identifier")),
        }
    }

    fn column_reference(&mut self) -> Result<ColumnReference, QueryError> {
        self.identifier().map(ColumnReference::new)
    }

    fn unsigned_integer(&mut self) -> Result<u64, QueryError> {
        if let TokenKind::Number(text) = &self.current().kind {
            if let Ok(value) = text.parse::<u64>() {
                self.advance();
                return Ok(value);
            }
        }
        Err(self.error("expected a non-negative integer"))
    }

    // -- search conditions ---------------------------------------------------

    fn search_condition(&mut self) -> Result<SearchCondition, QueryError> {
        let mut condition = self.boolean_term()?;
        while self.eat_keyword(Keyword::Or) {
            self.count_operand()?;
            let right = self.boolean_term()?;
            condition = SearchCondition::Or(Box::new(condition), Box::new(right));
        }
        Ok(condition)
    }

    fn boolean_term(&mut self) -> Result<SearchCondition, QueryError> {
        let mut condition = self.boolean_factor()?;
        while self.eat_keyword(Keyword::And) {
            self.count_operand()?;
            let right = self.boolean_factor()?;
            condition = SearchCondition::And(Box::new(condition), Box::new(right));
        }
        Ok(condition)
    }

    fn boolean_factor(&mut self) -> Result<SearchCondition, QueryError> {
        if self.eat_keyword(Keyword::Not) {
            let inner = self.nested(Self::boolean_factor)?;
            return Ok(SearchCondition::Not(Box::new(inner)));
        }
        if self.check(&TokenKind::LParen) {
            self.advance();
            let inner = self.nested(Self::search_condition)?;
            self.expect(&TokenKind::RParen)?;
            return Ok(SearchCondition::Nested(Box::new(inner)));
        }
        self.predicate().map(SearchCondition::Predicate)
    }

    fn predicate(&mut self) -> Result<Predicate, QueryError> {
        let expression = self.value_expression()?;
        if let Some(operator) = self.comparison_operator() {
            self.advance();
            let right = self.value_expression()?;
            return Ok(Predicate::Comparison {
                left: expression,
                operator,
                right,
            });
        }
        if self.eat_keyword(Keyword::Is) {
            let not = self.eat_keyword(Keyword::Not);
            let value = if self.eat_keyword(Keyword::Null) {
                TruthValue::Null
            } else if self.eat_keyword(Keyword::True) {
                TruthValue::True
            } else if self.eat_keyword(Keyword::False) {
                TruthValue::False
            } else {
                return Err(self.error("expected NULL, TRUE or FALSE"));
            };
            return Ok(Predicate::Is {
                expression,
                not,
                value,
            });
        }
        let not = self.eat_keyword(Keyword::Not);
        if self.eat_keyword(Keyword::Between) {
            let low = self.value_expression()?;
            self.expect_keyword(Keyword::And)?;
            let high = self.value_expression()?;
            return Ok(Predicate::Between {
                expression,
                not,
                low,
                high,
            });
        }
        if self.eat_keyword(Keyword::In) {
            self.expect(&TokenKind::LParen)?;
            let mut values = Vec::new();
            loop {
                values.push(self.value_expression()?);
                if !self.eat_comma() {
                    break;
                }
            }
            self.expect(&TokenKind::RParen)?;
            return Ok(Predicate::In {
                expression,
                not,
                values,
            });
        }
        if self.eat_keyword(Keyword::Like) {
            let pattern = self.value_expression()?;
            return Ok(Predicate::Like {
                expression,
                not,
                pattern,
            });
        }
        Err(self.error("expected a comparison, BETWEEN, IN, LIKE or IS"))
    }

    fn comparison_operator(&self) -> Option<ComparisonOperator> {
        match self.current().kind {
            TokenKind::Eq => Some(ComparisonOperator::Eq),
            TokenKind::Ne => Some(ComparisonOperator::Ne),
            TokenKind::Lt => Some(ComparisonOperator::Lt),
            TokenKind::Gt => Some(ComparisonOperator::Gt),
            TokenKind::Le => Some(ComparisonOperator::Le),
            TokenKind::Ge => Some(ComparisonOperator::Ge),
            _ => None,
        }
    }

    // -- value expressions ---------------------------------------------------

    fn value_expression(&mut self) -> Result<ValueExpression, QueryError> {
        match self.current().kind.clone() {
            TokenKind::String(value) => {
                self.advance();
                Ok(ValueExpression::Literal(Literal::String(value)))
            }
            TokenKind::Number(value) => {
                self.advance();
                Ok(ValueExpression::Literal(Literal::Number(value)))
            }
            TokenKind::Plus | TokenKind::Minus => {
                let sign = self.advance();
                match self.current().kind.clone() {
                    TokenKind::Number(value) => {
                        self.advance();
                        let value = if sign.kind == TokenKind::Minus {
                            format!("-{value}")
                        } else {
                            value
                        };
                        Ok(ValueExpression::Literal(Literal::Number(value)))
                    }
                    _ => Err(self.error("expected a number after the sign")),
                }
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(ValueExpression::Literal(Literal::Null))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(ValueExpression::Literal(Literal::Boolean(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(ValueExpression::Literal(Literal::Boolean(false)))
            }
            TokenKind::QuotedIdentifier(name) => {
                self.advance();
                Ok(ValueExpression::column(name))
            }
            TokenKind::Identifier(name) => {
                if self.peek_kind(1) == Some(&TokenKind::LParen) {
                    self.nested(|parser| parser.function_call(&name))
                } else {
                    self.advance();
                    match ScalarFunction::lookup(&name) {
                        Some(function) if function.allows_bare_form() => {
                            Ok(ValueExpression::Function {
                                function,
                                arguments: Vec::new(),
                                bare: true,
                            })
                        }
                        _ => Ok(ValueExpression::column(name)),
                    }
                }
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn function_call(&mut self, name: &str) -> Result<ValueExpression, QueryError> {
        if let Some(function) = AggregateFunction::lookup(name) {
            self.advance();
            self.expect(&TokenKind::LParen)?;
            if function == AggregateFunction::Count && self.check(&TokenKind::Star) {
                self.advance();
                self.expect(&TokenKind::RParen)?;
                return Ok(ValueExpression::Aggregate {
                    function,
                    distinct: false,
                    argument: None,
                });
            }
            let distinct = self.eat_keyword(Keyword::Distinct);
            let argument = self.value_expression()?;
            self.expect(&TokenKind::RParen)?;
            return Ok(ValueExpression::Aggregate {
                function,
                distinct,
                argument: Some(Box::new(argument)),
            });
        }
        let Some(function) = ScalarFunction::lookup(name) else {
            return Err(self.error(&format!("unsupported function {name}")));
        };
        self.advance();
        self.expect(&TokenKind::LParen)?;
        let mut arguments = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                arguments.push(self.value_expression()?);
                if !self.eat_comma() {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(ValueExpression::Function {
            function,
            arguments,
            bare: false,
        })
    }
}
