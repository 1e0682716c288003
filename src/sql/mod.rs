pub mod ast;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod token;

pub use ast::{Expr, Statement};
pub use lexer::Lexer;
pub use parser::parse;
pub use resolver::{
    AggFunc, BoundExpr, BoundSelect, BoundStatement, ResolvedStatement, Resolver, ScalarFunc,
    StatementKind,
};
pub use token::{Keyword, Span, Token};
