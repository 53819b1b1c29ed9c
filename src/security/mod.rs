pub mod guardrail;
pub mod lexer;
pub mod scope;

pub use guardrail::*;
pub use scope::*;
