pub mod parser;
pub mod tokens;
