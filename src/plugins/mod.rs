//! Built-in calculation plugins

mod arithmetic;

pub use arithmetic::ArithmeticAdd;
