mod expr;
mod kernel;
mod mark;
