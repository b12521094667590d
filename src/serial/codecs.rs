/// Delimiter based line framing.
pub(crate) mod lines;
