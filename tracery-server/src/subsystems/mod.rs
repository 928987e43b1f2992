pub mod canonicalize;
pub mod finalize;
pub mod persist;
pub mod segment;
pub mod synthesize;

#[cfg(test)]
pub(crate) mod testing;
