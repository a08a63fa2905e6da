pub use anyhow::{anyhow, bail, Context as _, Error, Result};

#[derive(Debug)]
pub struct NoConnection(pub String);
impl std::error::Error for NoConnection {}
impl std::fmt::Display for NoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no connection: {}", self.0)
    }
}

#[derive(Debug)]
pub struct SkipManager;
impl std::error::Error for SkipManager {}
impl std::fmt::Display for SkipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "manager is not managed")
    }
}
