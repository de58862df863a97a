use crate::error_chain_fmt;

#[derive(thiserror::Error)]
pub enum AttemptTimerError {
    #[error("The attempt timer was disposed before it fired")]
    Disposed,
}
impl std::fmt::Debug for AttemptTimerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
