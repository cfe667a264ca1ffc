use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepo(String),

    #[error("Path is outside the repository: {0}")]
    OutsideRepository(String),

    #[error("Git operation failed: {0}")]
    GitOperationFailed(#[from] git2::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
