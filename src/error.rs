use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapperError {
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Circular reference, object '{0}' found twice")]
    CircularReference(String),
    #[error("Object must be stored in the mapper first: {0}")]
    NotPersisted(String),
    #[error("Type mismatch: {message}")]
    TypeDrift { message: String },
    #[error("{message}\n{hint}")]
    Resource { message: String, hint: String },
    #[error("Invalid query: {0}")]
    Query(String),
    #[error("Mapper misuse: {0}")]
    Misuse(String),
}

pub type Result<T> = std::result::Result<T, MapperError>;

const TMPDIR_HINT: &str =
    "You may want to change the directory used by sqlite to create temporary files \
to one that has enough free space. By default this directory is /tmp. \
You may achieve this by defining the SQLITE_TMPDIR environment variable.";

impl From<rusqlite::Error> for MapperError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DiskFull =>
            {
                Self::Resource {
                    message: e.to_string(),
                    hint: TMPDIR_HINT.to_string(),
                }
            }
            _ => Self::Persistence(e.to_string()),
        }
    }
}
