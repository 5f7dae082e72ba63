use crate::dump::SchemaObjectKind;

/// Error type for the schemagate crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required file, directory or setting is missing. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every connection attempt allowed by the retry policy failed.
    #[error("exceeded maximum retry count ({attempts}) connecting to {target}: {source}")]
    ConnectionExhausted {
        target: String,
        attempts: u32,
        #[source]
        source: mysql::Error,
    },

    #[error("{0} name is required")]
    NameRequired(&'static str),

    /// A migration file failed. Its transaction(s) were rolled back and the run stopped.
    #[error("failed migration {name}: {source}")]
    MigrationExecution {
        name: String,
        #[source]
        source: mysql::Error,
    },

    #[error("error while dumping {kind} {name}: {reason}")]
    Dump {
        kind: SchemaObjectKind,
        name: String,
        reason: String,
    },

    /// The comparison itself could not run, as opposed to finding differences.
    #[error("schema comparison failed: {0}")]
    Comparison(String),

    /// Replaying the pending migrations did not converge on the checked-in snapshot.
    #[error("schemas differ after replaying migrations:\n{diff}")]
    ValidationFailure { diff: String },

    #[error("ephemeral infrastructure error: {0}")]
    Infrastructure(String),

    #[error("{0}")]
    Mysql(#[from] mysql::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
