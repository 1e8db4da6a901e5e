use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Log Error - {0}")]
    Log(String),

    #[error("ObjectStore Error - {0}")]
    ObjectStore(String),

    #[error("Relational Error - {0}")]
    Relational(String),

    #[error("RawSink Error - {0}")]
    RawSink(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Window Error - {0}")]
    Window(String),

    #[error("CheckpointStore Error - {0}")]
    CheckpointStore(String),

    /// A commit was rejected because the partition was reassigned under a newer
    /// generation. Never retried.
    #[error("Fenced - partition {partition} is owned by generation {current_generation}")]
    Fenced {
        partition: u16,
        current_generation: u64,
    },

    #[error("Coordinator Error - {0}")]
    Coordinator(String),

    #[error("Worker Error - {0}")]
    Worker(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Fencing is the only permanent failure in the pipeline taxonomy; everything
    /// else is worth a bounded retry.
    pub(crate) fn is_transient(&self) -> bool {
        !matches!(self, Error::Fenced { .. })
    }
}
