pub(crate) mod executor;
pub(crate) mod latch;
pub(crate) mod run;
pub(crate) mod stream;
pub(crate) mod update;

#[cfg(test)]
pub(crate) mod tests;

pub use executor::{Reducer, ReducerConfig, RETRY_TIMEOUT_ENV};
pub use run::ForUpdateFuture;
pub use stream::RowStream;
pub use update::UpdateResult;
