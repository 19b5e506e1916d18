//! One-shot results: a [`Promise`] writer paired with a [`ResultHandle`]
//! reader, backed by a lock-free hand-off cell. Grounded on
//! `examples/original_source/concurrencpp/src/results/result_core.h` and
//! `result.h`.

mod promise;
mod result;
mod state;

pub use promise::Promise;
pub use result::{Resolve, ResolveVia, ResultHandle};
pub use state::ResultStatus;
