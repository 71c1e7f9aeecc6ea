pub mod invoker;
pub mod prompt;
pub mod sanitize;
pub mod score;
pub mod spec;

pub use invoker::*;
pub use prompt::*;
pub use sanitize::*;
pub use score::*;
pub use spec::*;
