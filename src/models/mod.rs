pub mod record;
pub mod summary;
pub mod table;

pub use record::*;
pub use summary::*;
pub use table::*;
