pub mod error;
pub mod types;
pub mod value;

pub use error::ScriptBindError;
pub use types::*;
pub use value::*;
