mod confirm;
mod health_check;
mod submit;
// allow external `use` statements to skip the submodule path
pub use confirm::*;
pub use health_check::*;
pub use submit::*;
