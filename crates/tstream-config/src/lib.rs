// Declaration resolver: validate a user declaration and expand it into
// the flat, id-addressed component set the reconciler runs against.

mod declaration;
mod resolver;
mod validate;

pub use declaration::{Controls, Declaration, RawObject, classes};
pub use resolver::{ResolvedConfig, resolve};

pub use tstream_types::{Error, Result};
