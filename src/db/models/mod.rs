mod account;
mod authz;
mod certificate;
mod order;

pub use account::*;
pub use authz::*;
pub use certificate::*;
pub use order::*;
