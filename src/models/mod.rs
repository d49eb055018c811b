pub mod attempt;
pub mod batch;
pub mod chapter;
pub mod proxy;

pub use attempt::*;
pub use batch::*;
pub use chapter::*;
pub use proxy::*;
