pub mod analyze;
pub mod catalogue;
pub mod init;
pub mod util;

pub use analyze::*;
pub use catalogue::*;
pub use init::*;
pub use util::*;
