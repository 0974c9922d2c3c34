mod entry;
mod fare;
mod ledger;
mod money;
mod ride;
mod user;
mod wallet;

pub use entry::*;
pub use fare::*;
pub use ledger::*;
pub use money::*;
pub use ride::*;
pub use user::*;
pub use wallet::*;
