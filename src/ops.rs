mod product;
pub use product::{synchronize, SyncProduct};

mod supervisor;
pub use supervisor::supervisor_synthesis;
