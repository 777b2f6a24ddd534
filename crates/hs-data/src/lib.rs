pub mod gpu;
pub mod losses;
pub mod splitting;

pub use gpu::*;
pub use losses::*;
pub use splitting::*;
