pub mod adamw;
pub mod grad_clip;
pub mod sgd;
pub mod traits;

pub use adamw::{AdamW, AdamWConfig};
pub use grad_clip::clip_grad_norm;
pub use sgd::{Sgd, SgdConfig};
pub use traits::Optimizer;
