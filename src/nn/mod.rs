pub mod linear;
pub mod loss;
pub mod module;
pub mod parameter;

pub use linear::Linear;
pub use loss::{LossKind, loss_and_grad};
pub use module::Module;
pub use parameter::Parameter;
