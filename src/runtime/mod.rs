pub mod frame;
pub mod iter;
pub mod runtime_error;
pub mod vm_bc;

pub use runtime_error::{ErrorKind, RuntimeError, RuntimeResult};
pub use vm_bc::{Vm, VmConfig};
