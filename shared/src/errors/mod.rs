mod launch_errors;
mod regfile_errors;
mod store_errors;

pub use launch_errors::LaunchError;
pub use regfile_errors::RegFileError;
pub use store_errors::StoreError;
