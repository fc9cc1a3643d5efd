//! Plugins bundled with the UnMTA binary.

mod directory;

pub use directory::EmployeeDirectory;
