pub mod backupset;

pub use backupset::{BackupSetConfig, load};
