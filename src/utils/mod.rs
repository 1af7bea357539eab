pub mod cmd;
pub mod fmt;
pub mod hash;
pub mod io;
pub mod lvm;
pub mod mounts;
