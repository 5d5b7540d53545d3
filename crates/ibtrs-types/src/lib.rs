#[allow(non_snake_case)]
pub mod status_code;

pub mod status;

#[macro_use]
pub mod strong_type;

pub mod ids;
pub mod address;
pub mod host;

// Re-export commonly used items at the crate root.
pub use address::{Address, AddressParseError, AddressType};
pub use host::{MAX_HOSTNAME_LEN, local_hostname, truncate_hostname};
pub use ids::*;
pub use status::Status;
pub use status_code::*;
