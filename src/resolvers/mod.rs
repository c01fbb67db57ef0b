//! Resolvers - Names, hardware IDs and groups
//!
//! The resolvers turn a request into array objects. Naming is pure; the
//! hardware-ID and group resolvers query the array through the client and
//! create what is missing.

pub mod groups;
pub mod hardware_id;
pub mod naming;

pub use groups::*;
pub use hardware_id::*;
pub use naming::*;
