//! Repository traits for the referential stores.

pub mod access_requests;
pub mod archives;
pub mod objects;
pub mod offer_log;
pub mod tapes;

pub use access_requests::AccessRequestRepo;
pub use archives::ArchiveReferentialRepo;
pub use objects::ObjectReferentialRepo;
pub use offer_log::OfferLogRepo;
pub use tapes::TapeCatalogRepo;
