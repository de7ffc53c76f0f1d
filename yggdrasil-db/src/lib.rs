pub mod document;
pub mod manager;
pub mod projects;
pub mod seq;
pub mod store;
pub mod store_couch;
pub mod store_memory;

pub use document::{
    DeliveryEntry, DeliveryInfo, DocumentError, NgiReportEntry, ProjectStatus, QcStatus, Sample,
    SampleStatus, UserContact, YggdrasilDocument,
};
pub use manager::{DbError, YggdrasilDbManager};
pub use projects::ProjectDbManager;
pub use seq::SeqTracker;
pub use store::{DocBackend, StoreError};
pub use store_couch::CouchBackend;
pub use store_memory::MemoryBackend;
