pub mod pack;
pub mod store;
pub mod strings;

pub use pack::{PackArchive, PackEntry, PackWriter};
pub use store::DataStore;
pub use strings::StringResource;
