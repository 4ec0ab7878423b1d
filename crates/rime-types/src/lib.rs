pub use changes::{ChangeEvent, ChangesPage, Seq};
pub use package_name::{InvalidNameError, PackageName};
pub use packument::{
    trim, trim_bytes, DistEntry, Trimmed, TrimmedDist, TrimmedPackument, TrimmedVersion,
    VersionEntry,
};

mod changes;
mod package_name;
mod packument;
